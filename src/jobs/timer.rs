//! Repeat due dates for timers.

use chrono::NaiveDateTime;

use crate::calendar::{BusinessCalendar, CalendarError, Duration};

/// Next due date of a repeating timer.
///
/// Steps from `current` by `repeat` until the result lies after `now`, so a
/// worker that ran late does not leave the timer due in the past. The
/// number of steps is bounded by the elapsed time over the repeat interval.
pub fn next_due_date(
    current: NaiveDateTime,
    repeat: &Duration,
    calendar: &BusinessCalendar,
    now: NaiveDateTime,
) -> Result<NaiveDateTime, CalendarError> {
    if repeat.is_negative() || repeat.quantity() == 0.0 {
        return Err(CalendarError::NonAdvancingRepeat(repeat.to_string()));
    }

    let mut due = current;
    loop {
        let next = calendar.add(due, repeat)?;
        if next <= due {
            return Err(CalendarError::NonAdvancingRepeat(repeat.to_string()));
        }
        due = next;
        if due > now {
            return Ok(due);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2005, 4, day)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    #[test]
    fn test_overdue_timer_lands_after_now() {
        let calendar = BusinessCalendar::default();
        let repeat = Duration::parse("1 second").unwrap();
        let now = at(7, 10, 0, 0);

        let due = next_due_date(at(7, 9, 59, 57), &repeat, &calendar, now).unwrap();
        assert_eq!(due, at(7, 10, 0, 1));
    }

    #[test]
    fn test_future_timer_moves_one_interval() {
        let calendar = BusinessCalendar::default();
        let repeat = Duration::parse("1 hour").unwrap();

        let due = next_due_date(at(7, 12, 0, 0), &repeat, &calendar, at(7, 10, 0, 0)).unwrap();
        assert_eq!(due, at(7, 13, 0, 0));
    }

    #[test]
    fn test_business_repeat_skips_closed_hours() {
        let calendar = BusinessCalendar::default();
        let repeat = Duration::parse("1 business hour").unwrap();

        // Friday 16:30 + 1 business hour = Monday 9:30
        let due = next_due_date(at(8, 16, 30, 0), &repeat, &calendar, at(8, 16, 30, 0)).unwrap();
        assert_eq!(due, at(11, 9, 30, 0));
    }

    #[test]
    fn test_non_advancing_repeat_rejected() {
        let calendar = BusinessCalendar::default();
        let zero = Duration::parse("0 seconds").unwrap();
        let negative = Duration::parse("-5 minutes").unwrap();

        assert!(matches!(
            next_due_date(at(7, 9, 0, 0), &zero, &calendar, at(7, 10, 0, 0)),
            Err(CalendarError::NonAdvancingRepeat(_))
        ));
        assert!(next_due_date(at(7, 9, 0, 0), &negative, &calendar, at(7, 10, 0, 0)).is_err());
    }
}
