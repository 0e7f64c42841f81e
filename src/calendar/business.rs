//! Business Calendar
//!
//! Adds durations to points in time, skipping non-working hours, weekends
//! and holidays for business durations:
//! - A start outside business hours first moves to the next day part start
//! - Time is consumed day part by day part, carrying the remainder forward
//! - Negative durations walk backward through the same day parts

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};
use log::debug;
use serde::{Deserialize, Serialize};

use super::day::{Day, DayPart};
use super::duration::{BusinessUnits, Duration};
use super::holiday::Holiday;
use super::CalendarError;

/// How far the calendar searches for business hours before giving up.
const MAX_SEARCH_DAYS: u32 = 3660;

const WEEK_MILLIS: i64 = 7 * 24 * 3_600_000;

/// Serialized form of a business calendar.
///
/// ```yaml
/// weekdays:
///   monday: "9:00-12:00 & 12:30-17:00"
///   saturday: ""
/// holidays:
///   - "2005-12-25"
///   - "2005-07-01 - 2005-08-31"
/// units:
///   day_hours: 8
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Day parts per weekday name; missing weekdays are days off
    pub weekdays: BTreeMap<String, String>,
    /// Holiday dates or ranges
    pub holidays: Vec<String>,
    /// Sizes of business days, weeks, months and years
    pub units: BusinessUnits,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        let office_hours = "9:00-12:00 & 12:30-17:00";
        let weekdays = ["monday", "tuesday", "wednesday", "thursday", "friday"]
            .iter()
            .map(|day| (day.to_string(), office_hours.to_string()))
            .chain(
                ["saturday", "sunday"]
                    .iter()
                    .map(|day| (day.to_string(), String::new())),
            )
            .collect();

        Self {
            weekdays,
            holidays: Vec::new(),
            units: BusinessUnits::default(),
        }
    }
}

fn parse_weekday(name: &str) -> Result<Weekday, CalendarError> {
    let weekday = match name.to_ascii_lowercase().as_str() {
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        "sunday" | "sun" => Weekday::Sun,
        _ => return Err(CalendarError::UnknownWeekday(name.to_string())),
    };
    Ok(weekday)
}

/// Working week plus holidays.
///
/// # Example
///
/// ```rust
/// use chrono::NaiveDate;
/// use flowrunner::calendar::{BusinessCalendar, CalendarConfig, Duration};
///
/// let calendar = BusinessCalendar::from_config(&CalendarConfig::default()).unwrap();
/// let start = NaiveDate::from_ymd_opt(2005, 4, 7).unwrap().and_hms_opt(11, 55, 0).unwrap();
/// let due = calendar.add(start, &Duration::parse("10 business minutes").unwrap()).unwrap();
/// assert_eq!(due.format("%H:%M").to_string(), "12:35");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessCalendar {
    days: [Day; 7],
    holidays: Vec<Holiday>,
    units: BusinessUnits,
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        let office_hours = Day::parse("9:00-12:00 & 12:30-17:00").unwrap_or_default();
        let mut days: [Day; 7] = Default::default();
        for day in days.iter_mut().take(5) {
            *day = office_hours.clone();
        }
        Self::new(days, Vec::new(), BusinessUnits::default())
    }
}

impl BusinessCalendar {
    /// Creates a calendar from days indexed Monday first.
    pub fn new(days: [Day; 7], holidays: Vec<Holiday>, units: BusinessUnits) -> Self {
        Self {
            days,
            holidays,
            units,
        }
    }

    /// Builds a calendar from its configuration, validating every entry.
    pub fn from_config(config: &CalendarConfig) -> Result<Self, CalendarError> {
        let mut days: [Day; 7] = Default::default();
        for (name, parts) in &config.weekdays {
            let weekday = parse_weekday(name)?;
            days[weekday.num_days_from_monday() as usize] = Day::parse(parts)?;
        }

        let holidays = config
            .holidays
            .iter()
            .map(|text| Holiday::parse(text))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Business calendar: {} working days, {} holidays",
            days.iter().filter(|day| day.is_working_day()).count(),
            holidays.len()
        );

        Ok(Self::new(days, holidays, config.units))
    }

    pub fn day(&self, weekday: Weekday) -> &Day {
        &self.days[weekday.num_days_from_monday() as usize]
    }

    pub fn holidays(&self) -> &[Holiday] {
        &self.holidays
    }

    pub fn units(&self) -> &BusinessUnits {
        &self.units
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.iter().any(|holiday| holiday.includes(date))
    }

    /// Weekday schedule for `date`, ignoring holidays.
    pub fn find_day(&self, date: NaiveDate) -> &Day {
        self.day(date.weekday())
    }

    /// The day part containing `at`; `None` outside business hours.
    pub fn find_day_part(&self, at: NaiveDateTime) -> Option<DayPart> {
        self.parts_on(at.date())
            .iter()
            .find(|part| part.includes(at.time()))
            .copied()
    }

    pub fn is_business_time(&self, at: NaiveDateTime) -> bool {
        self.find_day_part(at).is_some()
    }

    /// Business milliseconds in the given weekday, for reporting.
    pub fn business_millis(&self, weekday: Weekday) -> i64 {
        self.day(weekday).business_millis()
    }

    /// Adds `duration` to `at`.
    ///
    /// Calendar durations are plain clock arithmetic. Business durations
    /// only count time inside day parts of non-holiday days.
    pub fn add(&self, at: NaiveDateTime, duration: &Duration) -> Result<NaiveDateTime, CalendarError> {
        let millis = duration.to_millis(&self.units)?;
        if !duration.is_business() {
            return at
                .checked_add_signed(chrono::Duration::milliseconds(millis))
                .ok_or(CalendarError::OutOfRange);
        }

        // At most a week's business hours fit into each week left.
        let span = if millis >= 0 {
            NaiveDate::MAX.signed_duration_since(at.date())
        } else {
            at.date().signed_duration_since(NaiveDate::MIN)
        };
        let week: i64 = self.days.iter().map(Day::business_millis).sum();
        let reach = i128::from(span.num_milliseconds()) * i128::from(week) / i128::from(WEEK_MILLIS);
        if week > 0 && i128::from(millis).abs() > reach {
            return Err(CalendarError::OutOfRange);
        }

        if millis >= 0 {
            self.add_forward(at, millis)
        } else {
            self.add_backward(at, -millis)
        }
    }

    fn add_forward(&self, at: NaiveDateTime, mut remaining: i64) -> Result<NaiveDateTime, CalendarError> {
        let (mut cursor, mut part_end) = match self.find_day_part(at) {
            Some(part) => (at, part.end_on(at.date())),
            None => self.next_part_start(at)?,
        };

        loop {
            let available = (part_end - cursor).num_milliseconds();
            if remaining <= available {
                return Ok(cursor + chrono::Duration::milliseconds(remaining));
            }
            remaining -= available;
            (cursor, part_end) = self.next_part_start(part_end)?;
        }
    }

    fn add_backward(&self, at: NaiveDateTime, mut remaining: i64) -> Result<NaiveDateTime, CalendarError> {
        let containing = self
            .parts_on(at.date())
            .iter()
            .find(|part| part.from() < at.time() && at.time() <= part.to())
            .map(|part| part.start_on(at.date()));

        let (mut cursor, mut part_start) = match containing {
            Some(start) => (at, start),
            None => self.previous_part_end(at)?,
        };

        loop {
            let available = (cursor - part_start).num_milliseconds();
            if remaining <= available {
                return Ok(cursor - chrono::Duration::milliseconds(remaining));
            }
            remaining -= available;
            (cursor, part_start) = self.previous_part_end(part_start)?;
        }
    }

    fn parts_on(&self, date: NaiveDate) -> &[DayPart] {
        if self.is_holiday(date) {
            &[]
        } else {
            self.find_day(date).parts()
        }
    }

    /// Midnight of the first non-holiday day after `date`.
    pub fn find_start_of_next_day(&self, date: NaiveDate) -> Result<NaiveDateTime, CalendarError> {
        let mut next = date.succ_opt().ok_or(CalendarError::OutOfRange)?;
        for _ in 0..=MAX_SEARCH_DAYS {
            if !self.is_holiday(next) {
                return next.and_hms_opt(0, 0, 0).ok_or(CalendarError::OutOfRange);
            }
            next = next.succ_opt().ok_or(CalendarError::OutOfRange)?;
        }
        Err(CalendarError::NoBusinessHours(MAX_SEARCH_DAYS))
    }

    /// First day part starting at or after `at`, as `(start, end)`.
    fn next_part_start(&self, at: NaiveDateTime) -> Result<(NaiveDateTime, NaiveDateTime), CalendarError> {
        let mut date = at.date();
        let mut after = Some(at.time());

        for _ in 0..=MAX_SEARCH_DAYS {
            let parts = self.parts_on(date);
            let found = match after {
                Some(time) => parts.iter().find(|part| part.from() >= time),
                None => parts.first(),
            };
            if let Some(part) = found {
                return Ok((part.start_on(date), part.end_on(date)));
            }
            date = self.find_start_of_next_day(date)?.date();
            after = None;
        }

        Err(CalendarError::NoBusinessHours(MAX_SEARCH_DAYS))
    }

    /// Last day part ending at or before `at`, as `(end, start)`.
    fn previous_part_end(&self, at: NaiveDateTime) -> Result<(NaiveDateTime, NaiveDateTime), CalendarError> {
        let mut date = at.date();
        let mut before = Some(at.time());

        for _ in 0..=MAX_SEARCH_DAYS {
            let parts = self.parts_on(date);
            let found = match before {
                Some(time) => parts.iter().rev().find(|part| part.to() <= time),
                None => parts.last(),
            };
            if let Some(part) = found {
                return Ok((part.end_on(date), part.start_on(date)));
            }
            date = date.pred_opt().ok_or(CalendarError::OutOfRange)?;
            before = None;
        }

        Err(CalendarError::NoBusinessHours(MAX_SEARCH_DAYS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn minutes(text: &str) -> Duration {
        Duration::parse(text).unwrap()
    }

    #[test]
    fn test_business_minutes_skip_lunch_break() {
        let calendar = BusinessCalendar::default();
        let due = calendar
            .add(at("2005-04-07 11:55:00"), &minutes("10 business minutes"))
            .unwrap();
        assert_eq!(due, at("2005-04-07 12:35:00"));
    }

    #[test]
    fn test_business_minutes_skip_weekend() {
        let calendar = BusinessCalendar::default();
        let due = calendar
            .add(at("2005-04-08 16:55:00"), &minutes("10 business minutes"))
            .unwrap();
        assert_eq!(due, at("2005-04-11 09:05:00"));
    }

    #[test]
    fn test_start_outside_hours_moves_to_next_part() {
        let calendar = BusinessCalendar::default();
        let due = calendar
            .add(at("2005-04-07 07:00:00"), &minutes("1 business hour"))
            .unwrap();
        assert_eq!(due, at("2005-04-07 10:00:00"));
    }

    #[test]
    fn test_holidays_are_skipped() {
        let mut config = CalendarConfig::default();
        config.holidays.push("2005-04-11".to_string());
        let calendar = BusinessCalendar::from_config(&config).unwrap();

        let due = calendar
            .add(at("2005-04-08 16:55:00"), &minutes("10 business minutes"))
            .unwrap();
        assert_eq!(due, at("2005-04-12 09:05:00"));
        assert!(!calendar.is_business_time(at("2005-04-11 10:00:00")));
    }

    #[test]
    fn test_negative_business_duration_walks_backward() {
        let calendar = BusinessCalendar::default();
        let due = calendar
            .add(at("2005-04-07 12:35:00"), &minutes("-10 business minutes"))
            .unwrap();
        assert_eq!(due, at("2005-04-07 11:55:00"));

        let due = calendar
            .add(at("2005-04-11 09:05:00"), &minutes("-10 business minutes"))
            .unwrap();
        assert_eq!(due, at("2005-04-08 16:55:00"));
    }

    #[test]
    fn test_calendar_time_is_plain_arithmetic() {
        let calendar = BusinessCalendar::default();
        let due = calendar
            .add(at("2005-04-08 16:55:00"), &minutes("10 minutes"))
            .unwrap();
        assert_eq!(due, at("2005-04-08 17:05:00"));
    }

    #[test]
    fn test_business_day_spans_full_working_day() {
        let calendar = BusinessCalendar::default();
        // 7.5 business hours per day in the default week; 8 are requested.
        let due = calendar
            .add(at("2005-04-07 09:00:00"), &minutes("1 business day"))
            .unwrap();
        assert_eq!(due, at("2005-04-08 09:30:00"));
    }

    #[test]
    fn test_no_business_hours_is_an_error() {
        let config = CalendarConfig {
            weekdays: BTreeMap::new(),
            ..CalendarConfig::default()
        };
        let calendar = BusinessCalendar::from_config(&config).unwrap();
        let result = calendar.add(at("2005-04-07 09:00:00"), &minutes("1 business hour"));
        assert!(matches!(result, Err(CalendarError::NoBusinessHours(_))));
    }

    #[test]
    fn test_huge_durations_are_out_of_range() {
        let calendar = BusinessCalendar::default();
        let start = at("2005-04-07 09:00:00");
        assert!(matches!(
            calendar.add(start, &minutes("1000000 years")),
            Err(CalendarError::OutOfRange)
        ));
        assert!(matches!(
            calendar.add(start, &minutes("-1000000 years")),
            Err(CalendarError::OutOfRange)
        ));
        assert!(matches!(
            calendar.add(start, &minutes("1000000 business years")),
            Err(CalendarError::OutOfRange)
        ));
    }

    #[test]
    fn test_start_of_next_day_skips_holidays() {
        let mut config = CalendarConfig::default();
        config.holidays.push("2005-04-08".to_string());
        let calendar = BusinessCalendar::from_config(&config).unwrap();

        let date = NaiveDate::from_ymd_opt(2005, 4, 6).unwrap();
        assert_eq!(
            calendar.find_start_of_next_day(date).unwrap(),
            at("2005-04-07 00:00:00")
        );
        let date = NaiveDate::from_ymd_opt(2005, 4, 7).unwrap();
        assert_eq!(
            calendar.find_start_of_next_day(date).unwrap(),
            at("2005-04-09 00:00:00")
        );
    }

    #[test]
    fn test_unknown_weekday_rejected() {
        let mut config = CalendarConfig::default();
        config.weekdays.insert("funday".to_string(), "9:00-10:00".to_string());
        assert!(matches!(
            BusinessCalendar::from_config(&config),
            Err(CalendarError::UnknownWeekday(_))
        ));
    }

    #[test]
    fn test_find_day_part() {
        let calendar = BusinessCalendar::default();
        let part = calendar.find_day_part(at("2005-04-07 12:45:00")).unwrap();
        assert_eq!(part.to_string(), "12:30-17:00");
        assert!(calendar.find_day_part(at("2005-04-09 10:00:00")).is_none());
        assert_eq!(calendar.business_millis(Weekday::Sat), 0);
    }
}
