//! Working days and the business-hour intervals they contain.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use super::CalendarError;

/// A business-hour interval within a day, `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayPart {
    from: NaiveTime,
    to: NaiveTime,
}

impl DayPart {
    pub fn new(from: NaiveTime, to: NaiveTime) -> Result<Self, CalendarError> {
        if to <= from {
            return Err(CalendarError::InvalidDayPart(format!(
                "{}-{}",
                from.format("%H:%M"),
                to.format("%H:%M")
            )));
        }
        Ok(Self { from, to })
    }

    /// Parses `"9:00-12:00"`.
    pub fn parse(text: &str) -> Result<Self, CalendarError> {
        let invalid = || CalendarError::InvalidDayPart(text.to_string());
        let (from, to) = text.split_once('-').ok_or_else(invalid)?;
        let from = parse_time(from).ok_or_else(invalid)?;
        let to = parse_time(to).ok_or_else(invalid)?;
        Self::new(from, to).map_err(|_| invalid())
    }

    pub fn from(&self) -> NaiveTime {
        self.from
    }

    pub fn to(&self) -> NaiveTime {
        self.to
    }

    pub fn start_on(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.from)
    }

    pub fn end_on(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.to)
    }

    pub fn includes(&self, time: NaiveTime) -> bool {
        self.from <= time && time < self.to
    }

    pub fn millis(&self) -> i64 {
        (self.to - self.from).num_milliseconds()
    }
}

impl fmt::Display for DayPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from.format("%-H:%M"), self.to.format("%-H:%M"))
    }
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    let (hour, minute) = text.trim().split_once(':')?;
    NaiveTime::from_hms_opt(hour.trim().parse().ok()?, minute.trim().parse().ok()?, 0)
}

/// The ordered, non-overlapping day parts of one weekday.
///
/// A day without parts is not a working day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Day {
    parts: Vec<DayPart>,
}

impl Day {
    pub fn new(mut parts: Vec<DayPart>) -> Result<Self, CalendarError> {
        parts.sort_by_key(|part| part.from);
        for pair in parts.windows(2) {
            if pair[1].from < pair[0].to {
                return Err(CalendarError::InvalidDayPart(format!(
                    "{} overlaps {}",
                    pair[1], pair[0]
                )));
            }
        }
        Ok(Self { parts })
    }

    /// Parses `"9:00-12:00 & 12:30-17:00"`; an empty string is a day off.
    pub fn parse(text: &str) -> Result<Self, CalendarError> {
        let parts = text
            .split('&')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(DayPart::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(parts)
    }

    pub fn parts(&self) -> &[DayPart] {
        &self.parts
    }

    pub fn is_working_day(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Part containing `time`, if any.
    pub fn part_at(&self, time: NaiveTime) -> Option<&DayPart> {
        self.parts.iter().find(|part| part.includes(time))
    }

    /// Business milliseconds in the whole day.
    pub fn business_millis(&self) -> i64 {
        self.parts.iter().map(DayPart::millis).sum()
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.parts.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(" & "))
    }
}
