//! Holidays: inclusive date ranges excluded from business time.

use chrono::NaiveDate;

use super::CalendarError;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holiday {
    from: NaiveDate,
    to: NaiveDate,
}

impl Holiday {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, CalendarError> {
        if to < from {
            return Err(CalendarError::InvalidHoliday(format!("{} - {}", from, to)));
        }
        Ok(Self { from, to })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            from: date,
            to: date,
        }
    }

    /// Parses a single date (`2005-12-25` or `25/12/2005`) or a range
    /// separated by `" - "`.
    pub fn parse(text: &str) -> Result<Self, CalendarError> {
        let invalid = || CalendarError::InvalidHoliday(text.to_string());
        match text.split_once(" - ") {
            Some((from, to)) => {
                let from = parse_date(from).ok_or_else(invalid)?;
                let to = parse_date(to).ok_or_else(invalid)?;
                Self::new(from, to).map_err(|_| invalid())
            }
            None => parse_date(text).map(Self::single).ok_or_else(invalid),
        }
    }

    pub fn includes(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_single_holiday() {
        let holiday = Holiday::parse("2005-12-25").unwrap();
        assert!(holiday.includes(date(2005, 12, 25)));
        assert!(!holiday.includes(date(2005, 12, 26)));
    }

    #[test]
    fn test_range_in_day_first_format() {
        let holiday = Holiday::parse("01/07/2005 - 31/08/2005").unwrap();
        assert!(holiday.includes(date(2005, 7, 1)));
        assert!(holiday.includes(date(2005, 8, 31)));
        assert!(!holiday.includes(date(2005, 9, 1)));
    }

    #[test]
    fn test_invalid_holidays() {
        assert!(Holiday::parse("christmas").is_err());
        assert!(Holiday::parse("2005-12-31 - 2005-12-01").is_err());
    }
}
