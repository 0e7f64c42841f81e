//! Duration expressions such as `"10 business minutes"` or `"-2 days"`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::CalendarError;

const SECOND: f64 = 1_000.0;
const MINUTE: f64 = 60.0 * SECOND;
const HOUR: f64 = 60.0 * MINUTE;
const DAY: f64 = 24.0 * HOUR;

/// Sizes of the business units that are not fixed by the clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessUnits {
    /// Business hours in a business day
    pub day_hours: f64,
    /// Business hours in a business week
    pub week_hours: f64,
    /// Business days in a business month
    pub month_days: f64,
    /// Business days in a business year
    pub year_days: f64,
}

impl Default for BusinessUnits {
    fn default() -> Self {
        Self {
            day_hours: 8.0,
            week_hours: 40.0,
            month_days: 21.0,
            year_days: 220.0,
        }
    }
}

/// Unit of a [`Duration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl DurationUnit {
    fn parse(text: &str) -> Option<Self> {
        let unit = match text.to_ascii_lowercase().as_str() {
            "ms" | "millisecond" | "milliseconds" => Self::Millisecond,
            "s" | "sec" | "second" | "seconds" => Self::Second,
            "min" | "minute" | "minutes" => Self::Minute,
            "h" | "hour" | "hours" => Self::Hour,
            "day" | "days" => Self::Day,
            "week" | "weeks" => Self::Week,
            "month" | "months" => Self::Month,
            "year" | "years" => Self::Year,
            _ => return None,
        };
        Some(unit)
    }

    /// Singular unit name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Millisecond => "millisecond",
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

/// A signed amount of time, either in calendar time or in business time.
///
/// Business durations only advance while a [`BusinessCalendar`] is inside
/// one of its day parts.
///
/// [`BusinessCalendar`]: super::BusinessCalendar
///
/// # Example
///
/// ```rust
/// use flowrunner::calendar::{Duration, DurationUnit};
///
/// let duration: Duration = "10 business minutes".parse().unwrap();
/// assert!(duration.is_business());
/// assert_eq!(duration.unit(), DurationUnit::Minute);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Duration {
    quantity: f64,
    unit: DurationUnit,
    business: bool,
}

impl Duration {
    pub fn new(quantity: f64, unit: DurationUnit, business: bool) -> Self {
        Self {
            quantity,
            unit,
            business,
        }
    }

    /// A calendar-time duration of the given number of milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Self::new(millis as f64, DurationUnit::Millisecond, false)
    }

    /// Parses `"<quantity> [business] <unit>"`.
    pub fn parse(text: &str) -> Result<Self, CalendarError> {
        let invalid = || CalendarError::InvalidDuration(text.to_string());
        let mut words = text.split_whitespace();

        let quantity: f64 = words
            .next()
            .ok_or_else(invalid)?
            .parse()
            .map_err(|_| invalid())?;
        if !quantity.is_finite() {
            return Err(invalid());
        }

        let mut word = words.next().ok_or_else(invalid)?;
        let business = word.eq_ignore_ascii_case("business");
        if business {
            word = words.next().ok_or_else(invalid)?;
        }

        let unit = DurationUnit::parse(word)
            .ok_or_else(|| CalendarError::UnknownUnit(word.to_string()))?;

        if words.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::new(quantity, unit, business))
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn unit(&self) -> DurationUnit {
        self.unit
    }

    pub fn is_business(&self) -> bool {
        self.business
    }

    pub fn is_negative(&self) -> bool {
        self.quantity < 0.0
    }

    /// Length in milliseconds; `OutOfRange` when it doesn't fit an `i64`.
    ///
    /// Days, weeks, months and years are sized by `units` for business
    /// durations and by the clock (30-day months, 365-day years) otherwise.
    pub fn to_millis(&self, units: &BusinessUnits) -> Result<i64, CalendarError> {
        let unit_millis = match (self.unit, self.business) {
            (DurationUnit::Millisecond, _) => 1.0,
            (DurationUnit::Second, _) => SECOND,
            (DurationUnit::Minute, _) => MINUTE,
            (DurationUnit::Hour, _) => HOUR,
            (DurationUnit::Day, true) => units.day_hours * HOUR,
            (DurationUnit::Day, false) => DAY,
            (DurationUnit::Week, true) => units.week_hours * HOUR,
            (DurationUnit::Week, false) => 7.0 * DAY,
            (DurationUnit::Month, true) => units.month_days * units.day_hours * HOUR,
            (DurationUnit::Month, false) => 30.0 * DAY,
            (DurationUnit::Year, true) => units.year_days * units.day_hours * HOUR,
            (DurationUnit::Year, false) => 365.0 * DAY,
        };
        let millis = (self.quantity * unit_millis).round();
        if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
            return Err(CalendarError::OutOfRange);
        }
        Ok(millis as i64)
    }
}

impl FromStr for Duration {
    type Err = CalendarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.quantity.fract() == 0.0 {
            write!(f, "{}", self.quantity as i64)?;
        } else {
            write!(f, "{}", self.quantity)?;
        }
        if self.business {
            write!(f, " business")?;
        }
        write!(f, " {}", self.unit.name())?;
        if self.quantity.abs() != 1.0 {
            write!(f, "s")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_business_duration() {
        let duration = Duration::parse("10 business minutes").unwrap();
        assert_eq!(duration.quantity(), 10.0);
        assert_eq!(duration.unit(), DurationUnit::Minute);
        assert!(duration.is_business());
        assert_eq!(duration.to_millis(&BusinessUnits::default()).unwrap(), 600_000);
    }

    #[test]
    fn test_parse_negative_and_fractional() {
        let duration = Duration::parse("-1.5 hours").unwrap();
        assert!(duration.is_negative());
        assert!(!duration.is_business());
        assert_eq!(duration.to_millis(&BusinessUnits::default()).unwrap(), -5_400_000);
    }

    #[test]
    fn test_business_day_uses_configured_hours() {
        let units = BusinessUnits::default();
        let business = Duration::parse("1 business day").unwrap();
        let calendar = Duration::parse("1 day").unwrap();
        assert_eq!(business.to_millis(&units).unwrap(), 8 * 3_600_000);
        assert_eq!(calendar.to_millis(&units).unwrap(), 24 * 3_600_000);

        let week = Duration::parse("2 business weeks").unwrap();
        assert_eq!(week.to_millis(&units).unwrap(), 80 * 3_600_000);
    }

    #[test]
    fn test_oversized_duration_is_out_of_range() {
        let duration = Duration::parse("1000000000000000 years").unwrap();
        assert!(matches!(
            duration.to_millis(&BusinessUnits::default()),
            Err(CalendarError::OutOfRange)
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Duration::parse("ten minutes"),
            Err(CalendarError::InvalidDuration(_))
        ));
        assert!(matches!(
            Duration::parse("3 fortnights"),
            Err(CalendarError::UnknownUnit(_))
        ));
        assert!(Duration::parse("5").is_err());
        assert!(Duration::parse("5 business").is_err());
        assert!(Duration::parse("5 minutes extra").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Duration::parse("10 business minutes").unwrap().to_string(),
            "10 business minutes"
        );
        assert_eq!(Duration::parse("1 hour").unwrap().to_string(), "1 hour");
        assert_eq!(Duration::parse("2.5 days").unwrap().to_string(), "2.5 days");
    }
}
