//! Business Calendar Module
//!
//! Time arithmetic for timers:
//! - [`Duration`] parsing (`"10 business minutes"`)
//! - Working week definition via [`Day`] and [`DayPart`]
//! - [`Holiday`] date ranges
//! - [`BusinessCalendar::add`] for business and calendar time

pub mod business;
pub mod day;
pub mod duration;
pub mod holiday;

use thiserror::Error;

pub use business::{BusinessCalendar, CalendarConfig};
pub use day::{Day, DayPart};
pub use duration::{BusinessUnits, Duration, DurationUnit};
pub use holiday::Holiday;

/// Errors raised while parsing calendar data or doing business-time math.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("unknown duration unit '{0}'")]
    UnknownUnit(String),

    #[error("invalid day part '{0}'")]
    InvalidDayPart(String),

    #[error("invalid holiday '{0}'")]
    InvalidHoliday(String),

    #[error("unknown weekday '{0}'")]
    UnknownWeekday(String),

    #[error("no business hours found within {0} days")]
    NoBusinessHours(u32),

    #[error("repeat interval '{0}' does not move the due date forward")]
    NonAdvancingRepeat(String),

    #[error("date out of range")]
    OutOfRange,
}
