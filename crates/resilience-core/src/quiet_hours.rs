use chrono::{DateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuietHoursError {
    #[error("invalid clock time '{0}', expected HH:MM")]
    InvalidClockTime(String),
}

/// Per-user window during which notifications are held back.
///
/// Minutes are counted from local midnight in `timezone`. `start == end`
/// means the window covers the whole day; `start > end` wraps midnight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuietHoursWindow {
    pub enabled: bool,
    pub start_minute: u16,
    pub end_minute: u16,
    /// IANA zone name, for example `Europe/Berlin`.
    pub timezone: String,
}

impl QuietHoursWindow {
    pub fn new(
        enabled: bool,
        start_minute: u16,
        end_minute: u16,
        timezone: impl Into<String>,
    ) -> Self {
        Self {
            enabled,
            start_minute,
            end_minute,
            timezone: timezone.into(),
        }
    }

    /// Build a window from stored `HH:MM` clock times.
    pub fn from_clock_strings(
        enabled: bool,
        start: &str,
        end: &str,
        timezone: impl Into<String>,
    ) -> Result<Self, QuietHoursError> {
        Ok(Self::new(
            enabled,
            parse_clock_minute(start)?,
            parse_clock_minute(end)?,
            timezone,
        ))
    }

    pub fn is_suppressed(&self, now: DateTime<Utc>) -> bool {
        is_suppressed(self, now)
    }
}

/// Whether notification delivery is suppressed for `window` at `now`.
///
/// An unknown timezone never suppresses.
pub fn is_suppressed(window: &QuietHoursWindow, now: DateTime<Utc>) -> bool {
    if !window.enabled {
        return false;
    }

    let tz: Tz = match window.timezone.trim().parse() {
        Ok(tz) => tz,
        Err(err) => {
            debug!(timezone = %window.timezone, error = %err, "quiet hours timezone not recognized");
            return false;
        }
    };

    let local = now.with_timezone(&tz);
    let current = (local.hour() * 60 + local.minute()) as u16;
    let (start, end) = (window.start_minute, window.end_minute);

    if start == end {
        true
    } else if start < end {
        start <= current && current < end
    } else {
        current >= start || current < end
    }
}

fn parse_clock_minute(value: &str) -> Result<u16, QuietHoursError> {
    let value = value.trim();
    let time = NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| QuietHoursError::InvalidClockTime(value.to_owned()))?;
    Ok((time.hour() * 60 + time.minute()) as u16)
}
