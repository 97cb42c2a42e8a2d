//! Time source for version stamps
//!
//! Injected wherever a timestamp is recorded so tests can pin the time.

use chrono::{DateTime, Local, TimeZone};

/// Format used for `version_date` and as the prefix of `version_name`
pub const VERSION_DATE_FORMAT: &str = "%Y%m%d%H%M%S";

pub trait Clock {
    fn now(&self) -> DateTime<Local>;

    /// Current time rendered as a version date
    fn version_date(&self) -> String {
        self.now().format(VERSION_DATE_FORMAT).to_string()
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A clock stuck at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Local>);

impl FixedClock {
    /// Build from local calendar fields. Nonexistent local times fall back
    /// to the epoch.
    pub fn at(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        let instant = Local
            .with_ymd_and_hms(year, month, day, hour, min, sec)
            .earliest()
            .unwrap_or_default();
        Self(instant)
    }

    /// Move the clock forward
    pub fn advance(&mut self, seconds: i64) {
        self.0 += chrono::Duration::seconds(seconds);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.0
    }
}
