//! Board time source

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{A429Error, Result};

/// IRIG-B style board time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IrigTime {
    /// Day of year (1-366, 0 before the first sync)
    pub day: u16,
    /// Hour (0-23)
    pub hour: u8,
    /// Minute (0-59)
    pub minute: u8,
    /// Second (0-59)
    pub second: u8,
    /// Microsecond (0-999999)
    pub microsecond: u32,
}

impl IrigTime {
    const US_PER_SECOND: u64 = 1_000_000;
    const US_PER_DAY: u64 = 86_400 * Self::US_PER_SECOND;

    /// Build a validated time
    pub fn new(day: u16, hour: u8, minute: u8, second: u8, microsecond: u32) -> Result<Self> {
        if day > 366 || hour > 23 || minute > 59 || second > 59 || microsecond > 999_999 {
            return Err(A429Error::parameter_range(format!(
                "IRIG time {}:{:02}:{:02}:{:02}.{:06} out of range",
                day, hour, minute, second, microsecond
            )));
        }
        Ok(IrigTime {
            day,
            hour,
            minute,
            second,
            microsecond,
        })
    }

    /// Microseconds since day 0, 00:00:00
    pub fn as_micros(&self) -> u64 {
        u64::from(self.day) * Self::US_PER_DAY
            + u64::from(self.hour) * 3_600 * Self::US_PER_SECOND
            + u64::from(self.minute) * 60 * Self::US_PER_SECOND
            + u64::from(self.second) * Self::US_PER_SECOND
            + u64::from(self.microsecond)
    }

    /// Inverse of [`IrigTime::as_micros`], wrapping after day 366
    pub fn from_micros(micros: u64) -> Self {
        let day = (micros / Self::US_PER_DAY) % 367;
        let rest = micros % Self::US_PER_DAY;
        let seconds = rest / Self::US_PER_SECOND;
        IrigTime {
            day: day as u16,
            hour: (seconds / 3_600) as u8,
            minute: ((seconds / 60) % 60) as u8,
            second: (seconds % 60) as u8,
            microsecond: (rest % Self::US_PER_SECOND) as u32,
        }
    }
}

impl std::fmt::Display for IrigTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:03}:{:02}:{:02}:{:02}.{:06}",
            self.day, self.hour, self.minute, self.second, self.microsecond
        )
    }
}

/// Source of board time
pub trait TimeSource {
    /// Current board time
    fn now(&self) -> IrigTime;
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now(&self) -> IrigTime {
        (**self).now()
    }
}

/// Manually driven clock for simulation and tests
#[derive(Debug, Default)]
pub struct SimulatedClock {
    micros: Mutex<u64>,
}

impl SimulatedClock {
    /// Clock starting at the given time
    pub fn new(start: IrigTime) -> Self {
        SimulatedClock {
            micros: Mutex::new(start.as_micros()),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, time: IrigTime) {
        *self.micros.lock() = time.as_micros();
    }

    /// Advance by a number of microseconds
    pub fn advance_us(&self, micros: u64) {
        let mut now = self.micros.lock();
        *now = now.saturating_add(micros);
    }
}

impl TimeSource for SimulatedClock {
    fn now(&self) -> IrigTime {
        IrigTime::from_micros(*self.micros.lock())
    }
}
