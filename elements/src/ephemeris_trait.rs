// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;
use chrono::{DateTime, Local};

use crate::hardware_trait::Location;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunMoonTimes {
    // Next sunrise after the reference time.
    pub sunrise: DateTime<Local>,
    // Next sunset after the reference time.
    pub sunset: DateTime<Local>,
    pub moonrise: Option<DateTime<Local>>,
    pub moonset: Option<DateTime<Local>>,
}

pub trait EphemerisTrait: Send + Sync {
    /// Returns the rise and set times following `now` at `location`.
    /// NotFound if the sun does not cross the horizon (polar day or night).
    fn compute(&self, location: &Location, now: DateTime<Local>)
               -> Result<SunMoonTimes, CanonicalError>;
}
