// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use canonical_error::CanonicalError;
use chrono::{DateTime, Local};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudStatus {
    Cloudy,
    Clearing,
    Clear,
    // Monitor unavailable, stale or unparseable.
    Unknown,
}

impl CloudStatus {
    // Decodes the integer the cloud detector publishes: 0 cloudy, 1 clearing,
    // 2 clear. Anything else is Unknown.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => CloudStatus::Cloudy,
            1 => CloudStatus::Clearing,
            2 => CloudStatus::Clear,
            _ => CloudStatus::Unknown,
        }
    }
}

impl fmt::Display for CloudStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloudStatus::Cloudy => "cloudy",
            CloudStatus::Clearing => "clearing",
            CloudStatus::Clear => "clear",
            CloudStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

pub trait CloudMonitorTrait: Send {
    /// Never fails: any problem reading the published status is reported
    /// as CloudStatus::Unknown.
    fn read_status(&self) -> CloudStatus;

    /// Starts the background video cloud analysis, to run until `until`. The
    /// process is not supervised afterwards.
    fn spawn_video_analysis(&mut self, until: DateTime<Local>)
                            -> Result<(), CanonicalError>;
}

// mod tests.
