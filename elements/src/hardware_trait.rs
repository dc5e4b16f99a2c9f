// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use canonical_error::CanonicalError;
use serde::{Deserialize, Serialize};

/// Quality of a GPS position reading. Ordered so that "better" compares
/// greater.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord,
         Serialize, Deserialize)]
pub enum FixQuality {
    #[default]
    #[serde(rename = "N")]
    NoLock,
    #[serde(rename = "2D")]
    Fix2d,
    #[serde(rename = "3D")]
    Fix3d,
}

impl FixQuality {
    /// A fix trustworthy enough that the station stops re-polling the GPS.
    pub fn is_locked(&self) -> bool {
        *self != FixQuality::NoLock
    }
}

impl fmt::Display for FixQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FixQuality::NoLock => "N",
            FixQuality::Fix2d => "2D",
            FixQuality::Fix3d => "3D",
        };
        write!(f, "{}", s)
    }
}

/// Station position. Longitude is degrees east, latitude degrees north,
/// altitude metres above sea level.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Location {
    pub lon: f64,
    pub lat: f64,
    pub altitude: f64,
}

/// Result of a GPS query. When the receiver has no lock, `location` echoes
/// the location that was passed in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub location: Location,
    pub quality: FixQuality,
}

// How the microcontroller drives the camera's shutter release. In bulb mode
// the release is held for the whole exposure; otherwise each press starts a
// camera-timed exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Bulb,
    NonBulb,
}

// The microcontroller that sits between the host and the camera: shutter
// release, camera and video power, condensation fan, heater and GPS.
//
// A HardwareTrait instance is the one and only hardware channel of a
// session. It is opened before the session starts waiting for sunset and
// closed exactly once by whichever teardown path ends the session.
//
// All methods block until the microcontroller has acknowledged the command.
pub trait HardwareTrait: Send {
    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), CanonicalError>;

    // Holds the shutter release active until shutter_off().
    fn shutter_on(&mut self) -> Result<(), CanonicalError>;
    fn shutter_off(&mut self) -> Result<(), CanonicalError>;

    // Triggers exactly one exposure.
    fn single_exposure(&mut self) -> Result<(), CanonicalError>;

    fn camera_on(&mut self) -> Result<(), CanonicalError>;
    fn camera_off(&mut self) -> Result<(), CanonicalError>;
    fn video_on(&mut self) -> Result<(), CanonicalError>;
    fn video_off(&mut self) -> Result<(), CanonicalError>;
    fn fan_on(&mut self) -> Result<(), CanonicalError>;
    fn fan_off(&mut self) -> Result<(), CanonicalError>;
    fn heater_on(&mut self, temperature_c: f64) -> Result<(), CanonicalError>;

    // Returns once the camera reports that no exposure is in progress.
    fn wait_until_ready(&mut self) -> Result<(), CanonicalError>;

    fn temperature(&mut self) -> Result<f64, CanonicalError>;
    fn firmware_version(&mut self) -> Result<String, CanonicalError>;
    fn sequence(&mut self) -> Result<String, CanonicalError>;
    fn debug_codes(&mut self) -> Result<String, CanonicalError>;

    /// Queries the GPS receiver. `current` is returned unchanged (with
    /// FixQuality::NoLock) when there is no lock.
    fn update_gps_location(&mut self, current: Location)
                           -> Result<GpsFix, CanonicalError>;

    /// Releases the channel. Further calls fail with FailedPrecondition.
    fn close(&mut self) -> Result<(), CanonicalError>;
}

// mod tests.
