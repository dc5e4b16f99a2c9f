// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error};
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};

use interval_elements::hardware_trait::{FixQuality, GpsFix, Location};

// Name of the per-night copy of the configuration.
pub const SNAPSHOT_FILE_NAME: &str = "station_config.toml";

// Station settings for one night. Loaded once from the master file; the
// session derives updated copies (GPS fix, negotiated shutter speed) with
// the with_*() methods and persists them only as a snapshot in the night's
// data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub station: StationConfig,
    pub camera: CameraConfig,
    pub clouds: CloudsConfig,
    pub internal: InternalConfig,
    #[serde(default)]
    pub firmware_control: FirmwareConfig,
    #[serde(default)]
    pub event_detect: EventDetectConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    // Short station identifier, used as the image file name prefix.
    pub name: String,
    // Free text site description.
    #[serde(default)]
    pub location: String,
    pub lon: f64,
    pub lat: f64,
    pub altitude: f64,
    #[serde(default)]
    pub gps_lock: FixQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExposureMode {
    Bulb,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub exp_mode: ExposureMode,
    pub camera_exposuretime: String,
    pub camera_iso: String,
    #[serde(default)]
    pub twilight_exposuretime: Option<String>,
    #[serde(default)]
    pub twilight_iso: Option<String>,
    pub camera_fstop: String,
    #[serde(default)]
    pub video_enabled: bool,
    #[serde(default = "default_video_device")]
    pub video_device: PathBuf,
    // Filled in from the camera once it is configured.
    #[serde(default)]
    pub shutterspeed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudsConfig {
    // Seconds the shutter is held per high-rate chunk.
    pub time_checking_clear: u64,
    // Seconds waited before each low-rate exposure.
    pub time_checking_clearing: u64,
    pub time_checking_cloudy: u64,
    // A published status older than this many seconds counts as unknown.
    #[serde(default = "default_status_max_age")]
    pub status_max_age: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalConfig {
    pub data_directory: PathBuf,
    // Minutes; pushes the evening start later and the morning end earlier.
    pub sun_leeway: f64,
    // Minutes of twilight acquisition at each end of the night.
    #[serde(default = "default_twilight_margin")]
    pub twilight_margin: f64,
    pub cloud_status_file: PathBuf,
    pub cloudy_img_file: PathBuf,
    pub last_img_status_file: PathBuf,
    // 2 asks for a full thumbnail pass at the end of the night.
    #[serde(default = "default_clearing_quality")]
    pub clearing_quality: u8,
    // Used fraction of the data volume at which the session aborts.
    #[serde(default = "default_disk_full_threshold")]
    pub disk_full_threshold: f64,
    #[serde(default = "default_serial_device")]
    pub serial_device: PathBuf,
    // Command line of the video cloud analysis; the session end epoch is
    // appended as the last argument.
    #[serde(default)]
    pub video_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FirmwareConfig {
    #[serde(default)]
    pub heater_enabled: bool,
    #[serde(default)]
    pub heater_temperature_c: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDetectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_supervisor")]
    pub supervisor: PathBuf,
    // Local "HH:MM" at which the station reboots each day.
    #[serde(default = "default_reboot_time")]
    pub reboot_time: String,
    // Days of week (0 = Monday) on which downstream processing may run.
    #[serde(default = "default_day_mask")]
    pub day_mask: String,
}

impl Default for EventDetectConfig {
    fn default() -> Self {
        EventDetectConfig{
            enabled: true,
            supervisor: default_supervisor(),
            reboot_time: default_reboot_time(),
            day_mask: default_day_mask(),
        }
    }
}

fn default_video_device() -> PathBuf { PathBuf::from("/dev/video0") }
fn default_status_max_age() -> u64 { 600 }
fn default_twilight_margin() -> f64 { 10.0 }
fn default_clearing_quality() -> u8 { 1 }
fn default_disk_full_threshold() -> f64 { 0.95 }
fn default_serial_device() -> PathBuf { PathBuf::from("/dev/ttyACM0") }
fn default_true() -> bool { true }
fn default_supervisor() -> PathBuf {
    PathBuf::from("/opt/dfn-software/processing_supervisor")
}
fn default_reboot_time() -> String { "16:15".to_string() }
fn default_day_mask() -> String { "012346".to_string() }

fn minutes(m: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((m * 60_000.0).round() as i64)
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, CanonicalError> {
        let content = fs::read_to_string(path).map_err(|e| {
            failed_precondition_error(
                format!("Could not read config {:?}: {:?}", path, e).as_str())
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, CanonicalError> {
        let config: SessionConfig = toml::from_str(content).map_err(|e| {
            invalid_argument_error(format!("Bad config: {}", e).as_str())
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CanonicalError> {
        if self.station.name.is_empty() {
            return Err(invalid_argument_error("station.name must be set"));
        }
        if !(0.0..=1.0).contains(&self.internal.disk_full_threshold) {
            return Err(invalid_argument_error(
                "internal.disk_full_threshold must be within 0..1"));
        }
        if self.internal.twilight_margin < 0.0 || self.internal.sun_leeway < 0.0 {
            return Err(invalid_argument_error(
                "internal.sun_leeway and twilight_margin must not be negative"));
        }
        if self.clouds.time_checking_clear == 0 {
            return Err(invalid_argument_error(
                "clouds.time_checking_clear must be positive"));
        }
        self.reboot_time()?;
        Ok(())
    }

    pub fn location(&self) -> Location {
        Location{lon: self.station.lon,
                 lat: self.station.lat,
                 altitude: self.station.altitude}
    }

    // Records the fix quality. The position is only taken from a locked fix.
    pub fn with_fix(&self, fix: &GpsFix) -> Self {
        let mut next = self.clone();
        if fix.quality.is_locked() {
            next.station.lon = fix.location.lon;
            next.station.lat = fix.location.lat;
            next.station.altitude = fix.location.altitude;
        }
        next.station.gps_lock = fix.quality;
        next
    }

    pub fn with_shutter_speed(&self, shutter_speed: &str) -> Self {
        let mut next = self.clone();
        next.camera.shutterspeed = Some(shutter_speed.to_string());
        next
    }

    pub fn sun_leeway(&self) -> chrono::Duration {
        minutes(self.internal.sun_leeway)
    }

    pub fn twilight_margin(&self) -> chrono::Duration {
        minutes(self.internal.twilight_margin)
    }

    // Exposure and ISO for the twilight windows, falling back to the night
    // settings when no twilight override is configured.
    pub fn twilight_exposure(&self) -> (&str, &str) {
        let shutter = self.camera.twilight_exposuretime.as_deref()
            .unwrap_or(&self.camera.camera_exposuretime);
        let iso = self.camera.twilight_iso.as_deref()
            .unwrap_or(&self.camera.camera_iso);
        (shutter, iso)
    }

    pub fn clear_interval(&self) -> Duration {
        Duration::from_secs(self.clouds.time_checking_clear)
    }

    pub fn clearing_wait(&self) -> Duration {
        Duration::from_secs(self.clouds.time_checking_clearing)
    }

    pub fn cloudy_wait(&self) -> Duration {
        Duration::from_secs(self.clouds.time_checking_cloudy)
    }

    pub fn wants_full_thumbnail_pass(&self) -> bool {
        self.internal.clearing_quality == 2
    }

    pub fn reboot_time(&self) -> Result<NaiveTime, CanonicalError> {
        NaiveTime::parse_from_str(&self.event_detect.reboot_time, "%H:%M")
            .map_err(|e| invalid_argument_error(
                format!("event_detect.reboot_time {:?}: {}",
                        self.event_detect.reboot_time, e).as_str()))
    }

    /// The first local occurrence of the daily reboot time after `now`.
    pub fn next_reboot(&self, now: DateTime<Local>)
                       -> Result<DateTime<Local>, CanonicalError> {
        let reboot_time = self.reboot_time()?;
        let mut date = now.date_naive();
        for _ in 0..3 {
            let candidate = Local.from_local_datetime(&date.and_time(reboot_time))
                .earliest();
            if let Some(candidate) = candidate {
                if candidate > now {
                    return Ok(candidate);
                }
            }
            date = date.succ_opt().ok_or_else(
                || invalid_argument_error("date out of range"))?;
        }
        Err(invalid_argument_error("could not place reboot time"))
    }

    /// Writes this configuration into `dir`. The master file is never
    /// rewritten.
    pub fn save_snapshot(&self, dir: &Path) -> Result<PathBuf, CanonicalError> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            invalid_argument_error(format!("Config serialization: {}", e).as_str())
        })?;
        let path = dir.join(SNAPSHOT_FILE_NAME);
        fs::write(&path, content).map_err(|e| {
            failed_precondition_error(
                format!("Could not write {:?}: {:?}", path, e).as_str())
        })?;
        Ok(path)
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
[station]
name = "DFNSMALL36"
location = "Test site"
lon = 115.86
lat = -31.95
altitude = 30.0
gps_lock = "N"

[camera]
exp_mode = "BULB"
camera_exposuretime = "25"
camera_iso = "6400"
camera_fstop = "4"

[clouds]
time_checking_clear = 180
time_checking_clearing = 120
time_checking_cloudy = 300

[internal]
data_directory = "/data0"
sun_leeway = 10
cloud_status_file = "/tmp/cloud_status.txt"
cloudy_img_file = "/tmp/cloudy_img.jpg"
last_img_status_file = "/tmp/last_image.txt"
"#;

// mod tests.
