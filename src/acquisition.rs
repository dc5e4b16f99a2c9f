// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use interval_elements::clock_trait::ClockTrait;
use interval_elements::cloud_trait::CloudStatus;
use interval_elements::hardware_trait::HardwareTrait;
use interval_elements::image_trait::ImageProcessorTrait;

use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    // Hold the shutter for this long.
    HighRate(Duration),
    // Wait this long, then take one exposure.
    LowRate(Duration),
}

impl AcquisitionMode {
    pub fn is_high_rate(&self) -> bool {
        matches!(self, AcquisitionMode::HighRate(_))
    }
}

/// Acquisition strategy for one night iteration. An unknown status is
/// treated like a clear sky.
pub fn select_mode(status: CloudStatus, config: &SessionConfig) -> AcquisitionMode {
    match status {
        CloudStatus::Clear | CloudStatus::Unknown =>
            AcquisitionMode::HighRate(config.clear_interval()),
        CloudStatus::Clearing => AcquisitionMode::LowRate(config.clearing_wait()),
        CloudStatus::Cloudy => AcquisitionMode::LowRate(config.cloudy_wait()),
    }
}

/// Remembers the previous night iteration's cloud status so that a log line
/// is emitted only when it changes. Has no influence on which acquisition
/// mode runs.
#[derive(Debug, Default)]
pub struct CloudTransitionTracker {
    previous: Option<CloudStatus>,
    unknown_count: u32,
}

impl CloudTransitionTracker {
    pub fn new() -> Self {
        CloudTransitionTracker{previous: None, unknown_count: 0}
    }

    /// Records `status`; returns the (old, new) pair when it differs from the
    /// previous reading. The first reading counts as a change from None.
    pub fn observe(&mut self, status: CloudStatus)
                   -> Option<(Option<CloudStatus>, CloudStatus)> {
        if status == CloudStatus::Unknown {
            self.unknown_count += 1;
            if self.unknown_count == 1 {
                warn!("cloud_status_unknown_first, defaulting_to_high_rate");
            } else {
                debug!("cloud_status_unknown_repeat, {}", self.unknown_count);
            }
        }
        let previous = self.previous.replace(status);
        if previous == Some(status) {
            return None;
        }
        match previous {
            Some(p) => info!("cloud_transition, {}, {}", p, status),
            None => info!("cloud_status_initial, {}", status),
        }
        Some((previous, status))
    }
}

// Renames what the tether has downloaded so far, thumbnails the renamed set
// and returns the newest capture.
fn finish_chunk(images: &dyn ImageProcessorTrait, dir: &Path) -> Option<PathBuf> {
    let renamed = match images.rename_raw_all(dir) {
        Ok(renamed) => renamed,
        Err(e) => {
            warn!("rename_all_failed, {}, {:?}", dir.display(), e);
            Vec::new()
        },
    };
    info!("finished_acq_chunk, img_count, {}", renamed.len());
    if let Err(e) = images.make_all_thumbnails(dir, Some(&renamed)) {
        warn!("thumbnail_pass_failed, {:?}", e);
    }
    match images.latest_image(dir) {
        Ok(Some(latest)) => {
            debug!("finished_rename_get_latest, {}", latest.display());
            Some(latest)
        },
        Ok(None) => {
            debug!("finished_rename_get_latest, none");
            None
        },
        Err(e) => {
            warn!("latest_image_failed, {:?}", e);
            None
        },
    }
}

/// Holds the shutter release for `interval`, then processes whatever the
/// tether downloaded. The number of exposures depends on the camera's
/// exposure time, not on this function. Returns None when the directory
/// holds no captures.
pub async fn high_rate(hardware: &mut dyn HardwareTrait,
                       images: &dyn ImageProcessorTrait,
                       clock: &dyn ClockTrait,
                       dir: &Path,
                       interval: Duration) -> Option<PathBuf> {
    info!("starting_high_acq_chunk, {}s, {}", interval.as_secs(), dir.display());
    if let Err(e) = hardware.shutter_on() {
        warn!("shutter_on_failed, {:?}", e);
    }
    clock.sleep(interval).await;
    if let Err(e) = hardware.shutter_off() {
        warn!("shutter_off_failed, {:?}", e);
    }
    finish_chunk(images, dir)
}

/// Waits `wait`, triggers exactly one exposure and processes the result.
pub async fn low_rate(hardware: &mut dyn HardwareTrait,
                      images: &dyn ImageProcessorTrait,
                      clock: &dyn ClockTrait,
                      dir: &Path,
                      wait: Duration) -> Option<PathBuf> {
    info!("starting_low_acq, {}s, {}", wait.as_secs(), dir.display());
    clock.sleep(wait).await;
    if let Err(e) = hardware.single_exposure() {
        warn!("single_exposure_failed, {:?}", e);
    }
    finish_chunk(images, dir)
}

// mod tests.
