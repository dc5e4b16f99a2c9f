// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use canonical_error::{CanonicalError, failed_precondition_error};
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};

use interval_elements::capture_trait::{CaptureTrait, ImageQuality,
                                       ManagedProcess, TetherRequest};
use interval_elements::clock_trait::ClockTrait;
use interval_elements::cloud_trait::{CloudMonitorTrait, CloudStatus};
use interval_elements::ephemeris_trait::EphemerisTrait;
use interval_elements::hardware_trait::{HardwareTrait, TriggerMode};
use interval_elements::image_trait::ImageProcessorTrait;

use crate::acquisition::{AcquisitionMode, CloudTransitionTracker, high_rate,
                         low_rate, select_mode};
use crate::boundaries::{IMMEDIATE_START_GRACE, PhaseBoundaries, schedule_night};
use crate::config::{ExposureMode, SessionConfig};
use crate::diagnostics;
use crate::image_handler::{ImageDisposition, handle_new_image};
use crate::jobs::JobList;
use crate::tether::{TETHER_SETTLE, teardown_tether};

// Cadence of the wait for the evening start.
pub const START_POLL_INTERVAL: Duration = Duration::from_secs(30);

// Test mode starts this long after launch.
pub const TEST_START_DELAY: Duration = Duration::from_secs(30);

// Minimum and default test-mode night length.
pub const MIN_TEST_TIME: Duration = Duration::from_secs(180);

// Test mode's high-rate interval.
const TEST_INTERVAL: Duration = Duration::from_secs(180);

// Lets the hardware settle after power-up before the camera is configured.
const BRING_UP_SETTLE: Duration = Duration::from_secs(10);

// Time for the camera to write its last buffered exposure to the card.
pub const BUFFER_DRAIN: Duration = Duration::from_secs(10);

pub const TRANSFER_STATUS_FILE: &str = "transfer_status.txt";

/// Phases of a night, in the only order they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    AwaitingStart,
    EveningTwilight,
    Night,
    MorningTwilight,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    DiskFull,
    // Operator interruption (control-c).
    Interrupted,
    // No usable schedule for tonight.
    NoSchedule,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::DiskFull => "disk_full",
            AbortReason::Interrupted => "interrupted",
            AbortReason::NoSchedule => "no_schedule",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    // Night finished; nothing runs afterwards.
    Completed,
    // Night finished; the caller should replace itself with the downstream
    // processing supervisor.
    Handoff{
        supervisor: PathBuf,
        data_path: PathBuf,
        reboot_epoch: i64,
        day_mask: String,
    },
    // Ended through the fault shutdown path.
    Aborted(AbortReason),
}

/// The external collaborators a session drives.
pub struct Collaborators {
    pub hardware: Box<dyn HardwareTrait>,
    pub capture: Box<dyn CaptureTrait>,
    pub clouds: Box<dyn CloudMonitorTrait>,
    pub images: Box<dyn ImageProcessorTrait>,
    pub ephemeris: Box<dyn EphemerisTrait>,
}

/// `<data_directory>/<YYYY-MM-DD>` for the night starting at `now`.
pub fn night_data_path(config: &SessionConfig, now: DateTime<Local>) -> PathBuf {
    config.internal.data_directory.join(now.format("%Y-%m-%d").to_string())
}

// Warns about a failed collaborator call and carries on.
pub(crate) fn absorb<T>(what: &str, result: Result<T, CanonicalError>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("{}_failed, {:?}", what, e);
            None
        },
    }
}

// Newest file in `dir` whose name contains "mask".
fn newest_mask(dir: &Path) -> Option<PathBuf> {
    let pattern = dir.join("*mask*");
    let entries = glob::glob(pattern.to_str()?).ok()?;
    entries.flatten()
        .filter(|p| p.is_file())
        .max_by_key(|p| fs::metadata(p).and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH))
}

/// Runs one night: waits for the evening, acquires through both twilight
/// windows and the night, then tears everything down. The session owns the
/// hardware channel from construction until one of the two teardown paths
/// closes it.
pub struct NightSession {
    pub(crate) config: SessionConfig,
    pub(crate) hardware: Box<dyn HardwareTrait>,
    pub(crate) capture: Box<dyn CaptureTrait>,
    pub(crate) clouds: Box<dyn CloudMonitorTrait>,
    pub(crate) images: Box<dyn ImageProcessorTrait>,
    ephemeris: Box<dyn EphemerisTrait>,
    pub(crate) clock: Arc<dyn ClockTrait>,
    got_signal: Arc<AtomicBool>,

    // Night length in test mode.
    pub(crate) test_time: Option<Duration>,

    phase: Phase,
    boundaries: Option<PhaseBoundaries>,
    pub(crate) data_path: PathBuf,
    pub(crate) jobs: JobList,

    // Owned tether of the night phase, while it runs.
    pub(crate) night_tether: Option<ManagedProcess>,

    pub(crate) video_active: bool,
    pub(crate) hardware_closed: bool,
}

impl NightSession {
    pub fn new(config: SessionConfig,
               collaborators: Collaborators,
               clock: Arc<dyn ClockTrait>,
               got_signal: Arc<AtomicBool>,
               test_time: Option<Duration>) -> Self {
        let data_path = night_data_path(&config, clock.now());
        NightSession{
            config,
            hardware: collaborators.hardware,
            capture: collaborators.capture,
            clouds: collaborators.clouds,
            images: collaborators.images,
            ephemeris: collaborators.ephemeris,
            clock,
            got_signal,
            test_time: test_time.map(|t| t.max(MIN_TEST_TIME)),
            phase: Phase::AwaitingStart,
            boundaries: None,
            data_path,
            jobs: JobList::new(),
            night_tether: None,
            video_active: false,
            hardware_closed: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn boundaries(&self) -> Option<PhaseBoundaries> {
        self.boundaries
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    fn is_test(&self) -> bool {
        self.test_time.is_some()
    }

    pub(crate) fn advance(&mut self, next: Phase) {
        if next <= self.phase {
            error!("phase_regression_refused, {:?}, {:?}", self.phase, next);
            return;
        }
        info!("phase, {:?}, {}", next, self.clock.now().to_rfc3339());
        self.phase = next;
    }

    fn check_interrupt(&self) -> Result<(), AbortReason> {
        if self.got_signal.load(Ordering::Relaxed) {
            warn!("interrupted, {:?}", self.phase);
            return Err(AbortReason::Interrupted);
        }
        Ok(())
    }

    /// Runs the whole night and returns how it ended. Never fails: every
    /// exit path leaves the hardware powered down with the channel closed.
    pub async fn run(&mut self) -> SessionOutcome {
        self.prepare();
        let now = self.clock.now();
        match self.compute_schedule(now) {
            Ok(b) => self.boundaries = Some(b),
            Err(e) => {
                error!("no_schedule, {:?}", e);
                return self.fault_shutdown(AbortReason::NoSchedule).await;
            },
        }
        match self.acquire().await {
            Ok(()) => self.normal_shutdown().await,
            Err(reason) => self.fault_shutdown(reason).await,
        }
    }

    // Station startup: data directory, safe hardware state, first GPS fix.
    fn prepare(&mut self) {
        info!("data_path, {}", self.data_path.display());
        if let Err(e) = fs::create_dir_all(&self.data_path) {
            error!("data_path_create_failed, {:?}", e);
        }
        let latest = self.config.internal.data_directory.join("latest");
        let _ = fs::remove_file(&latest);
        if let Err(e) = symlink(&self.data_path, &latest) {
            warn!("latest_link_failed, {:?}", e);
        }

        absorb("shutter_off", self.hardware.shutter_off());
        absorb("wait_ready", self.hardware.wait_until_ready());
        absorb("camera_off", self.hardware.camera_off());
        absorb("video_off", self.hardware.video_off());
        let mode = match self.config.camera.exp_mode {
            ExposureMode::Bulb => TriggerMode::Bulb,
            ExposureMode::Normal => TriggerMode::NonBulb,
        };
        info!("exposure_mode, {:?}", mode);
        absorb("trigger_mode", self.hardware.set_trigger_mode(mode));

        if let Some(mask) = newest_mask(&self.config.internal.data_directory) {
            let target = self.data_path.join(mask.file_name().unwrap_or_default());
            self.jobs.spawn_blocking("mask_copy", move || {
                fs::copy(&mask, &target).map(|_| ()).map_err(|e| {
                    failed_precondition_error(
                        format!("copy {:?}: {:?}", mask, e).as_str())
                })
            });
        } else {
            info!("no_mask_found");
        }

        let status = self.data_path.join(TRANSFER_STATUS_FILE);
        if let Err(e) = fs::write(&status, "unprocessed") {
            warn!("transfer_status_failed, {:?}", e);
        }

        let location = self.config.location();
        if let Some(fix) = absorb("gps", self.hardware.update_gps_location(location)) {
            info!("gps_fix, {}, {}, {}, {}", fix.location.lon, fix.location.lat,
                  fix.location.altitude, fix.quality);
            // Replaces whatever quality the master file carried over.
            self.config = self.config.with_fix(&fix);
        }
    }

    // Tonight's boundaries as seen from `now`.
    fn compute_schedule(&self, now: DateTime<Local>)
                        -> Result<PhaseBoundaries, CanonicalError> {
        let boundaries = match self.test_time {
            Some(night) => PhaseBoundaries::for_test(now, TEST_START_DELAY, night),
            None => {
                let times = self.ephemeris.compute(&self.config.location(), now)?;
                schedule_night(&times, now, self.config.sun_leeway(),
                               self.config.twilight_margin(),
                               IMMEDIATE_START_GRACE).0
            },
        };
        boundaries.log(now);
        Ok(boundaries)
    }

    async fn acquire(&mut self) -> Result<(), AbortReason> {
        self.await_start().await?;
        self.advance(Phase::EveningTwilight);
        self.log_diagnostics().await;
        self.bring_up().await;
        let b = self.boundaries.ok_or(AbortReason::NoSchedule)?;

        self.twilight(b.evening_twilight_end).await?;
        self.advance(Phase::Night);
        self.night(b.night_end).await?;
        self.advance(Phase::MorningTwilight);
        self.twilight(b.morning_end).await
    }

    // Waits until the evening start, re-polling the GPS while it has no
    // lock. An improved fix recomputes the schedule; a boundary never moves
    // into the past.
    async fn await_start(&mut self) -> Result<(), AbortReason> {
        loop {
            self.check_interrupt()?;
            let now = self.clock.now();
            let mut start = self.boundaries.ok_or(AbortReason::NoSchedule)?.evening_start;
            if now >= start {
                return Ok(());
            }
            if !self.is_test() && !self.config.station.gps_lock.is_locked() {
                self.recheck_gps(now);
                start = self.boundaries.ok_or(AbortReason::NoSchedule)?.evening_start;
            }
            let remaining = (start - now).to_std().unwrap_or(Duration::ZERO);
            debug!("waiting_for_start, {}s", remaining.as_secs());
            self.clock.sleep(remaining.min(START_POLL_INTERVAL)).await;
        }
    }

    fn recheck_gps(&mut self, now: DateTime<Local>) {
        let current = self.config.station.gps_lock;
        let Some(fix) = absorb("gps", self.hardware.update_gps_location(
            self.config.location())) else {
            return;
        };
        if fix.quality <= current {
            debug!("gps_no_improvement, {}", fix.quality);
            return;
        }
        info!("gps_fix_improved, {}, {}, {}, {}, {}", current, fix.quality,
              fix.location.lon, fix.location.lat, fix.location.altitude);
        self.config = self.config.with_fix(&fix);
        match self.compute_schedule(now) {
            Ok(b) => self.boundaries = Some(b.not_before(now)),
            Err(e) => warn!("recompute_failed_keeping_schedule, {:?}", e),
        }
    }

    async fn log_diagnostics(&mut self) {
        diagnostics::log_hardware_info(self.hardware.as_mut(), self.clock.as_ref()).await;
        info!("cloud_file, {}", self.config.internal.cloudy_img_file.display());
        info!("date, {}", self.clock.now().to_rfc3339());
        info!("data_path, {}", self.data_path.display());
        info!("test_time, {:?}", self.test_time.map(|t| t.as_secs()));
        diagnostics::log_memory();
        diagnostics::log_time_sync().await;
    }

    // Powers up and configures the camera for the night.
    async fn bring_up(&mut self) {
        self.clock.sleep(BRING_UP_SETTLE).await;
        let video_device = self.config.camera.video_device.clone();
        if video_device.exists() {
            info!("video_device, {}", video_device.display());
            if self.config.camera.video_enabled {
                if !self.is_test() {
                    if let Some(b) = self.boundaries {
                        absorb("video_analysis",
                               self.clouds.spawn_video_analysis(b.morning_end));
                    }
                }
                if absorb("video_on", self.hardware.video_on()).is_some() {
                    self.video_active = true;
                }
            }
        } else {
            info!("no_video_device, {}", video_device.display());
        }

        absorb("camera_on", self.hardware.camera_on());
        absorb("download_leftovers",
               self.capture.download_all_images(&self.data_path).await);
        absorb("rename_leftovers", self.images.rename_raw_all(&self.data_path));
        absorb("sync_clock", self.capture.sync_clock().await);
        if let Some(camera_time) = absorb("camera_clock", self.capture.clock().await) {
            info!("camera_time, {}", camera_time);
        }
        absorb("expprogram", self.capture.set_manual_exposure_program().await);
        absorb("autoiso", self.capture.set_autoiso(false).await);
        absorb("highisonr", self.capture.set_high_iso_noise_reduction(false).await);
        absorb("longexpnr",
               self.capture.set_long_exposure_noise_reduction(false).await);
        absorb("vignette", self.capture.set_vignette_correction(false).await);
        let fstop = self.config.camera.camera_fstop.clone();
        absorb("aperture", self.capture.set_aperture(&fstop).await);

        absorb("fan_on", self.hardware.fan_on());
        if self.config.firmware_control.heater_enabled {
            let t = self.config.firmware_control.heater_temperature_c;
            absorb("heater_on", self.hardware.heater_on(t));
        }

        if let Some(speed) = absorb("shutter_speed", self.capture.shutter_speed().await) {
            info!("shutterspeed, {}", speed);
            self.config = self.config.with_shutter_speed(&speed);
        }
        absorb("snapshot", self.config.save_snapshot(&self.data_path));
    }

    async fn configure_camera(&mut self, quality: ImageQuality,
                              shutter: &str, iso: &str) {
        absorb("quality", self.capture.set_quality(quality).await);
        absorb("shutter", self.capture.set_shutter_speed(shutter).await);
        absorb("iso", self.capture.set_iso(iso).await);
        info!("camera_configured, {}, {}, {}", quality, shutter, iso);
    }

    fn interval(&self) -> Duration {
        if self.is_test() { TEST_INTERVAL } else { self.config.clear_interval() }
    }

    fn remaining(&self, end: DateTime<Local>) -> Option<Duration> {
        (end - self.clock.now()).to_std().ok().filter(|d| !d.is_zero())
    }

    // Passes one acquisition result to image handling. Only a full disk
    // stops the session.
    fn handle(&self, image: Option<PathBuf>) -> Result<(), AbortReason> {
        match handle_new_image(self.images.as_ref(), &self.config,
                               &self.data_path, image.as_deref()) {
            ImageDisposition::DiskFull => Err(AbortReason::DiskFull),
            _ => Ok(()),
        }
    }

    // One twilight window ending at `end`: JPEG captures, a self-expiring
    // tether and high-rate acquisition until the boundary.
    async fn twilight(&mut self, end: DateTime<Local>) -> Result<(), AbortReason> {
        let Some(window) = self.remaining(end) else {
            info!("twilight_skipped, {:?}", self.phase);
            return Ok(());
        };
        let (shutter, iso) = self.config.twilight_exposure();
        let (shutter, iso) = (shutter.to_string(), iso.to_string());
        self.configure_camera(ImageQuality::Jpeg, &shutter, &iso).await;

        let duration = Duration::from_secs(window.as_secs().max(1));
        let request = TetherRequest{working_dir: &self.data_path,
                                    duration: Some(duration),
                                    force_overwrite: true,
                                    stderr_log: None};
        match self.capture.launch_tethered(&request).await {
            Ok(tether) => {
                info!("twilight_tether_launched, {:?}, {}s", tether.id(),
                      duration.as_secs());
                // Self-expiring; released right away.
                teardown_tether(tether, self.clock.as_ref(), TETHER_SETTLE).await;
            },
            Err(e) => {
                warn!("tether_launch_failed, {:?}", e);
                absorb("capture_reset", self.capture.reset().await);
            },
        }

        let interval = self.interval();
        while let Some(remaining) = self.remaining(end) {
            self.check_interrupt()?;
            let latest = high_rate(self.hardware.as_mut(), self.images.as_ref(),
                                   self.clock.as_ref(), &self.data_path,
                                   interval.min(remaining)).await;
            self.handle(latest)?;
        }
        info!("twilight_done, {:?}", self.phase);
        Ok(())
    }

    // The night: raw captures, an owned tether for the whole night and
    // cloud-adaptive acquisition until `end`.
    async fn night(&mut self, end: DateTime<Local>) -> Result<(), AbortReason> {
        let shutter = self.config.camera.camera_exposuretime.clone();
        let iso = self.config.camera.camera_iso.clone();
        self.configure_camera(ImageQuality::Raw, &shutter, &iso).await;

        let stderr_log = self.data_path.join(
            format!("{}_tether.txt", self.clock.now().format("%Y-%m-%d")));
        let request = TetherRequest{working_dir: &self.data_path,
                                    duration: None,
                                    force_overwrite: true,
                                    stderr_log: Some(&stderr_log)};
        match self.capture.launch_tethered(&request).await {
            Ok(tether) => {
                info!("night_tether_launched, {:?}", tether.id());
                self.night_tether = Some(tether);
            },
            Err(e) => {
                warn!("tether_launch_failed, {:?}", e);
                absorb("capture_reset", self.capture.reset().await);
            },
        }

        let interval = self.interval();
        let mut tracker = CloudTransitionTracker::new();
        while let Some(remaining) = self.remaining(end) {
            self.check_interrupt()?;
            let status = if self.is_test() {
                CloudStatus::Clear
            } else {
                self.clouds.read_status()
            };
            tracker.observe(status);
            let latest = match select_mode(status, &self.config) {
                AcquisitionMode::HighRate(_) => high_rate(
                    self.hardware.as_mut(), self.images.as_ref(),
                    self.clock.as_ref(), &self.data_path,
                    interval.min(remaining)).await,
                AcquisitionMode::LowRate(wait) => low_rate(
                    self.hardware.as_mut(), self.images.as_ref(),
                    self.clock.as_ref(), &self.data_path,
                    wait.min(remaining)).await,
            };
            self.handle(latest)?;
        }

        if let Some(tether) = self.night_tether.take() {
            teardown_tether(tether, self.clock.as_ref(), TETHER_SETTLE).await;
        }
        info!("night_done");
        Ok(())
    }
}

// mod tests.
