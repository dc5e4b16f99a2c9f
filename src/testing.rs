// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Test doubles for the session's collaborators.

use std::collections::VecDeque;
use std::fs;
use std::io::Cursor;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error,
                      unavailable_error};
use chrono::{DateTime, Local, TimeZone};
use image::{DynamicImage, ImageFormat, RgbImage};

use interval_elements::capture_trait::{CaptureTrait, ImageQuality,
                                       ManagedProcess, OwnershipMode,
                                       TetherProcess, TetherRequest};
use interval_elements::clock_trait::ClockTrait;
use interval_elements::cloud_trait::{CloudMonitorTrait, CloudStatus};
use interval_elements::ephemeris_trait::{EphemerisTrait, SunMoonTimes};
use interval_elements::hardware_trait::{FixQuality, GpsFix, HardwareTrait,
                                        Location, TriggerMode};
use interval_elements::image_trait::ImageProcessorTrait;

use crate::image_files::ImageFiles;

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 4) as u8, (y * 4) as u8, 128])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut buf, ImageFormat::Jpeg).unwrap();
    buf.into_inner()
}

// A stand-in raw file: an opaque header followed by an embedded preview.
pub fn fake_raw_bytes() -> Vec<u8> {
    let mut bytes = b"II*\0".to_vec();
    bytes.extend(std::iter::repeat(0u8).take(256));
    bytes.extend(jpeg_bytes(64, 48));
    bytes
}

/// Clock whose sleep() advances time instantly. Clones share one timeline.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<DateTime<Local>>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::at(Local.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap())
    }

    pub fn at(now: DateTime<Local>) -> Self {
        FakeClock{now: Arc::new(Mutex::new(now))}
    }

    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(d).unwrap();
    }
}

#[async_trait]
impl ClockTrait for FakeClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TetherCall {
    Poll,
    Terminate,
    Kill,
}

pub struct RecordingTether {
    calls: Arc<Mutex<Vec<TetherCall>>>,
    exited: bool,
}

impl RecordingTether {
    pub fn new(calls: Arc<Mutex<Vec<TetherCall>>>, already_exited: bool) -> Self {
        RecordingTether{calls, exited: already_exited}
    }
}

impl TetherProcess for RecordingTether {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn poll(&mut self) -> Result<Option<ExitStatus>, CanonicalError> {
        self.calls.lock().unwrap().push(TetherCall::Poll);
        Ok(if self.exited { Some(ExitStatus::from_raw(9)) } else { None })
    }

    fn terminate(&mut self) -> Result<(), CanonicalError> {
        self.calls.lock().unwrap().push(TetherCall::Terminate);
        Ok(())
    }

    fn kill(&mut self) -> Result<(), CanonicalError> {
        self.calls.lock().unwrap().push(TetherCall::Kill);
        self.exited = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HwEvent {
    TriggerMode(TriggerMode),
    ShutterOn,
    ShutterOff,
    SingleExposure,
    CameraOn,
    CameraOff,
    VideoOn,
    VideoOff,
    FanOn,
    FanOff,
    HeaterOn(f64),
    WaitReady,
    GpsQuery,
    Close,
}

/// Records every command. Each exposure drops a capture file into
/// `capture_dir`, the way the tether would download it.
pub struct MockHardware {
    events: Arc<Mutex<Vec<HwEvent>>>,
    capture_dir: Option<PathBuf>,
    quality: Arc<Mutex<ImageQuality>>,
    frame: u32,
    shutter_held: bool,
    gps_script: VecDeque<GpsFix>,
    closed: bool,
}

impl MockHardware {
    pub fn new(capture_dir: Option<&Path>) -> Self {
        MockHardware{
            events: Arc::new(Mutex::new(Vec::new())),
            capture_dir: capture_dir.map(Path::to_path_buf),
            quality: Arc::new(Mutex::new(ImageQuality::Raw)),
            frame: 0,
            shutter_held: false,
            gps_script: VecDeque::new(),
            closed: false,
        }
    }

    pub fn with_capture_dir(mut self, dir: &Path) -> Self {
        self.capture_dir = Some(dir.to_path_buf());
        self
    }

    // Shares the image format with a MockCapture.
    pub fn with_quality(mut self, quality: Arc<Mutex<ImageQuality>>) -> Self {
        self.quality = quality;
        self
    }

    // Fixes returned by successive GPS queries; afterwards the receiver
    // reports no lock.
    pub fn with_gps(mut self, fixes: Vec<GpsFix>) -> Self {
        self.gps_script = fixes.into();
        self
    }

    pub fn events(&self) -> Arc<Mutex<Vec<HwEvent>>> {
        self.events.clone()
    }

    fn record(&mut self, event: HwEvent) -> Result<(), CanonicalError> {
        self.events.lock().unwrap().push(event);
        if self.closed {
            return Err(failed_precondition_error("channel closed"));
        }
        Ok(())
    }

    fn capture(&mut self) {
        let Some(dir) = &self.capture_dir else {
            return;
        };
        self.frame += 1;
        let (ext, bytes) = match *self.quality.lock().unwrap() {
            ImageQuality::Raw => ("nef", fake_raw_bytes()),
            ImageQuality::Jpeg => ("jpg", jpeg_bytes(64, 48)),
        };
        fs::write(dir.join(format!("capt{:04}.{}", self.frame, ext)), bytes).unwrap();
    }
}

impl HardwareTrait for MockHardware {
    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), CanonicalError> {
        self.record(HwEvent::TriggerMode(mode))
    }

    fn shutter_on(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::ShutterOn)?;
        self.shutter_held = true;
        Ok(())
    }

    fn shutter_off(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::ShutterOff)?;
        if self.shutter_held {
            self.shutter_held = false;
            self.capture();
        }
        Ok(())
    }

    fn single_exposure(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::SingleExposure)?;
        self.capture();
        Ok(())
    }

    fn camera_on(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::CameraOn)
    }

    fn camera_off(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::CameraOff)
    }

    fn video_on(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::VideoOn)
    }

    fn video_off(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::VideoOff)
    }

    fn fan_on(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::FanOn)
    }

    fn fan_off(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::FanOff)
    }

    fn heater_on(&mut self, temperature_c: f64) -> Result<(), CanonicalError> {
        self.record(HwEvent::HeaterOn(temperature_c))
    }

    fn wait_until_ready(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::WaitReady)
    }

    fn temperature(&mut self) -> Result<f64, CanonicalError> {
        Ok(21.5)
    }

    fn firmware_version(&mut self) -> Result<String, CanonicalError> {
        Ok("mock-1.0".to_string())
    }

    fn sequence(&mut self) -> Result<String, CanonicalError> {
        Ok("0".to_string())
    }

    fn debug_codes(&mut self) -> Result<String, CanonicalError> {
        Ok("".to_string())
    }

    fn update_gps_location(&mut self, current: Location)
                           -> Result<GpsFix, CanonicalError> {
        self.record(HwEvent::GpsQuery)?;
        Ok(self.gps_script.pop_front().unwrap_or(
            GpsFix{location: current, quality: FixQuality::NoLock}))
    }

    fn close(&mut self) -> Result<(), CanonicalError> {
        self.record(HwEvent::Close)?;
        self.closed = true;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureCall {
    SetQuality(ImageQuality),
    SetShutterSpeed(String),
    SetIso(String),
    Setting(&'static str),
    SyncClock,
    Download,
    Launch(Option<Duration>),
    Reset,
}

pub struct MockCapture {
    calls: Arc<Mutex<Vec<CaptureCall>>>,
    quality: Arc<Mutex<ImageQuality>>,
    tether_calls: Arc<Mutex<Vec<TetherCall>>>,
    fail_launch: bool,
}

impl MockCapture {
    pub fn new(quality: Arc<Mutex<ImageQuality>>) -> Self {
        MockCapture{
            calls: Arc::new(Mutex::new(Vec::new())),
            quality,
            tether_calls: Arc::new(Mutex::new(Vec::new())),
            fail_launch: false,
        }
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<CaptureCall>>> {
        self.calls.clone()
    }

    // Signals received by every tether this backend launched.
    pub fn tether_calls(&self) -> Arc<Mutex<Vec<TetherCall>>> {
        self.tether_calls.clone()
    }

    fn record(&self, call: CaptureCall) -> Result<(), CanonicalError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl CaptureTrait for MockCapture {
    async fn set_quality(&self, quality: ImageQuality) -> Result<(), CanonicalError> {
        *self.quality.lock().unwrap() = quality;
        self.record(CaptureCall::SetQuality(quality))
    }
    async fn set_shutter_speed(&self, shutter_speed: &str) -> Result<(), CanonicalError> {
        self.record(CaptureCall::SetShutterSpeed(shutter_speed.to_string()))
    }
    async fn set_iso(&self, iso: &str) -> Result<(), CanonicalError> {
        self.record(CaptureCall::SetIso(iso.to_string()))
    }
    async fn set_manual_exposure_program(&self) -> Result<(), CanonicalError> {
        self.record(CaptureCall::Setting("expprogram"))
    }
    async fn set_autoiso(&self, _enabled: bool) -> Result<(), CanonicalError> {
        self.record(CaptureCall::Setting("autoiso"))
    }
    async fn set_high_iso_noise_reduction(&self, _enabled: bool)
                                          -> Result<(), CanonicalError> {
        self.record(CaptureCall::Setting("highisonr"))
    }
    async fn set_long_exposure_noise_reduction(&self, _enabled: bool)
                                               -> Result<(), CanonicalError> {
        self.record(CaptureCall::Setting("longexpnr"))
    }
    async fn set_vignette_correction(&self, _enabled: bool) -> Result<(), CanonicalError> {
        self.record(CaptureCall::Setting("vignette"))
    }
    async fn set_aperture(&self, _f_number: &str) -> Result<(), CanonicalError> {
        self.record(CaptureCall::Setting("f-number"))
    }
    async fn shutter_speed(&self) -> Result<String, CanonicalError> {
        Ok("25".to_string())
    }
    async fn sync_clock(&self) -> Result<(), CanonicalError> {
        self.record(CaptureCall::SyncClock)
    }
    async fn clock(&self) -> Result<String, CanonicalError> {
        Ok("2024-06-21 12:00:00".to_string())
    }
    async fn download_all_images(&self, _dir: &Path) -> Result<(), CanonicalError> {
        self.record(CaptureCall::Download)
    }
    async fn launch_tethered(&self, request: &TetherRequest<'_>)
                             -> Result<ManagedProcess, CanonicalError> {
        self.record(CaptureCall::Launch(request.duration))?;
        if self.fail_launch {
            return Err(unavailable_error("camera busy"));
        }
        let mode = match request.duration {
            Some(d) => OwnershipMode::SelfExpiring(d),
            None => OwnershipMode::ExternallyTerminated,
        };
        Ok(ManagedProcess::new(
            mode, Box::new(RecordingTether::new(self.tether_calls.clone(), false))))
    }
    async fn reset(&self) -> Result<(), CanonicalError> {
        self.record(CaptureCall::Reset)
    }
}

/// Cloud monitor that replays a script, then repeats `fallback`.
pub struct ScriptedClouds {
    script: Mutex<VecDeque<CloudStatus>>,
    fallback: CloudStatus,
    video_spawns: Arc<Mutex<Vec<DateTime<Local>>>>,
}

impl ScriptedClouds {
    pub fn new(script: Vec<CloudStatus>, fallback: CloudStatus) -> Self {
        ScriptedClouds{script: Mutex::new(script.into()),
                       fallback,
                       video_spawns: Arc::new(Mutex::new(Vec::new()))}
    }

    pub fn video_spawns(&self) -> Arc<Mutex<Vec<DateTime<Local>>>> {
        self.video_spawns.clone()
    }
}

impl CloudMonitorTrait for ScriptedClouds {
    fn read_status(&self) -> CloudStatus {
        self.script.lock().unwrap().pop_front().unwrap_or(self.fallback)
    }

    fn spawn_video_analysis(&mut self, until: DateTime<Local>)
                            -> Result<(), CanonicalError> {
        self.video_spawns.lock().unwrap().push(until);
        Ok(())
    }
}

type SunTimesFn = dyn Fn(&Location, DateTime<Local>)
                         -> Result<SunMoonTimes, CanonicalError> + Send + Sync;

pub struct FakeEphemeris {
    compute: Box<SunTimesFn>,
}

impl FakeEphemeris {
    pub fn new<F>(compute: F) -> Self
    where F: Fn(&Location, DateTime<Local>) -> Result<SunMoonTimes, CanonicalError>
        + Send + Sync + 'static
    {
        FakeEphemeris{compute: Box::new(compute)}
    }

    // Same sunset and sunrise wherever the station is.
    pub fn fixed(sunset: DateTime<Local>, sunrise: DateTime<Local>) -> Self {
        Self::new(move |_, _| Ok(SunMoonTimes{sunrise, sunset,
                                              moonrise: None, moonset: None}))
    }
}

impl EphemerisTrait for FakeEphemeris {
    fn compute(&self, location: &Location, now: DateTime<Local>)
               -> Result<SunMoonTimes, CanonicalError> {
        (self.compute)(location, now)
    }
}

/// The real post-processor, except that the disk reports full from the
/// `full_after`th check onwards (counting from zero).
pub struct SwitchableDisk {
    inner: ImageFiles,
    checks: AtomicUsize,
    full_after: Option<usize>,
}

impl SwitchableDisk {
    pub fn new(inner: ImageFiles, full_after: Option<usize>) -> Self {
        SwitchableDisk{inner, checks: AtomicUsize::new(0), full_after}
    }
}

impl ImageProcessorTrait for SwitchableDisk {
    fn is_fresh_capture(&self, path: &Path) -> bool {
        self.inner.is_fresh_capture(path)
    }
    fn rename_raw(&self, file: &Path) -> Result<PathBuf, CanonicalError> {
        self.inner.rename_raw(file)
    }
    fn rename_raw_all(&self, dir: &Path) -> Result<Vec<PathBuf>, CanonicalError> {
        self.inner.rename_raw_all(dir)
    }
    fn thumbnail_path(&self, file: &Path) -> PathBuf {
        self.inner.thumbnail_path(file)
    }
    fn make_thumbnail(&self, file: &Path) -> Result<PathBuf, CanonicalError> {
        self.inner.make_thumbnail(file)
    }
    fn make_all_thumbnails(&self, dir: &Path, images: Option<&[PathBuf]>)
                           -> Result<Vec<PathBuf>, CanonicalError> {
        self.inner.make_all_thumbnails(dir, images)
    }
    fn latest_image(&self, dir: &Path) -> Result<Option<PathBuf>, CanonicalError> {
        self.inner.latest_image(dir)
    }
    fn raw_images(&self, dir: &Path) -> Result<Vec<PathBuf>, CanonicalError> {
        self.inner.raw_images(dir)
    }
    fn shutter_count(&self, file: &Path) -> Option<u64> {
        self.inner.shutter_count(file)
    }
    fn write_last_image_pointer(&self, file: &Path, pointer: &Path)
                                -> Result<(), CanonicalError> {
        self.inner.write_last_image_pointer(file, pointer)
    }
    fn disk_usage(&self, dir: &Path) -> Result<u64, CanonicalError> {
        self.inner.disk_usage(dir)
    }
    fn is_disk_full(&self, _dir: &Path) -> Result<bool, CanonicalError> {
        let n = self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.full_after.is_some_and(|k| n >= k))
    }
}
