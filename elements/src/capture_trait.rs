// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::CanonicalError;

// Image format the camera records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageQuality {
    // Low resolution JPEG, used for the twilight windows.
    Jpeg,
    // Full resolution raw, used at night.
    Raw,
}

impl fmt::Display for ImageQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageQuality::Jpeg => write!(f, "jpeg"),
            ImageQuality::Raw => write!(f, "raw"),
        }
    }
}

/// Who is responsible for ending a tethered capture subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipMode {
    /// The subprocess was told how long to run and exits on its own; the
    /// controller lets go of it right after launch.
    SelfExpiring(Duration),
    /// The subprocess runs until signalled; the controller must tear it down.
    ExternallyTerminated,
}

/// Low level control of a running tether subprocess. Signalling a process
/// that has already exited is not an error.
pub trait TetherProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Returns None while the process is still running.
    fn poll(&mut self) -> Result<Option<ExitStatus>, CanonicalError>;

    /// Asks the process to exit (SIGTERM).
    fn terminate(&mut self) -> Result<(), CanonicalError>;

    /// Forces the process to exit (SIGKILL).
    fn kill(&mut self) -> Result<(), CanonicalError>;
}

/// A tethered capture subprocess together with the rule for ending it.
pub struct ManagedProcess {
    mode: OwnershipMode,
    process: Box<dyn TetherProcess>,
}

impl ManagedProcess {
    pub fn new(mode: OwnershipMode, process: Box<dyn TetherProcess>)
               -> Self {
        ManagedProcess{mode, process}
    }

    pub fn mode(&self) -> OwnershipMode {
        self.mode
    }

    pub fn id(&self) -> Option<u32> {
        self.process.id()
    }

    pub fn process(&mut self) -> &mut dyn TetherProcess {
        self.process.as_mut()
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("mode", &self.mode)
            .field("id", &self.process.id())
            .finish()
    }
}

pub struct TetherRequest<'a> {
    // Downloaded images land here.
    pub working_dir: &'a Path,

    // None means run until signalled.
    pub duration: Option<Duration>,

    // Replace files of the same name rather than failing the download.
    pub force_overwrite: bool,

    // Subprocess stderr goes here; None discards it.
    pub stderr_log: Option<&'a Path>,
}

// The camera as seen through its command line control program. Settings
// cannot be changed while a tether is running.
#[async_trait]
pub trait CaptureTrait: Send + Sync {
    async fn set_quality(&self, quality: ImageQuality) -> Result<(), CanonicalError>;
    async fn set_shutter_speed(&self, shutter_speed: &str) -> Result<(), CanonicalError>;
    async fn set_iso(&self, iso: &str) -> Result<(), CanonicalError>;
    async fn set_manual_exposure_program(&self) -> Result<(), CanonicalError>;
    async fn set_autoiso(&self, enabled: bool) -> Result<(), CanonicalError>;
    async fn set_high_iso_noise_reduction(&self, enabled: bool)
                                          -> Result<(), CanonicalError>;
    async fn set_long_exposure_noise_reduction(&self, enabled: bool)
                                               -> Result<(), CanonicalError>;
    async fn set_vignette_correction(&self, enabled: bool) -> Result<(), CanonicalError>;
    async fn set_aperture(&self, f_number: &str) -> Result<(), CanonicalError>;

    async fn shutter_speed(&self) -> Result<String, CanonicalError>;

    // Sets the camera clock from the host clock.
    async fn sync_clock(&self) -> Result<(), CanonicalError>;
    async fn clock(&self) -> Result<String, CanonicalError>;

    // Copies every image on the camera's card into `dir`.
    async fn download_all_images(&self, dir: &Path) -> Result<(), CanonicalError>;

    // Starts a tethered capture subprocess without waiting for it. The
    // returned handle is SelfExpiring when `request.duration` is set.
    async fn launch_tethered(&self, request: &TetherRequest<'_>)
                             -> Result<ManagedProcess, CanonicalError>;

    // Recovers the camera connection after a failed command.
    async fn reset(&self) -> Result<(), CanonicalError>;
}
