// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error,
                      not_found_error, unavailable_error};
use log::{debug, info};
use tokio::process::Command;

use interval_elements::capture_trait::{CaptureTrait, ImageQuality,
                                       ManagedProcess, OwnershipMode,
                                       TetherRequest};

use crate::tether::ChildTether;

// Values of the camera's "imagequality" choice list.
const QUALITY_JPEG: &str = "2";
const QUALITY_RAW: &str = "4";

fn on_off(enabled: bool) -> &'static str {
    if enabled { "On" } else { "Off" }
}

// Pulls the value out of `gphoto2 --get-config` output. "Printable:" wins
// over "Current:" when both are present (date settings).
pub fn parse_config_value(output: &str) -> Option<String> {
    let mut current = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("Printable:") {
            return Some(v.trim().to_string());
        }
        if let Some(v) = line.strip_prefix("Current:") {
            current = Some(v.trim().to_string());
        }
    }
    current
}

/// Capture backend driving the camera through the gphoto2 command line
/// program. Each setting is a separate short-lived invocation; tethers are
/// long-lived children in their own process group.
pub struct Gphoto2Backend {
    program: PathBuf,
}

impl Default for Gphoto2Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Gphoto2Backend {
    pub fn new() -> Self {
        Gphoto2Backend{program: PathBuf::from("gphoto2")}
    }

    pub fn with_program(program: &Path) -> Self {
        Gphoto2Backend{program: program.to_path_buf()}
    }

    async fn run(&self, args: &[&str], dir: Option<&Path>)
                 -> Result<String, CanonicalError> {
        let mut command = Command::new(&self.program);
        command.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        let output = command.output().await.map_err(|e| {
            failed_precondition_error(format!("Command::spawn error: {:?}", e).as_str())
        })?;
        if !output.status.success() {
            return Err(unavailable_error(
                format!("gphoto2 {:?} exited with {}: {}", args, output.status,
                        String::from_utf8_lossy(&output.stderr).trim()).as_str()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), CanonicalError> {
        let assignment = format!("{}={}", key, value);
        self.run(&["--set-config", &assignment], None).await?;
        debug!("camera_set, {}", assignment);
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<String, CanonicalError> {
        let output = self.run(&["--get-config", key], None).await?;
        parse_config_value(&output).ok_or_else(|| not_found_error(
            format!("no value for {} in {:?}", key, output).as_str()))
    }
}

#[async_trait]
impl CaptureTrait for Gphoto2Backend {
    async fn set_quality(&self, quality: ImageQuality) -> Result<(), CanonicalError> {
        let value = match quality {
            ImageQuality::Jpeg => QUALITY_JPEG,
            ImageQuality::Raw => QUALITY_RAW,
        };
        self.set_config("imagequality", value).await
    }

    async fn set_shutter_speed(&self, shutter_speed: &str) -> Result<(), CanonicalError> {
        self.set_config("shutterspeed", shutter_speed).await
    }

    async fn set_iso(&self, iso: &str) -> Result<(), CanonicalError> {
        self.set_config("iso", iso).await
    }

    async fn set_manual_exposure_program(&self) -> Result<(), CanonicalError> {
        self.set_config("expprogram", "M").await
    }

    async fn set_autoiso(&self, enabled: bool) -> Result<(), CanonicalError> {
        self.set_config("autoiso", on_off(enabled)).await
    }

    async fn set_high_iso_noise_reduction(&self, enabled: bool)
                                          -> Result<(), CanonicalError> {
        self.set_config("highisonr", on_off(enabled)).await
    }

    async fn set_long_exposure_noise_reduction(&self, enabled: bool)
                                               -> Result<(), CanonicalError> {
        self.set_config("longexpnr", on_off(enabled)).await
    }

    async fn set_vignette_correction(&self, enabled: bool) -> Result<(), CanonicalError> {
        self.set_config("vignette", on_off(enabled)).await
    }

    async fn set_aperture(&self, f_number: &str) -> Result<(), CanonicalError> {
        self.set_config("f-number", f_number).await
    }

    async fn shutter_speed(&self) -> Result<String, CanonicalError> {
        self.get_config("shutterspeed").await
    }

    async fn sync_clock(&self) -> Result<(), CanonicalError> {
        self.set_config("syncdatetime", "1").await
    }

    async fn clock(&self) -> Result<String, CanonicalError> {
        self.get_config("datetime").await
    }

    async fn download_all_images(&self, dir: &Path) -> Result<(), CanonicalError> {
        let output = self.run(&["--get-all-files", "--skip-existing"], Some(dir)).await?;
        info!("camera_download, {}, {}", dir.display(), output.lines().count());
        Ok(())
    }

    async fn launch_tethered(&self, request: &TetherRequest<'_>)
                             -> Result<ManagedProcess, CanonicalError> {
        let mut command = Command::new(&self.program);
        command.arg("--capture-tethered");
        if let Some(duration) = request.duration {
            command.arg(format!("{}s", duration.as_secs()));
        }
        if request.force_overwrite {
            command.arg("--force-overwrite");
        }
        let stderr = match request.stderr_log {
            Some(log) => Stdio::from(File::create(log).map_err(|e| {
                failed_precondition_error(format!("{:?}: {:?}", log, e).as_str())
            })?),
            None => Stdio::null(),
        };
        let child = command.current_dir(request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| failed_precondition_error(
                format!("Command::spawn error: {:?}", e).as_str()))?;
        let mode = match request.duration {
            Some(duration) => OwnershipMode::SelfExpiring(duration),
            None => OwnershipMode::ExternallyTerminated,
        };
        let tether = ManagedProcess::new(mode, Box::new(ChildTether::new(child)));
        info!("tether_started, {:?}, {:?}", tether.id(), mode);
        Ok(tether)
    }

    async fn reset(&self) -> Result<(), CanonicalError> {
        self.run(&["--reset"], None).await?;
        info!("gphoto_reset");
        Ok(())
    }
}

// mod tests.
