// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};

use canonical_error::{CanonicalError, failed_precondition_error};
use chrono::{DateTime, Local};
use log::{debug, info, warn};

use interval_elements::cloud_trait::{CloudMonitorTrait, CloudStatus};

/// Reads the cloud status the video cloud detector publishes as a single
/// integer in a text file, and starts that detector.
pub struct FileCloudMonitor {
    status_file: PathBuf,
    max_age: Duration,

    // Program and leading arguments of the video analysis; the end time is
    // appended as a unix epoch.
    video_command: Option<Vec<String>>,
}

impl FileCloudMonitor {
    pub fn new(status_file: &Path, max_age: Duration,
               video_command: Option<Vec<String>>) -> Self {
        FileCloudMonitor{status_file: status_file.to_path_buf(), max_age, video_command}
    }

    fn read_code(&self) -> Result<i64, String> {
        let metadata = fs::metadata(&self.status_file).map_err(|e| e.to_string())?;
        let modified = metadata.modified().map_err(|e| e.to_string())?;
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age > self.max_age {
            return Err(format!("stale by {:?}", age));
        }
        let content = fs::read_to_string(&self.status_file).map_err(|e| e.to_string())?;
        content.trim().parse::<i64>().map_err(|e| format!("{:?}: {}", content.trim(), e))
    }
}

impl CloudMonitorTrait for FileCloudMonitor {
    fn read_status(&self) -> CloudStatus {
        match self.read_code() {
            Ok(code) => CloudStatus::from_code(code),
            Err(reason) => {
                debug!("cloud_status_unreadable, {}, {}",
                       self.status_file.display(), reason);
                CloudStatus::Unknown
            },
        }
    }

    fn spawn_video_analysis(&mut self, until: DateTime<Local>)
                            -> Result<(), CanonicalError> {
        let Some(command) = &self.video_command else {
            warn!("video_analysis_not_configured");
            return Ok(());
        };
        let Some((program, args)) = command.split_first() else {
            return Err(failed_precondition_error("empty video_command"));
        };
        // Runs until `until` on its own; never waited on.
        let child = Command::new(program)
            .args(args)
            .arg(until.timestamp().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| failed_precondition_error(
                format!("Command::spawn error: {:?}", e).as_str()))?;
        info!("video_analysis_started, {}, {}", child.id(), until.to_rfc3339());
        Ok(())
    }
}

// mod tests.
