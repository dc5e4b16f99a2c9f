// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// The two ways a session ends. Both leave the shutter released and the
// camera and fan powered down, join outstanding jobs and close the hardware
// channel exactly once.

use log::{error, info, warn};

use crate::diagnostics;
use crate::session::{AbortReason, BUFFER_DRAIN, NightSession, Phase,
                     SessionOutcome, absorb};
use crate::tether::{TETHER_SETTLE, teardown_tether};

impl NightSession {
    fn close_hardware(&mut self) {
        if self.hardware_closed {
            return;
        }
        absorb("close", self.hardware.close());
        self.hardware_closed = true;
    }

    /// Abbreviated teardown for disk-full, interruption and an unusable
    /// schedule. Skips the download of images left on the camera.
    pub(crate) async fn fault_shutdown(&mut self, reason: AbortReason) -> SessionOutcome {
        error!("fault_shutdown, {}, {:?}", reason, self.phase());
        self.advance(Phase::Shutdown);
        absorb("shutter_off", self.hardware.shutter_off());
        absorb("fan_off", self.hardware.fan_off());
        if let Some(tether) = self.night_tether.take() {
            teardown_tether(tether, self.clock.as_ref(), TETHER_SETTLE).await;
        }
        absorb("wait_ready", self.hardware.wait_until_ready());
        absorb("video_off", self.hardware.video_off());
        self.video_active = false;
        self.clock.sleep(BUFFER_DRAIN).await;
        absorb("camera_off", self.hardware.camera_off());
        self.jobs.join_all().await;
        self.close_hardware();
        info!("fault_shutdown_done, {}", reason);
        SessionOutcome::Aborted(reason)
    }

    /// End of night teardown, followed by the final image pass and the
    /// decision whether to hand off to downstream processing.
    pub(crate) async fn normal_shutdown(&mut self) -> SessionOutcome {
        info!("normal_shutdown, {}", self.clock.now().to_rfc3339());
        self.advance(Phase::Shutdown);
        absorb("shutter_off", self.hardware.shutter_off());
        if self.video_active {
            absorb("video_off", self.hardware.video_off());
            self.video_active = false;
        }
        absorb("wait_ready", self.hardware.wait_until_ready());
        self.clock.sleep(BUFFER_DRAIN).await;
        self.jobs.join_all().await;
        absorb("download_remaining",
               self.capture.download_all_images(&self.data_path).await);
        absorb("camera_off", self.hardware.camera_off());
        absorb("fan_off", self.hardware.fan_off());
        self.close_hardware();

        if let Some(renamed) = absorb("final_rename", self.images.rename_raw_all(&self.data_path)) {
            info!("final_rename, {}", renamed.len());
        }
        if self.config.wants_full_thumbnail_pass() {
            if let Some(thumbs) = absorb("full_thumbnails",
                                         self.images.make_all_thumbnails(&self.data_path, None)) {
                info!("full_thumbnail_pass, {}", thumbs.len());
            }
        }
        self.log_shutter_count();
        self.log_final_diagnostics().await;

        if self.test_time.is_some() || !self.config.event_detect.enabled {
            info!("no_handoff");
            return SessionOutcome::Completed;
        }
        let now = self.clock.now();
        let reboot = match self.config.next_reboot(now) {
            Ok(reboot) => reboot,
            Err(e) => {
                warn!("reboot_time_unusable, {:?}", e);
                return SessionOutcome::Completed;
            },
        };
        info!("handoff, {}, {}, {}", self.config.event_detect.supervisor.display(),
              reboot.to_rfc3339(), self.config.event_detect.day_mask);
        SessionOutcome::Handoff{
            supervisor: self.config.event_detect.supervisor.clone(),
            data_path: self.data_path.clone(),
            reboot_epoch: reboot.timestamp(),
            day_mask: self.config.event_detect.day_mask.clone(),
        }
    }

    // Rough shutter count from the newest raw file.
    fn log_shutter_count(&self) {
        let newest = match self.images.raw_images(&self.data_path) {
            Ok(mut raws) => raws.pop(),
            Err(e) => {
                warn!("raw_listing_failed, {:?}", e);
                None
            },
        };
        let Some(newest) = newest else {
            info!("shutter_count, none");
            return;
        };
        match self.images.shutter_count(&newest) {
            Some(count) => info!("shutter_count, {}, {}", count, newest.display()),
            None => info!("shutter_count, unknown, {}", newest.display()),
        }
    }

    async fn log_final_diagnostics(&self) {
        diagnostics::log_memory();
        match self.images.disk_usage(&self.data_path) {
            Ok(bytes) => info!("disk_usage_bytes, {}", bytes),
            Err(e) => warn!("disk_usage_failed, {:?}", e),
        }
        diagnostics::log_time_sync().await;
    }
}

// mod tests.
