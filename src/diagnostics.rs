// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use log::{info, warn};
use nix::sys::resource::{UsageWho, getrusage};
use tokio::process::Command;

use interval_elements::clock_trait::ClockTrait;
use interval_elements::hardware_trait::HardwareTrait;

// The microcontroller drops queries that arrive back to back.
const QUERY_GAP: Duration = Duration::from_secs(1);

/// Logs the microcontroller's state, one query per second.
pub async fn log_hardware_info(hardware: &mut dyn HardwareTrait,
                               clock: &dyn ClockTrait) {
    match hardware.temperature() {
        Ok(t) => info!("temperature, {:.1}", t),
        Err(e) => warn!("temperature_failed, {:?}", e),
    }
    clock.sleep(QUERY_GAP).await;
    match hardware.firmware_version() {
        Ok(v) => info!("firmware_version, {}", v),
        Err(e) => warn!("firmware_version_failed, {:?}", e),
    }
    clock.sleep(QUERY_GAP).await;
    match hardware.sequence() {
        Ok(s) => info!("sequence, {}", s),
        Err(e) => warn!("sequence_failed, {:?}", e),
    }
    clock.sleep(QUERY_GAP).await;
    match hardware.debug_codes() {
        Ok(c) => info!("debug_codes, {}", c),
        Err(e) => warn!("debug_codes_failed, {:?}", e),
    }
}

/// Peak resident set size of this process, in kilobytes.
pub fn peak_memory_kb() -> Option<i64> {
    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => Some(usage.max_rss()),
        Err(e) => {
            warn!("getrusage_failed, {}", e);
            None
        },
    }
}

pub fn log_memory() {
    if let Some(kb) = peak_memory_kb() {
        info!("memory_usage_kb, {}", kb);
    }
}

/// Logs the NTP peer table, one line per peer. Absence of ntpq is not an
/// error worth more than a warning.
pub async fn log_time_sync() {
    let output = match Command::new("ntpq").arg("-pn").output().await {
        Ok(output) => output,
        Err(e) => {
            warn!("ntpq_unavailable, {:?}", e);
            return;
        },
    };
    if !output.status.success() {
        warn!("ntpq_failed, {}", output.status);
        return;
    }
    for line in ntp_peer_lines(&String::from_utf8_lossy(&output.stdout)) {
        info!("ntp_peer, {}", line);
    }
}

// Drops the two header lines of `ntpq -p` and blank lines.
fn ntp_peer_lines(stdout: &str) -> Vec<&str> {
    stdout.lines()
        .skip_while(|l| !l.starts_with("=="))
        .skip(1)
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect()
}

// mod tests.
