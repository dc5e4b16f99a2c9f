// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::ErrorKind;
use std::process::ExitStatus;
use std::time::Duration;

use canonical_error::{CanonicalError, internal_error};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Child;

use interval_elements::capture_trait::{ManagedProcess, OwnershipMode,
                                       TetherProcess};
use interval_elements::clock_trait::ClockTrait;

// Time given to an externally terminated tether to write out its last
// download before it is signalled.
pub const TETHER_SETTLE: Duration = Duration::from_secs(5);

// A tether subprocess started as the leader of its own process group, so
// that helpers it forks are signalled along with it.
pub struct ChildTether {
    child: Child,
    pgid: Option<i32>,
    exit_status: Option<ExitStatus>,
}

impl ChildTether {
    // `child` must have been spawned with process_group(0).
    pub fn new(child: Child) -> Self {
        let pgid = child.id().map(|id| id as i32);
        ChildTether{child, pgid, exit_status: None}
    }

    fn signal_group(&self, signal: Signal) -> Result<(), CanonicalError> {
        if self.exit_status.is_some() {
            return Ok(());  // Reaped; the pgid may have been reused.
        }
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(internal_error(
                format!("killpg({}, {:?}): {}", pgid, signal, e).as_str())),
        }
    }
}

impl TetherProcess for ChildTether {
    fn id(&self) -> Option<u32> {
        self.pgid.map(|id| id as u32)
    }

    fn poll(&mut self) -> Result<Option<ExitStatus>, CanonicalError> {
        if self.exit_status.is_some() {
            return Ok(self.exit_status);
        }
        match self.child.try_wait() {
            Ok(status) => {
                self.exit_status = status;
                Ok(status)
            },
            Err(e) => Err(internal_error(format!("try_wait: {:?}", e).as_str())),
        }
    }

    fn terminate(&mut self) -> Result<(), CanonicalError> {
        self.signal_group(Signal::SIGTERM)
    }

    fn kill(&mut self) -> Result<(), CanonicalError> {
        self.signal_group(Signal::SIGKILL)?;
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already exited and reaped.
            Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(internal_error(format!("start_kill: {:?}", e).as_str())),
        }
    }
}

fn log_liveness(process: &mut dyn TetherProcess, id: Option<u32>) -> bool {
    match process.poll() {
        Ok(None) => {
            debug!("Tether_not_killed, {:?}", id);
            true
        },
        Ok(Some(status)) => {
            debug!("Tether_killed, {:?}, {}", id, status);
            false
        },
        Err(e) => {
            warn!("tether_poll_error, {:?}, {:?}", id, e);
            true
        },
    }
}

/// Ends a tether according to its ownership mode. A self-expiring tether is
/// simply released. An externally terminated one gets `settle` to finish its
/// last download, then SIGTERM followed by SIGKILL regardless of whether the
/// first signal worked. Never fails; returns true if the process was seen
/// alive after the signals.
pub async fn teardown_tether(mut tether: ManagedProcess,
                             clock: &dyn ClockTrait,
                             settle: Duration) -> bool {
    let id = tether.id();
    match tether.mode() {
        OwnershipMode::SelfExpiring(duration) => {
            debug!("tether_released, {:?}, {}s", id, duration.as_secs());
            false
        },
        OwnershipMode::ExternallyTerminated => {
            clock.sleep(settle).await;
            let process = tether.process();
            log_liveness(process, id);
            if let Err(e) = process.terminate() {
                warn!("tether_terminate_error, {:?}, {:?}", id, e);
            }
            if let Err(e) = process.kill() {
                warn!("tether_kill_error, {:?}, {:?}", id, e);
            }
            let alive = log_liveness(process, id);
            info!("tether_teardown_done, {:?}, {}", id,
                  if alive { "alive" } else { "exited" });
            alive
        },
    }
}

// mod tests.
