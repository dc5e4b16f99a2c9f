// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

// Slow side tasks that touch the data directory (mask copies and the like).
// Both teardown paths join every job before the hardware channel is
// released, so nothing writes to the data directory after the session ends.
#[derive(Default)]
pub struct JobList {
    jobs: Vec<(String, JoinHandle<Result<(), CanonicalError>>)>,
}

impl JobList {
    pub fn new() -> Self {
        JobList{jobs: Vec::new()}
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    // Runs `work` on the blocking thread pool.
    pub fn spawn_blocking<F>(&mut self, name: &str, work: F)
    where F: FnOnce() -> Result<(), CanonicalError> + Send + 'static
    {
        debug!("job_started, {}", name);
        self.jobs.push((name.to_string(), tokio::task::spawn_blocking(work)));
    }

    /// Waits for every outstanding job. Returns how many completed without
    /// error.
    pub async fn join_all(&mut self) -> usize {
        let (names, handles): (Vec<_>, Vec<_>) = self.jobs.drain(..).unzip();
        let results = join_all(handles).await;
        let mut succeeded = 0;
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(Ok(())) => {
                    succeeded += 1;
                    debug!("job_finished, {}", name);
                },
                Ok(Err(e)) => warn!("job_failed, {}, {:?}", name, e),
                Err(e) => warn!("job_panicked, {}, {:?}", name, e),
            }
        }
        info!("finished_outstanding_tasks, {}", names.len());
        succeeded
    }
}

// mod tests.
