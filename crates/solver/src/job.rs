//! Per-job state and the job registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SolverError};

/// Options of a single solve request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolveOptions {
    /// Skip cache lookups for every vertex of this job.
    pub ignore_cache: bool,
    /// Cancel the job after this long; the deadline is delivered to
    /// operations as cooperative cancellation.
    pub timeout: Option<Duration>,
}

pub(crate) struct Job {
    pub(crate) id: String,
    pub(crate) options: SolveOptions,
    pub(crate) cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct JobRegistry {
    jobs: Mutex<HashMap<String, Arc<Job>>>,
}

impl JobRegistry {
    pub(crate) fn register(&self, id: &str, options: SolveOptions) -> Result<Arc<Job>> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(id) {
            return Err(SolverError::Internal(format!("job {id} already active")));
        }
        let job = Arc::new(Job {
            id: id.to_string(),
            options,
            cancel: CancellationToken::new(),
        });
        jobs.insert(id.to_string(), job.clone());
        Ok(job)
    }

    /// Signal cancellation; `false` when no such job is active.
    pub(crate) fn cancel(&self, id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get(id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: &str) {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}
