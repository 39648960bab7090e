#![forbid(unsafe_code)]

use ns_core::JobStatus;
use ns_core::ids::JobId;

/// A job reached a final result and its submitter asked to be told.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedJob {
    pub job_id: JobId,
    pub status: JobStatus,
    pub subm_addr: String,
    pub subm_port: u16,
}

/// Hooks for the notification layer. Called after the change committed and
/// outside of any queue lock.
pub trait JobEventListener: Send + Sync {
    /// Pending work appeared on a queue that had none, or the periodic
    /// reminder fired while work is still waiting.
    fn on_pending(&self, _queue: &str, _affinity_id: Option<u32>) {}

    fn on_job_finished(&self, _queue: &str, _job: &FinishedJob) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl JobEventListener for NoopListener {}
