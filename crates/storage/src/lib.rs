#![forbid(unsafe_code)]

//! Job queue engine: durable job records in per-queue SQLite blocks, with
//! in-memory status, affinity, tag and deadline indices rebuilt on mount.

mod clock;
mod config;
mod error;
mod index;
mod listener;
mod queue;
mod record;
mod registry;
mod retry;
mod schema;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LoopConfig, PurgeConfig, QueueDecl, QueueParams, RegistryConfig};
pub use error::QueueError;
pub use index::{AffinityRegistry, ExecutionTimeline, StatusIndex, TagIndex};
pub use listener::{FinishedJob, JobEventListener, NoopListener};
pub use queue::{
    AffinityPrefs, BatchAffinity, CancelOutcome, JobDescription, NewJob, Queue, QueueDescriptor,
    QueueInfo, QueueKind, ReadBatch,
};
pub use record::{ClientIdent, Job, JobRun, MASK_OUT_OF_ORDER};
pub use registry::QueueRegistry;
pub use retry::{RetryPolicy, is_transient, with_retry};

pub use ns_core::ids::JobId;
pub use ns_core::{IdSet, JobStatus};
