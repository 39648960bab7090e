#![forbid(unsafe_code)]

use ns_core::ids::{JobId, QueueNameError};
use ns_core::query::QueryError;
use ns_core::JobStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),
    #[error("unknown queue class '{0}'")]
    UnknownQueueClass(String),
    #[error("queue '{0}' already exists")]
    DuplicateName(String),
    #[error("input is {size} bytes, queue limit is {max}")]
    InputTooLong { size: usize, max: usize },
    #[error("output is {size} bytes, queue limit is {max}")]
    OutputTooLong { size: usize, max: usize },
    #[error("job {job_id} is {status}, cannot {op}")]
    InvalidJobStatus {
        job_id: JobId,
        status: JobStatus,
        op: &'static str,
    },
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("query syntax error: {0}")]
    QuerySyntax(#[from] QueryError),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("storage stayed busy after {attempts} attempts")]
    TransientStorage { attempts: u32 },
    #[error("all {0} queue slots are in use")]
    TooManyQueues(usize),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("config: {0}")]
    Config(String),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<QueueNameError> for QueueError {
    fn from(value: QueueNameError) -> Self {
        Self::InvalidInput(value.to_string())
    }
}

impl QueueError {
    pub(crate) fn invalid_status(job_id: JobId, status: JobStatus, op: &'static str) -> Self {
        Self::InvalidJobStatus { job_id, status, op }
    }
}
