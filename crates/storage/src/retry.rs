#![forbid(unsafe_code)]

//! Deadlock / busy retry for transaction bodies.
//!
//! A body is re-run from scratch on every attempt; it must not touch
//! in-memory state, only return a value describing what to apply once the
//! transaction has committed.

use crate::error::QueueError;
use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            backoff_ms: 5,
        }
    }
}

/// Busy, locked and out-of-memory results are worth another attempt; any
/// other storage failure is final.
pub fn is_transient(err: &QueueError) -> bool {
    match err {
        QueueError::Sql(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::OutOfMemory
        ),
        _ => false,
    }
}

pub fn with_retry<T>(
    policy: &RetryPolicy,
    mut body: impl FnMut() -> Result<T, QueueError>,
) -> Result<T, QueueError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match body() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                if attempt >= max_attempts {
                    tracing::error!(attempts = attempt, error = %err, "retry budget exhausted");
                    return Err(QueueError::TransientStorage { attempts: attempt });
                }
                tracing::debug!(attempt, error = %err, "transient storage error, retrying");
                std::thread::sleep(Duration::from_millis(policy.backoff_ms));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> QueueError {
        QueueError::Sql(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_ms: 0,
        }
    }

    #[test]
    fn busy_is_retried_until_success() {
        let mut calls = 0;
        let value = with_retry(&quick(10), || {
            calls += 1;
            if calls < 4 { Err(busy()) } else { Ok(calls) }
        })
        .expect("eventually succeeds");
        assert_eq!(value, 4);
        assert_eq!(calls, 4);
    }

    #[test]
    fn exhausted_budget_is_reported() {
        let mut calls = 0;
        let err = with_retry(&quick(3), || -> Result<(), QueueError> {
            calls += 1;
            Err(busy())
        })
        .expect_err("budget exhausted");
        assert!(matches!(err, QueueError::TransientStorage { attempts: 3 }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let err = with_retry(&quick(10), || -> Result<(), QueueError> {
            calls += 1;
            Err(QueueError::JobNotFound(7))
        })
        .expect_err("not retried");
        assert!(matches!(err, QueueError::JobNotFound(7)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn constraint_violation_is_not_transient() {
        let err = QueueError::Sql(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!is_transient(&err));
        assert!(is_transient(&busy()));
    }
}
