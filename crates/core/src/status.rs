#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

/// Life-cycle state of a job.
///
/// `Returned` only ever labels a run: a returned job is live in `Pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Returned,
    Canceled,
    Failed,
    Done,
    Reading,
    Confirmed,
    ReadFailed,
}

impl JobStatus {
    /// Statuses a live job can be indexed under.
    pub const INDEXED: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Canceled,
        JobStatus::Failed,
        JobStatus::Done,
        JobStatus::Reading,
        JobStatus::Confirmed,
        JobStatus::ReadFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Returned => "Returned",
            JobStatus::Canceled => "Canceled",
            JobStatus::Failed => "Failed",
            JobStatus::Done => "Done",
            JobStatus::Reading => "Reading",
            JobStatus::Confirmed => "Confirmed",
            JobStatus::ReadFailed => "ReadFailed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        [JobStatus::Returned]
            .into_iter()
            .chain(Self::INDEXED)
            .find(|status| status.as_str().eq_ignore_ascii_case(raw))
    }

    /// Stable numeric code used for persistence.
    pub fn code(self) -> i64 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Returned => 2,
            JobStatus::Canceled => 3,
            JobStatus::Failed => 4,
            JobStatus::Done => 5,
            JobStatus::Reading => 6,
            JobStatus::Confirmed => 7,
            JobStatus::ReadFailed => 8,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => JobStatus::Pending,
            1 => JobStatus::Running,
            2 => JobStatus::Returned,
            3 => JobStatus::Canceled,
            4 => JobStatus::Failed,
            5 => JobStatus::Done,
            6 => JobStatus::Reading,
            7 => JobStatus::Confirmed,
            8 => JobStatus::ReadFailed,
            _ => return None,
        })
    }

    /// Slot in [`JobStatus::INDEXED`]; `None` for `Returned`.
    pub fn index(self) -> Option<usize> {
        Self::INDEXED.iter().position(|s| *s == self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Canceled
                | JobStatus::Failed
                | JobStatus::Done
                | JobStatus::Confirmed
                | JobStatus::ReadFailed
        )
    }

    /// Statuses with an execution run in progress.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Reading)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::parse(s).ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Legal,
    /// A terminal status re-delivered to itself; applied as a no-op.
    Duplicate,
    Illegal,
}

/// The only (from, to) pairs a job may move along.
const LEGAL: &[(JobStatus, JobStatus)] = &[
    (JobStatus::Pending, JobStatus::Running),
    (JobStatus::Pending, JobStatus::Canceled),
    // Retention ran out before any worker picked the job up.
    (JobStatus::Pending, JobStatus::Failed),
    (JobStatus::Running, JobStatus::Pending),
    (JobStatus::Running, JobStatus::Done),
    (JobStatus::Running, JobStatus::Failed),
    (JobStatus::Running, JobStatus::Canceled),
    (JobStatus::Done, JobStatus::Reading),
    (JobStatus::Done, JobStatus::Confirmed),
    (JobStatus::Done, JobStatus::Canceled),
    (JobStatus::Reading, JobStatus::Done),
    (JobStatus::Reading, JobStatus::Confirmed),
    (JobStatus::Reading, JobStatus::ReadFailed),
    (JobStatus::Reading, JobStatus::Canceled),
    (JobStatus::Failed, JobStatus::Canceled),
    (JobStatus::ReadFailed, JobStatus::Canceled),
];

pub fn classify_transition(from: JobStatus, to: JobStatus) -> Transition {
    if from == to {
        return if from.is_terminal() {
            Transition::Duplicate
        } else {
            Transition::Illegal
        };
    }
    if LEGAL.contains(&(from, to)) {
        Transition::Legal
    } else {
        Transition::Illegal
    }
}

pub fn legal_transitions() -> &'static [(JobStatus, JobStatus)] {
    LEGAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_names_round_trip() {
        for status in [JobStatus::Returned].into_iter().chain(JobStatus::INDEXED) {
            assert_eq!(JobStatus::from_code(status.code()), Some(status));
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!("readfailed".parse::<JobStatus>(), Ok(JobStatus::ReadFailed));
        assert!("bogus".parse::<JobStatus>().is_err());
        assert_eq!(JobStatus::from_code(42), None);
    }

    #[test]
    fn returned_is_not_indexed() {
        assert_eq!(JobStatus::Returned.index(), None);
        assert_eq!(JobStatus::Pending.index(), Some(0));
        assert_eq!(JobStatus::ReadFailed.index(), Some(7));
    }

    #[test]
    fn dispatch_and_completion_are_legal() {
        assert_eq!(
            classify_transition(JobStatus::Pending, JobStatus::Running),
            Transition::Legal
        );
        assert_eq!(
            classify_transition(JobStatus::Running, JobStatus::Done),
            Transition::Legal
        );
        assert_eq!(
            classify_transition(JobStatus::Reading, JobStatus::Done),
            Transition::Legal
        );
    }

    #[test]
    fn expired_pending_jobs_may_fail() {
        assert_eq!(
            classify_transition(JobStatus::Pending, JobStatus::Failed),
            Transition::Legal
        );
        assert_eq!(
            classify_transition(JobStatus::Failed, JobStatus::Pending),
            Transition::Illegal
        );
    }

    #[test]
    fn shortcuts_are_illegal() {
        assert_eq!(
            classify_transition(JobStatus::Pending, JobStatus::Done),
            Transition::Illegal
        );
        assert_eq!(
            classify_transition(JobStatus::Pending, JobStatus::Confirmed),
            Transition::Illegal
        );
        assert_eq!(
            classify_transition(JobStatus::Canceled, JobStatus::Pending),
            Transition::Illegal
        );
        assert_eq!(
            classify_transition(JobStatus::Running, JobStatus::Returned),
            Transition::Illegal
        );
    }

    #[test]
    fn terminal_self_loops_are_duplicates() {
        for status in JobStatus::INDEXED {
            let expected = if status.is_terminal() {
                Transition::Duplicate
            } else {
                Transition::Illegal
            };
            assert_eq!(classify_transition(status, status), expected, "{status}");
        }
    }
}
