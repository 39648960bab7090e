#![forbid(unsafe_code)]

//! Done -> Reading -> Confirmed | ReadFailed, one read group at a time.

use super::{Effect, Queue, check_host};
use crate::clock::secs_to_ms;
use crate::error::QueueError;
use crate::record::{self, ClientIdent};
use crate::schema::{self, LAST_GROUP_ID};
use ns_core::JobStatus;
use ns_core::ids::JobId;
use tracing::debug;

/// Jobs handed to one reader; confirmed or failed together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadBatch {
    pub group: u32,
    pub job_ids: Vec<JobId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseRead {
    Confirm,
    Fail,
    Rollback,
}

impl CloseRead {
    fn op(self) -> &'static str {
        match self {
            CloseRead::Confirm => "confirm read",
            CloseRead::Fail => "fail read",
            CloseRead::Rollback => "roll back read",
        }
    }
}

impl Queue {
    /// Moves up to `count` Done jobs into a new read group.
    pub fn read_jobs(
        &self,
        reader: &ClientIdent,
        count: usize,
    ) -> Result<Option<ReadBatch>, QueueError> {
        if count == 0 {
            return Err(QueueError::InvalidInput("read count must be positive".into()));
        }
        let params = self.params();
        check_host(&params.reader_hosts, reader, "read", self.name())?;
        let now = self.now_ms();
        let deadline = (params.read_timeout_s > 0)
            .then(|| now.saturating_add(secs_to_ms(params.read_timeout_s)));

        self.write_tx(|tx, effects| {
            let mut picked = Vec::new();
            let mut next = self.status.read().set(JobStatus::Done).first();
            while let Some(id) = next {
                if picked.len() >= count {
                    break;
                }
                if !self.is_queued_for_erase(id) {
                    match record::fetch(tx, id)? {
                        None => effects.push(Effect::Resync { id, status: None }),
                        Some(job) if job.status != JobStatus::Done => {
                            effects.push(Effect::Resync {
                                id,
                                status: Some(job.status),
                            });
                        }
                        Some(job) => picked.push(job),
                    }
                }
                next = self.status.read().set(JobStatus::Done).next(id);
            }
            if picked.is_empty() {
                return Ok(None);
            }

            let group = schema::next_counter_tx(tx, LAST_GROUP_ID)?;
            let mut job_ids = Vec::with_capacity(picked.len());
            for mut job in picked {
                job.status = JobStatus::Reading;
                job.read_group = group;
                job.read_count += 1;
                job.run_deadline_ms = deadline;
                record::flush(tx, &job)?;
                effects.push(Effect::Status {
                    id: job.id,
                    from: JobStatus::Done,
                    to: JobStatus::Reading,
                });
                effects.push(Effect::Deadline {
                    id: job.id,
                    at: deadline,
                });
                effects.push(Effect::JoinReadGroup { group, id: job.id });
                job_ids.push(job.id);
            }
            debug!(queue = %self.name(), group, jobs = job_ids.len(), "read group opened");
            Ok(Some(ReadBatch { group, job_ids }))
        })
    }

    pub fn confirm_read_group(&self, reader: &ClientIdent, group: u32) -> Result<usize, QueueError> {
        self.close_read_group(reader, group, CloseRead::Confirm)
    }

    /// Jobs with read retries left go back to Done, the rest to ReadFailed.
    pub fn fail_read_group(&self, reader: &ClientIdent, group: u32) -> Result<usize, QueueError> {
        self.close_read_group(reader, group, CloseRead::Fail)
    }

    /// Returns the group to Done without counting the read attempt.
    pub fn rollback_read_group(&self, reader: &ClientIdent, group: u32) -> Result<usize, QueueError> {
        self.close_read_group(reader, group, CloseRead::Rollback)
    }

    pub fn read_group_members(&self, group: u32) -> Option<Vec<JobId>> {
        self.read_groups
            .read()
            .get(&group)
            .map(|members| members.iter().collect())
    }

    fn close_read_group(
        &self,
        reader: &ClientIdent,
        group: u32,
        close: CloseRead,
    ) -> Result<usize, QueueError> {
        let params = self.params();
        check_host(&params.reader_hosts, reader, close.op(), self.name())?;
        let members = self
            .read_groups
            .read()
            .get(&group)
            .cloned()
            .ok_or_else(|| QueueError::InvalidInput(format!("unknown read group {group}")))?;

        self.write_tx(|tx, effects| {
            let mut closed = 0;
            for id in members.iter() {
                let Some(mut job) = record::fetch(tx, id)? else {
                    effects.push(Effect::Resync { id, status: None });
                    continue;
                };
                if job.status != JobStatus::Reading || job.read_group != group {
                    continue;
                }
                let to = match close {
                    CloseRead::Confirm => JobStatus::Confirmed,
                    CloseRead::Fail if job.read_count <= params.read_failed_retries => {
                        JobStatus::Done
                    }
                    CloseRead::Fail => JobStatus::ReadFailed,
                    CloseRead::Rollback => {
                        job.read_count = job.read_count.saturating_sub(1);
                        JobStatus::Done
                    }
                };
                job.status = to;
                job.read_group = 0;
                job.run_deadline_ms = None;
                record::flush(tx, &job)?;
                effects.push(Effect::Status {
                    id,
                    from: JobStatus::Reading,
                    to,
                });
                closed += 1;
            }
            Ok(closed)
        })
    }
}
