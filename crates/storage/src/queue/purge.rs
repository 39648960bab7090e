#![forbid(unsafe_code)]

//! Entry points of the background passes: execution watcher, retention
//! purge, affinity collection and pending reminders.

use super::{Effect, Queue, finished_effect};
use crate::clock::secs_to_ms;
use crate::error::QueueError;
use crate::record::{self, Job, JobRun};
use ns_core::JobStatus;
use ns_core::ids::JobId;
use rusqlite::Transaction;
use tracing::{debug, warn};

const TIMEOUT_CHUNK: usize = 256;

pub(super) const EXPIRED_MSG: &str = "Job expired before dispatch";

/// Fails a pending job whose retention ran out and queues it for deletion.
/// The job leaves the Pending set when the transaction commits.
pub(super) fn expire_pending_tx(
    tx: &Transaction<'_>,
    effects: &mut Vec<Effect>,
    job: &mut Job,
    now: i64,
) -> Result<(), QueueError> {
    job.append_run(JobRun {
        status: JobStatus::Failed,
        start_ms: now,
        done_ms: Some(now),
        ret_code: None,
        err_msg: EXPIRED_MSG.to_string(),
        node_id: String::new(),
        client_ip: String::new(),
        client_port: 0,
    });
    job.status = JobStatus::Failed;
    job.run_deadline_ms = None;
    record::flush(tx, job)?;
    effects.push(Effect::Status {
        id: job.id,
        from: JobStatus::Pending,
        to: JobStatus::Failed,
    });
    effects.push(Effect::QueueErase(job.id));
    effects.extend(finished_effect(job, now));
    Ok(())
}

impl Queue {
    /// Ages out running and reading jobs whose run deadline has passed.
    /// Returns how many jobs changed status.
    pub fn check_execution_timeout(&self) -> Result<usize, QueueError> {
        let now = self.now_ms();
        let due = self.timeline.read().due(now);
        if due.is_empty() {
            return Ok(0);
        }
        let params = self.params();
        let mut moved = 0;
        for chunk in due.chunks(TIMEOUT_CHUNK) {
            moved += self.write_tx(|tx, effects| {
                let mut moved = 0;
                for id in chunk {
                    let id = *id;
                    let Some(mut job) = record::fetch(tx, id)? else {
                        effects.push(Effect::Resync { id, status: None });
                        continue;
                    };
                    if !job.status.is_active() {
                        effects.push(Effect::Deadline { id, at: None });
                        continue;
                    }
                    match job.run_deadline_ms {
                        Some(at) if at <= now => {}
                        other => {
                            effects.push(Effect::Deadline { id, at: other });
                            continue;
                        }
                    }

                    let from = job.status;
                    let to = if from == JobStatus::Running {
                        if job.run_count <= params.failed_retries {
                            JobStatus::Pending
                        } else {
                            JobStatus::Failed
                        }
                    } else if job.read_count <= params.read_failed_retries {
                        JobStatus::Done
                    } else {
                        JobStatus::ReadFailed
                    };
                    if from == JobStatus::Running {
                        if let Some(run) = job.last_run_mut() {
                            run.close(JobStatus::Failed, now);
                            run.err_msg = "Job execution timed out".to_string();
                        }
                    }
                    job.status = to;
                    job.run_deadline_ms = None;
                    job.read_group = 0;
                    record::flush(tx, &job)?;
                    effects.push(Effect::Status { id, from, to });
                    if to == JobStatus::Pending {
                        effects.push(Effect::Wake {
                            affinity_id: (job.affinity_id != 0).then_some(job.affinity_id),
                        });
                    }
                    warn!(queue = %self.name(), job_id = id, from = %from, status = %to, "execution timeout");
                    moved += 1;
                }
                Ok(moved)
            })?;
        }
        Ok(moved)
    }

    /// Scans up to `batch_size` jobs of `status`, continuing where the
    /// previous scan of that status stopped, and queues the ones past their
    /// retention for deletion. Expired pending jobs are failed on the spot.
    /// Returns how many were newly queued.
    pub fn check_jobs_expiry(
        &self,
        batch_size: usize,
        status: JobStatus,
    ) -> Result<usize, QueueError> {
        let Some(slot) = status.index() else {
            return Ok(0);
        };
        if batch_size == 0 {
            return Ok(0);
        }
        let params = self.params();
        let now = self.now_ms();
        let mut cursor = self.expiry_cursor.lock();

        let ids: Vec<JobId> = {
            let index = self.status.read();
            let set = index.set(status);
            let mut ids = Vec::with_capacity(batch_size);
            let mut next = set.first_from(cursor[slot]);
            while let Some(id) = next {
                if ids.len() >= batch_size {
                    break;
                }
                ids.push(id);
                next = set.next(id);
            }
            ids
        };
        cursor[slot] = match ids.last() {
            Some(last) if ids.len() >= batch_size => last.saturating_add(1),
            _ => 0,
        };
        drop(cursor);

        let expired = self.read_tx(|tx| {
            let mut expired = Vec::new();
            for id in &ids {
                let Some((submit_ms, timeout_s)) = record::fetch_expiry(tx, *id)? else {
                    continue;
                };
                let timeout_s = if timeout_s > 0 {
                    timeout_s
                } else {
                    params.timeout_s
                };
                if submit_ms.saturating_add(secs_to_ms(timeout_s)) <= now {
                    expired.push(*id);
                }
            }
            Ok(expired)
        })?;

        if status == JobStatus::Pending && !expired.is_empty() {
            let failed = self.write_tx(|tx, effects| {
                let mut failed = 0;
                for id in &expired {
                    let Some(mut job) = record::fetch(tx, *id)? else {
                        continue;
                    };
                    if job.status == JobStatus::Pending {
                        expire_pending_tx(tx, effects, &mut job, now)?;
                        failed += 1;
                    }
                }
                Ok(failed)
            })?;
            if failed > 0 {
                debug!(queue = %self.name(), failed, "expired pending jobs failed");
            }
        }

        let mut queued = 0;
        let mut erase_queue = self.erase_queue.lock();
        for id in expired {
            if erase_queue.insert(id) {
                queued += 1;
            }
        }
        if queued > 0 {
            debug!(queue = %self.name(), status = %status, queued, "expired jobs queued for deletion");
        }
        Ok(queued)
    }

    /// Physically deletes up to `batch_size` queued jobs.
    pub fn do_delete_batch(&self, batch_size: usize) -> Result<usize, QueueError> {
        let ids: Vec<JobId> = self.erase_queue.lock().iter().take(batch_size).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = self.write_tx(|tx, effects| {
            let mut deleted = 0;
            for id in &ids {
                // The status may have moved since the id was queued; erasing
                // clears whichever set holds it now.
                let affinity_id = match record::delete(tx, *id)? {
                    Some(affinity_id) => {
                        deleted += 1;
                        affinity_id
                    }
                    None => 0,
                };
                effects.push(Effect::Erase {
                    id: *id,
                    affinity_id,
                });
            }
            Ok(deleted)
        })?;
        debug!(queue = %self.name(), deleted, "delete batch done");
        Ok(deleted)
    }

    /// Number of jobs waiting for physical deletion.
    pub fn erase_backlog(&self) -> u64 {
        self.erase_queue.lock().len()
    }

    /// Drops affinity ids with no jobs left once their grace period passed.
    pub fn gc_affinities(&self) -> Result<usize, QueueError> {
        let grace_ms = self.tuning.read().affinity_grace_ms;
        {
            // Status before affinity, as when effects are applied.
            let status = self.status.read();
            self.affinity.write().prune_jobs(&status.all_jobs());
        }
        let now = self.now_ms();
        let retired = self.write_tx(|tx, effects| {
            let ids = self.affinity.read().retirable(now, grace_ms);
            for id in &ids {
                record::delete_affinity_tx(tx, *id)?;
                effects.push(Effect::RetireAffinity(*id));
            }
            Ok(ids.len())
        })?;
        if retired > 0 {
            debug!(queue = %self.name(), retired, "affinities retired");
        }
        Ok(retired)
    }

    /// Re-compacts the in-memory sets.
    pub fn optimize_indices(&self) {
        self.status.write().optimize();
    }

    /// Reminds listeners that work is waiting. Returns whether anything is
    /// pending.
    pub fn notify_listeners(&self) -> bool {
        if !self.is_alive() || self.status.read().is_empty(JobStatus::Pending) {
            return false;
        }
        self.listener.on_pending(self.name(), None);
        true
    }
}
