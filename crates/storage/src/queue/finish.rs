#![forbid(unsafe_code)]

use super::{
    Effect, Queue, check_host, fetch_existing, finished_effect, guard_transition,
};
use crate::clock::secs_to_ms;
use crate::config::QueueParams;
use crate::error::QueueError;
use crate::record::{self, ClientIdent, Job, JobRun};
use ns_core::ids::JobId;
use ns_core::{IdSet, JobStatus, Transition, classify_transition};
use rusqlite::Transaction;
use tracing::{debug, info, warn};

const CANCEL_CHUNK: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled { from: JobStatus },
    AlreadyCanceled,
}

impl Queue {
    pub fn put_result(
        &self,
        worker: &ClientIdent,
        job_id: JobId,
        ret_code: i32,
        output: &str,
    ) -> Result<(), QueueError> {
        let params = self.params();
        check_host(&params.wnode_hosts, worker, "put results", self.name())?;
        check_output(&params, output)?;
        let now = self.now_ms();
        self.write_tx(|tx, effects| {
            self.put_result_tx(tx, effects, job_id, ret_code, output, &params, now)
        })
    }

    pub(super) fn put_result_tx(
        &self,
        tx: &Transaction<'_>,
        effects: &mut Vec<Effect>,
        job_id: JobId,
        ret_code: i32,
        output: &str,
        params: &QueueParams,
        now: i64,
    ) -> Result<(), QueueError> {
        let mut job = fetch_existing(tx, job_id)?;
        if !guard_transition(&job, JobStatus::Running, JobStatus::Done, "put result")? {
            debug!(queue = %self.name(), job_id, "duplicate result ignored");
            return Ok(());
        }
        let Some(run) = job.last_run_mut() else {
            return Err(QueueError::invalid_status(job_id, JobStatus::Running, "put result"));
        };
        run.close(JobStatus::Done, now);
        run.ret_code = Some(ret_code);
        job.status = JobStatus::Done;
        job.output = output.to_string();
        job.run_deadline_ms = None;

        effects.push(Effect::Status {
            id: job_id,
            from: JobStatus::Running,
            to: JobStatus::Done,
        });
        if params.delete_on_done {
            record::delete(tx, job_id)?;
            effects.push(Effect::Erase {
                id: job_id,
                affinity_id: job.affinity_id,
            });
        } else {
            record::flush(tx, &job)?;
        }
        effects.extend(finished_effect(&job, now));
        Ok(())
    }

    /// Gives a running job back without counting the attempt.
    pub fn return_job(&self, worker: &ClientIdent, job_id: JobId) -> Result<(), QueueError> {
        let params = self.params();
        check_host(&params.wnode_hosts, worker, "return jobs", self.name())?;
        let now = self.now_ms();
        self.write_tx(|tx, effects| {
            let mut job = fetch_existing(tx, job_id)?;
            if !guard_transition(&job, JobStatus::Running, JobStatus::Pending, "return")? {
                return Ok(());
            }
            let Some(run) = job.last_run_mut() else {
                return Err(QueueError::invalid_status(job_id, JobStatus::Running, "return"));
            };
            run.close(JobStatus::Returned, now);
            job.status = JobStatus::Pending;
            job.run_count = job.run_count.saturating_sub(1);
            job.run_deadline_ms = None;
            record::flush(tx, &job)?;
            effects.push(Effect::Status {
                id: job_id,
                from: JobStatus::Running,
                to: JobStatus::Pending,
            });
            effects.push(Effect::Wake {
                affinity_id: affinity_of(&job),
            });
            Ok(())
        })
    }

    /// Records a failed attempt. The job goes back to Pending while it has
    /// retries left; returns the status it ended up in.
    pub fn fail_job(
        &self,
        worker: &ClientIdent,
        job_id: JobId,
        err_msg: &str,
        output: &str,
        ret_code: i32,
    ) -> Result<JobStatus, QueueError> {
        let params = self.params();
        check_host(&params.wnode_hosts, worker, "fail jobs", self.name())?;
        check_output(&params, output)?;
        let now = self.now_ms();
        self.write_tx(|tx, effects| {
            let mut job = fetch_existing(tx, job_id)?;
            if !guard_transition(&job, JobStatus::Running, JobStatus::Failed, "fail")? {
                return Ok(job.status);
            }
            let to = if job.run_count <= params.failed_retries {
                JobStatus::Pending
            } else {
                JobStatus::Failed
            };
            let Some(run) = job.last_run_mut() else {
                return Err(QueueError::invalid_status(job_id, JobStatus::Running, "fail"));
            };
            run.close(JobStatus::Failed, now);
            run.ret_code = Some(ret_code);
            run.err_msg = err_msg.to_string();
            job.status = to;
            job.output = output.to_string();
            job.run_deadline_ms = None;
            record::flush(tx, &job)?;
            effects.push(Effect::Status {
                id: job_id,
                from: JobStatus::Running,
                to,
            });
            if to == JobStatus::Pending {
                effects.push(Effect::Wake {
                    affinity_id: affinity_of(&job),
                });
            } else {
                effects.extend(finished_effect(&job, now));
            }
            Ok(to)
        })
    }

    /// Cancels a pending or running job. Repeating the call is harmless.
    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, QueueError> {
        let now = self.now_ms();
        self.write_tx(|tx, effects| {
            let mut job = fetch_existing(tx, job_id)?;
            match job.status {
                JobStatus::Canceled => Ok(CancelOutcome::AlreadyCanceled),
                JobStatus::Pending | JobStatus::Running => {
                    let from = job.status;
                    cancel_tx(tx, effects, &mut job, now)?;
                    Ok(CancelOutcome::Canceled { from })
                }
                other => Err(QueueError::invalid_status(job_id, other, "cancel")),
            }
        })
    }

    /// Cancels every job currently in one of `statuses` for which
    /// cancellation is a legal transition.
    pub fn cancel_all(&self, statuses: &[JobStatus]) -> Result<usize, QueueError> {
        let mut targets = IdSet::new();
        {
            let index = self.status.read();
            for status in statuses {
                if classify_transition(*status, JobStatus::Canceled) != Transition::Legal {
                    warn!(queue = %self.name(), status = %status, "jobs in this status cannot be canceled");
                    continue;
                }
                targets.union_with(index.set(*status));
            }
        }
        let ids: Vec<JobId> = targets.iter().collect();
        let now = self.now_ms();
        let mut canceled = 0;
        for chunk in ids.chunks(CANCEL_CHUNK) {
            canceled += self.write_tx(|tx, effects| {
                let mut count = 0;
                for id in chunk {
                    let Some(mut job) = record::fetch(tx, *id)? else {
                        continue;
                    };
                    if classify_transition(job.status, JobStatus::Canceled) != Transition::Legal {
                        continue;
                    }
                    cancel_tx(tx, effects, &mut job, now)?;
                    count += 1;
                }
                Ok(count)
            })?;
        }
        info!(queue = %self.name(), canceled, "bulk cancel finished");
        Ok(canceled)
    }

    /// Administrative override: puts the job back to Pending from any status
    /// with fresh counters. Run history is kept.
    pub fn force_reschedule(&self, job_id: JobId) -> Result<(), QueueError> {
        let now = self.now_ms();
        self.write_tx(|tx, effects| {
            let mut job = fetch_existing(tx, job_id)?;
            let from = job.status;
            if from.is_active() {
                if let Some(run) = job.last_run_mut().filter(|run| run.done_ms.is_none()) {
                    run.close(JobStatus::Returned, now);
                    run.err_msg = "rescheduled by administrator".to_string();
                }
            }
            job.status = JobStatus::Pending;
            job.run_count = 0;
            job.read_count = 0;
            job.read_group = 0;
            job.run_deadline_ms = None;
            record::flush(tx, &job)?;
            if from != JobStatus::Pending {
                effects.push(Effect::Status {
                    id: job_id,
                    from,
                    to: JobStatus::Pending,
                });
            }
            effects.push(Effect::Wake {
                affinity_id: affinity_of(&job),
            });
            info!(queue = %self.name(), job_id, from = %from, "job rescheduled");
            Ok(())
        })
    }

    /// Pushes the run deadline of a running job out to at least
    /// `now + extra_s`. Returns whether the deadline moved.
    pub fn delay_expiration(
        &self,
        worker: &ClientIdent,
        job_id: JobId,
        extra_s: u64,
    ) -> Result<bool, QueueError> {
        let params = self.params();
        check_host(&params.wnode_hosts, worker, "delay jobs", self.name())?;
        let now = self.now_ms();
        self.write_tx(|tx, effects| {
            let mut job = fetch_existing(tx, job_id)?;
            if job.status != JobStatus::Running {
                return Err(QueueError::invalid_status(job_id, job.status, "delay expiration"));
            }
            let requested = now.saturating_add(secs_to_ms(extra_s));
            match job.run_deadline_ms {
                // No run timeout in effect: nothing to extend.
                None => Ok(false),
                Some(at) if at >= requested => Ok(false),
                Some(_) => {
                    job.run_deadline_ms = Some(requested);
                    record::flush(tx, &job)?;
                    effects.push(Effect::Deadline {
                        id: job_id,
                        at: Some(requested),
                    });
                    Ok(true)
                }
            }
        })
    }

    pub fn put_progress_message(&self, job_id: JobId, message: &str) -> Result<(), QueueError> {
        let params = self.params();
        check_output(&params, message)?;
        self.write_tx(|tx, _effects| {
            let mut job = fetch_existing(tx, job_id)?;
            job.progress_msg = message.to_string();
            record::flush(tx, &job)
        })
    }
}

fn check_output(params: &QueueParams, output: &str) -> Result<(), QueueError> {
    if output.len() > params.max_output_size {
        return Err(QueueError::OutputTooLong {
            size: output.len(),
            max: params.max_output_size,
        });
    }
    Ok(())
}

fn affinity_of(job: &Job) -> Option<u32> {
    (job.affinity_id != 0).then_some(job.affinity_id)
}

fn cancel_tx(
    tx: &Transaction<'_>,
    effects: &mut Vec<Effect>,
    job: &mut Job,
    now: i64,
) -> Result<(), QueueError> {
    let from = job.status;
    let message = format!("Canceled (was {from})");
    let has_open_run =
        from == JobStatus::Running && job.last_run().is_some_and(|run| run.done_ms.is_none());
    if has_open_run {
        if let Some(run) = job.last_run_mut() {
            run.close(JobStatus::Canceled, now);
            run.err_msg = message;
        }
    } else {
        job.append_run(JobRun {
            status: JobStatus::Canceled,
            start_ms: now,
            done_ms: Some(now),
            ret_code: None,
            err_msg: message,
            node_id: String::new(),
            client_ip: String::new(),
            client_port: 0,
        });
    }
    job.status = JobStatus::Canceled;
    job.run_deadline_ms = None;
    record::flush(tx, job)?;
    effects.push(Effect::Status {
        id: job.id,
        from,
        to: JobStatus::Canceled,
    });
    effects.extend(finished_effect(job, now));
    Ok(())
}
