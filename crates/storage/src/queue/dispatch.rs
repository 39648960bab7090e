#![forbid(unsafe_code)]

use super::purge::expire_pending_tx;
use super::{Effect, Queue, check_host, fetch_existing, run_timeout_ms};
use crate::config::QueueParams;
use crate::error::QueueError;
use crate::record::{self, ClientIdent, Job, JobRun};
use ns_core::ids::JobId;
use ns_core::{IdSet, JobStatus};
use rusqlite::Transaction;
use tracing::debug;

/// Which affinities a worker wants work for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AffinityPrefs {
    pub tokens: Vec<String>,
    /// With declared tokens, fall back to any pending job once none of the
    /// preferred ones is available.
    pub any_affinity: bool,
}

impl AffinityPrefs {
    /// No preference: lowest pending id wins.
    pub fn any() -> Self {
        Self::default()
    }

    /// Only jobs carrying one of `tokens`.
    pub fn only<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            any_affinity: false,
        }
    }

    /// Jobs carrying one of `tokens` first, then anything.
    pub fn prefer<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            any_affinity: true,
        }
    }
}

impl Queue {
    /// Hands the lowest eligible pending job to `worker`.
    pub fn get_job(
        &self,
        worker: &ClientIdent,
        prefs: &AffinityPrefs,
    ) -> Result<Option<Job>, QueueError> {
        let params = self.params();
        check_host(&params.wnode_hosts, worker, "get jobs", self.name())?;
        let now = self.now_ms();
        self.write_tx(|tx, effects| self.get_job_tx(tx, effects, worker, prefs, &params, now))
    }

    /// Stores the result of `job_id` and fetches the worker's next job in the
    /// same transaction. A retry repeats both halves.
    pub fn put_result_get_job(
        &self,
        worker: &ClientIdent,
        job_id: JobId,
        ret_code: i32,
        output: &str,
        prefs: &AffinityPrefs,
    ) -> Result<Option<Job>, QueueError> {
        let params = self.params();
        check_host(&params.wnode_hosts, worker, "put results", self.name())?;
        if output.len() > params.max_output_size {
            return Err(QueueError::OutputTooLong {
                size: output.len(),
                max: params.max_output_size,
            });
        }
        let now = self.now_ms();
        self.write_tx(|tx, effects| {
            self.put_result_tx(tx, effects, job_id, ret_code, output, &params, now)?;
            self.get_job_tx(tx, effects, worker, prefs, &params, now)
        })
    }

    /// Unpins `node_id` from every affinity and returns its running jobs to
    /// the pending set.
    pub fn clear_worker(&self, node_id: &str) -> Result<usize, QueueError> {
        let now = self.now_ms();
        let cleared = self.write_tx(|tx, effects| {
            let ids = record::running_jobs_of_node(tx, node_id)?;
            for id in &ids {
                let mut job = fetch_existing(tx, *id)?;
                job.status = JobStatus::Pending;
                job.run_count = job.run_count.saturating_sub(1);
                job.run_deadline_ms = None;
                if let Some(run) = job.last_run_mut() {
                    run.close(JobStatus::Returned, now);
                    run.err_msg = format!("worker node '{node_id}' cleared");
                }
                record::flush(tx, &job)?;
                effects.push(Effect::Status {
                    id: *id,
                    from: JobStatus::Running,
                    to: JobStatus::Pending,
                });
            }
            effects.push(Effect::UnpinWorker(node_id.to_string()));
            effects.push(Effect::Wake { affinity_id: None });
            Ok(ids.len())
        })?;
        debug!(queue = %self.name(), node_id, cleared, "worker cleared");
        Ok(cleared)
    }

    pub(super) fn get_job_tx(
        &self,
        tx: &Transaction<'_>,
        effects: &mut Vec<Effect>,
        worker: &ClientIdent,
        prefs: &AffinityPrefs,
        params: &QueueParams,
        now: i64,
    ) -> Result<Option<Job>, QueueError> {
        let preferred: Vec<u32> = {
            let affinity = self.affinity.read();
            prefs
                .tokens
                .iter()
                .filter_map(|token| affinity.resolve(token))
                .collect()
        };
        if !worker.node_id.is_empty() {
            for affinity_id in &preferred {
                effects.push(Effect::PinWorker {
                    affinity_id: *affinity_id,
                    worker: worker.node_id.clone(),
                });
            }
        }

        let mut visited = IdSet::new();
        if !preferred.is_empty() {
            let mut candidates = IdSet::new();
            {
                let affinity = self.affinity.read();
                for affinity_id in &preferred {
                    if let Some(jobs) = affinity.jobs(*affinity_id) {
                        candidates.union_with(jobs);
                    }
                }
            }
            candidates.intersect_with(self.status.read().set(JobStatus::Pending));
            for id in candidates.iter() {
                visited.insert(id);
                if let Some(job) = self.dispatch_candidate(tx, effects, worker, params, now, id)? {
                    return Ok(Some(job));
                }
            }
        }

        if !prefs.tokens.is_empty() && !prefs.any_affinity {
            return Ok(None);
        }

        let mut next = self.status.read().set(JobStatus::Pending).first();
        while let Some(id) = next {
            if !visited.contains(id) {
                if let Some(job) = self.dispatch_candidate(tx, effects, worker, params, now, id)? {
                    return Ok(Some(job));
                }
            }
            next = self.status.read().set(JobStatus::Pending).next(id);
        }
        Ok(None)
    }

    /// Dispatches `id` if storage agrees it is pending and it has not
    /// outlived its retention. `None` means skip to the next candidate.
    fn dispatch_candidate(
        &self,
        tx: &Transaction<'_>,
        effects: &mut Vec<Effect>,
        worker: &ClientIdent,
        params: &QueueParams,
        now: i64,
        id: JobId,
    ) -> Result<Option<Job>, QueueError> {
        if self.is_queued_for_erase(id) {
            return Ok(None);
        }
        let Some(mut job) = record::fetch(tx, id)? else {
            effects.push(Effect::Resync { id, status: None });
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            effects.push(Effect::Resync {
                id,
                status: Some(job.status),
            });
            return Ok(None);
        }
        if job.expires_at_ms(params.timeout_s) <= now {
            debug!(queue = %self.name(), job_id = id, "pending job expired before dispatch");
            expire_pending_tx(tx, effects, &mut job, now)?;
            return Ok(None);
        }

        job.status = JobStatus::Running;
        job.append_run(JobRun::started(worker, now));
        job.run_count += 1;
        job.run_deadline_ms = run_timeout_ms(&job, params).map(|ms| now.saturating_add(ms));
        record::flush(tx, &job)?;

        effects.push(Effect::Status {
            id,
            from: JobStatus::Pending,
            to: JobStatus::Running,
        });
        effects.push(Effect::Deadline {
            id,
            at: job.run_deadline_ms,
        });
        if job.affinity_id != 0 && !worker.node_id.is_empty() {
            effects.push(Effect::PinWorker {
                affinity_id: job.affinity_id,
                worker: worker.node_id.clone(),
            });
        }
        Ok(Some(job))
    }
}
