#![forbid(unsafe_code)]

use super::{Queue, QueueDescriptor, fetch_existing};
use crate::config::QueueParams;
use crate::error::QueueError;
use crate::index::{StatusIndex, TagIndex};
use crate::record::{self, Job};
use ns_core::ids::JobId;
use ns_core::query::{self, QuerySource};
use ns_core::{IdSet, JobStatus};
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const DESCR_RETRIES: u32 = 5;
const DESCR_BACKOFF_MS: u64 = 10;

/// A job as printed by administrative dumps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobDescription {
    pub queue: String,
    pub job: Job,
}

fn format_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

impl fmt::Display for JobDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let job = &self.job;
        writeln!(f, "{}/{}: {}", self.queue, job.id, job.status)?;
        if let Some(token) = &job.affinity_token {
            writeln!(f, "  affinity: {token} ({})", job.affinity_id)?;
        }
        writeln!(f, "  submitted: {}", format_ms(job.submit_ms))?;
        writeln!(
            f,
            "  timeout: {}s run_timeout: {}s mask: {:#x}",
            job.timeout_s, job.run_timeout_s, job.mask
        )?;
        if let Some(at) = job.run_deadline_ms {
            writeln!(f, "  run deadline: {}", format_ms(at))?;
        }
        writeln!(f, "  input: {:?}", job.input)?;
        writeln!(f, "  output: {:?}", job.output)?;
        if !job.progress_msg.is_empty() {
            writeln!(f, "  progress: {:?}", job.progress_msg)?;
        }
        writeln!(
            f,
            "  run_count: {} read_count: {} read_group: {}",
            job.run_count, job.read_count, job.read_group
        )?;
        for (key, value) in &job.tags {
            writeln!(f, "  tag {key}={value}")?;
        }
        for (seq, run) in job.runs.iter().enumerate() {
            write!(
                f,
                "  run #{}: {} start={}",
                seq + 1,
                run.status,
                format_ms(run.start_ms)
            )?;
            if let Some(done) = run.done_ms {
                write!(f, " done={}", format_ms(done))?;
            }
            if let Some(ret_code) = run.ret_code {
                write!(f, " ret={ret_code}")?;
            }
            if !run.node_id.is_empty() {
                write!(f, " node={} client={}:{}", run.node_id, run.client_ip, run.client_port)?;
            }
            if !run.err_msg.is_empty() {
                write!(f, " err={:?}", run.err_msg)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueInfo {
    pub descr: QueueDescriptor,
    pub params: QueueParams,
    pub counts: Vec<(JobStatus, u64)>,
    pub affinities: usize,
    pub active_deadlines: usize,
    pub read_groups: usize,
    pub erase_backlog: u64,
    pub index_bytes: usize,
}

impl fmt::Display for QueueInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}", self.descr.name, self.descr.kind)?;
        if let Some(class) = &self.descr.class {
            write!(f, ", class {class}")?;
        }
        writeln!(f, ", slot {}]", self.descr.position)?;
        if !self.descr.comment.is_empty() {
            writeln!(f, "  comment: {}", self.descr.comment)?;
        }
        for (status, count) in &self.counts {
            writeln!(f, "  {status}: {count}")?;
        }
        writeln!(
            f,
            "  affinities: {} deadlines: {} read groups: {} erase backlog: {} index bytes: {}",
            self.affinities,
            self.active_deadlines,
            self.read_groups,
            self.erase_backlog,
            self.index_bytes
        )
    }
}

struct IndexView<'a> {
    status: &'a StatusIndex,
    tags: &'a TagIndex,
}

impl QuerySource for IndexView<'_> {
    fn all_jobs(&self) -> IdSet {
        self.status.all_jobs()
    }

    fn jobs_in_status(&self, status: JobStatus) -> IdSet {
        self.status.set(status).clone()
    }

    fn jobs_with_tag(&self, key: &str, value: &str) -> IdSet {
        self.tags.jobs_with(key, value)
    }
}

impl Queue {
    /// Point lookup. With `expected`, a status mismatch is retried a few
    /// times with backoff before the current record is returned, which
    /// covers reads racing a worker's write.
    pub fn get_job_descr(
        &self,
        job_id: JobId,
        expected: Option<JobStatus>,
    ) -> Result<Job, QueueError> {
        let mut delay_ms = DESCR_BACKOFF_MS;
        let mut attempt = 0;
        loop {
            let job = self.read_tx(|tx| fetch_existing(tx, job_id))?;
            match expected {
                Some(status) if job.status != status && attempt < DESCR_RETRIES => {
                    std::thread::sleep(Duration::from_millis(delay_ms));
                    delay_ms *= 2;
                    attempt += 1;
                }
                _ => return Ok(job),
            }
        }
    }

    pub fn count_status(&self, status: JobStatus) -> u64 {
        self.status.read().count(status)
    }

    pub fn status_statistics(&self) -> Vec<(JobStatus, u64)> {
        let index = self.status.read();
        JobStatus::INDEXED
            .iter()
            .map(|status| (*status, index.count(*status)))
            .collect()
    }

    /// Ids currently indexed under `status`.
    pub fn jobs_in_status(&self, status: JobStatus) -> IdSet {
        self.status.read().set(status).clone()
    }

    /// Full records, optionally restricted to one status, in id order.
    pub fn dump(&self, filter: Option<JobStatus>) -> Result<Vec<JobDescription>, QueueError> {
        let ids = {
            let index = self.status.read();
            match filter {
                Some(status) => index.set(status).clone(),
                None => index.all_jobs(),
            }
        };
        let jobs = self.read_tx(|tx| {
            let mut jobs = Vec::new();
            for id in ids.iter() {
                if let Some(job) = record::fetch(tx, id)? {
                    jobs.push(job);
                }
            }
            Ok(jobs)
        })?;
        Ok(jobs
            .into_iter()
            .map(|job| JobDescription {
                queue: self.name().to_string(),
                job,
            })
            .collect())
    }

    /// Evaluates a structured query such as
    /// `status = Pending and not color = red` against the indices.
    pub fn query(&self, text: &str) -> Result<IdSet, QueueError> {
        self.ensure_alive()?;
        let expr = query::parse(text)?;
        let status = self.status.read();
        let tags = self.tags.read();
        Ok(expr.evaluate(&IndexView {
            status: &status,
            tags: &tags,
        }))
    }

    pub fn queue_info(&self) -> QueueInfo {
        let (counts, index_bytes) = {
            let index = self.status.read();
            let counts = JobStatus::INDEXED
                .iter()
                .map(|status| (*status, index.count(*status)))
                .collect();
            (counts, index.memory_bytes())
        };
        let (affinities, affinity_bytes) = {
            let affinity = self.affinity.read();
            (affinity.len(), affinity.memory_bytes())
        };
        QueueInfo {
            descr: self.descr.clone(),
            params: self.params(),
            counts,
            affinities,
            active_deadlines: self.timeline.read().len(),
            read_groups: self.read_groups.read().len(),
            erase_backlog: self.erase_backlog(),
            index_bytes: index_bytes + affinity_bytes,
        }
    }

    /// Run deadline currently tracked for `job_id`.
    pub fn run_deadline(&self, job_id: JobId) -> Option<i64> {
        self.timeline.read().deadline(job_id)
    }

    pub fn affinity_id(&self, token: &str) -> Option<u32> {
        self.affinity.read().resolve(token)
    }

    /// Workers currently pinned to the affinity `token`.
    pub fn affinity_workers(&self, token: &str) -> Vec<String> {
        let affinity = self.affinity.read();
        affinity
            .resolve(token)
            .map(|id| affinity.workers(id).into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }
}
