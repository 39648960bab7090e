#![forbid(unsafe_code)]

use super::{Effect, Queue, check_host};
use crate::error::QueueError;
use crate::record::{self, ClientIdent, Job};
use crate::schema::{self, LAST_JOB_ID};
use ns_core::ids::JobId;
use ns_core::{IdSet, JobStatus};
use rusqlite::Transaction;
use std::collections::BTreeMap;

/// Affinity of one entry of a batch submit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BatchAffinity {
    #[default]
    None,
    Token(String),
    /// Reuse whatever the previous entry of the batch resolved to.
    SameAsPrevious,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewJob {
    pub input: String,
    pub affinity: BatchAffinity,
    pub timeout_s: u64,
    pub run_timeout_s: u64,
    pub mask: u32,
    pub tags: Vec<(String, String)>,
    pub subm_addr: String,
    pub subm_port: u16,
    pub subm_timeout_s: u64,
}

impl NewJob {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }

    pub fn with_affinity(mut self, token: impl Into<String>) -> Self {
        self.affinity = BatchAffinity::Token(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout_s: u64) -> Self {
        self.run_timeout_s = run_timeout_s;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    /// Ask for a completion notification at `addr:port` for `timeout_s`.
    pub fn notify(mut self, addr: impl Into<String>, port: u16, timeout_s: u64) -> Self {
        self.subm_addr = addr.into();
        self.subm_port = port;
        self.subm_timeout_s = timeout_s;
        self
    }
}

impl Queue {
    pub fn submit(&self, client: &ClientIdent, job: NewJob) -> Result<JobId, QueueError> {
        self.submit_batch(client, vec![job])
    }

    /// Submits every job under one contiguous id range and one commit.
    /// Returns the first id.
    pub fn submit_batch(&self, client: &ClientIdent, jobs: Vec<NewJob>) -> Result<JobId, QueueError> {
        if jobs.is_empty() {
            return Err(QueueError::InvalidInput("empty batch".into()));
        }
        let params = self.params();
        check_host(&params.subm_hosts, client, "submit", self.name())?;
        for job in &jobs {
            if job.input.len() > params.max_input_size {
                return Err(QueueError::InputTooLong {
                    size: job.input.len(),
                    max: params.max_input_size,
                });
            }
            if let BatchAffinity::Token(token) = &job.affinity {
                if token.is_empty() {
                    return Err(QueueError::InvalidInput("empty affinity token".into()));
                }
            }
            if job.tags.iter().any(|(key, _)| key.is_empty()) {
                return Err(QueueError::InvalidInput("empty tag key".into()));
            }
        }
        let count = u32::try_from(jobs.len())
            .map_err(|_| QueueError::InvalidInput("batch too large".into()))?;

        let now = self.now_ms();
        self.write_tx(|tx, effects| submit_tx(tx, effects, &jobs, count, now))
    }
}

fn submit_tx(
    tx: &Transaction<'_>,
    effects: &mut Vec<Effect>,
    jobs: &[NewJob],
    count: u32,
    now: i64,
) -> Result<JobId, QueueError> {
    let first = JobId::try_from(schema::reserve_counter_tx(tx, LAST_JOB_ID, count)?)
        .map_err(|_| QueueError::InvalidInput("job id space exhausted".into()))?;

    let mut by_affinity: BTreeMap<u32, IdSet> = BTreeMap::new();
    let mut previous_affinity = 0u32;
    let mut first_affinity = None;
    for (offset, new_job) in (0u32..).zip(jobs) {
        let id = first + offset;
        let affinity_id = match &new_job.affinity {
            BatchAffinity::None => 0,
            BatchAffinity::SameAsPrevious => previous_affinity,
            BatchAffinity::Token(token) => {
                let (affinity_id, created) = record::resolve_affinity_tx(tx, token)?;
                if created {
                    effects.push(Effect::NewAffinity {
                        id: affinity_id,
                        token: token.clone(),
                    });
                }
                affinity_id
            }
        };
        previous_affinity = affinity_id;
        if offset == 0 && affinity_id != 0 {
            first_affinity = Some(affinity_id);
        }
        if affinity_id != 0 {
            by_affinity.entry(affinity_id).or_default().insert(id);
        }

        let job = Job {
            id,
            status: JobStatus::Pending,
            affinity_id,
            affinity_token: None,
            input: new_job.input.clone(),
            output: String::new(),
            progress_msg: String::new(),
            submit_ms: now,
            timeout_s: new_job.timeout_s,
            run_timeout_s: new_job.run_timeout_s,
            run_deadline_ms: None,
            subm_addr: new_job.subm_addr.clone(),
            subm_port: new_job.subm_port,
            subm_timeout_s: new_job.subm_timeout_s,
            mask: new_job.mask,
            run_count: 0,
            read_count: 0,
            read_group: 0,
            runs: Vec::new(),
            tags: Vec::new(),
        };
        record::flush(tx, &job)?;
        if !new_job.tags.is_empty() {
            record::insert_tags(tx, id, &new_job.tags)?;
            effects.push(Effect::Tags {
                id,
                tags: new_job.tags.clone(),
            });
        }
    }

    effects.push(Effect::Submitted {
        lo: first,
        hi: first + (count - 1),
    });
    for (affinity_id, jobs) in by_affinity {
        effects.push(Effect::AffinityJobs { affinity_id, jobs });
    }
    effects.push(Effect::Wake {
        affinity_id: first_affinity,
    });
    Ok(first)
}
