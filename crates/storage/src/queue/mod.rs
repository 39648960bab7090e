#![forbid(unsafe_code)]

//! One named job queue over its own block.
//!
//! Every mutating operation runs a transaction body through [`with_retry`].
//! The body only reads the in-memory indices; what it wants changed there is
//! returned as a list of [`Effect`]s and applied after `commit()` while the
//! block connection is still locked, so cache updates land in commit order.

mod dispatch;
mod finish;
mod inspect;
mod purge;
mod read;
mod submit;

pub use dispatch::AffinityPrefs;
pub use finish::CancelOutcome;
pub use inspect::{JobDescription, QueueInfo};
pub use read::ReadBatch;
pub use submit::{BatchAffinity, NewJob};

use crate::clock::{Clock, secs_to_ms};
use crate::config::QueueParams;
use crate::error::QueueError;
use crate::index::{AffinityRegistry, ExecutionTimeline, StatusIndex, TagIndex};
use crate::listener::{FinishedJob, JobEventListener};
use crate::record::{self, ClientIdent, Job};
use crate::retry::{RetryPolicy, with_retry};
use crate::schema;
use ns_core::ids::JobId;
use ns_core::{IdSet, JobStatus, Transition, classify_transition};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Static,
    Dynamic,
}

impl QueueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Static => "static",
            QueueKind::Dynamic => "dynamic",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "static" => Some(QueueKind::Static),
            "dynamic" => Some(QueueKind::Dynamic),
            _ => None,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub kind: QueueKind,
    pub class: Option<String>,
    pub comment: String,
    pub position: usize,
}

/// Registry-wide knobs a queue needs at run time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Tuning {
    pub retry: RetryPolicy,
    pub affinity_grace_ms: i64,
}

/// Cache mutation staged by a transaction body.
#[derive(Clone, Debug)]
pub(crate) enum Effect {
    Submitted { lo: JobId, hi: JobId },
    Status { id: JobId, from: JobStatus, to: JobStatus },
    /// Storage disagreed with the index; storage wins.
    Resync { id: JobId, status: Option<JobStatus> },
    Erase { id: JobId, affinity_id: u32 },
    QueueErase(JobId),
    NewAffinity { id: u32, token: String },
    AffinityJobs { affinity_id: u32, jobs: IdSet },
    PinWorker { affinity_id: u32, worker: String },
    UnpinWorker(String),
    RetireAffinity(u32),
    Deadline { id: JobId, at: Option<i64> },
    Tags { id: JobId, tags: Vec<(String, String)> },
    JoinReadGroup { group: u32, id: JobId },
    /// Raise a pending signal if the queue had no pending work before.
    Wake { affinity_id: Option<u32> },
    Finished(FinishedJob),
}

enum Signal {
    Pending(Option<u32>),
    Finished(FinishedJob),
}

pub struct Queue {
    descr: QueueDescriptor,
    conn: Mutex<Connection>,
    alive: AtomicBool,
    params: RwLock<QueueParams>,
    tuning: RwLock<Tuning>,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn JobEventListener>,
    status: RwLock<StatusIndex>,
    affinity: RwLock<AffinityRegistry>,
    timeline: RwLock<ExecutionTimeline>,
    tags: RwLock<TagIndex>,
    read_groups: RwLock<BTreeMap<u32, IdSet>>,
    erase_queue: Mutex<IdSet>,
    expiry_cursor: Mutex<[JobId; 8]>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("descr", &self.descr)
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Queue {
    pub(crate) fn mount(
        descr: QueueDescriptor,
        conn: Connection,
        params: QueueParams,
        tuning: Tuning,
        clock: Arc<dyn Clock>,
        listener: Arc<dyn JobEventListener>,
    ) -> Result<Self, QueueError> {
        let queue = Self {
            descr,
            conn: Mutex::new(conn),
            alive: AtomicBool::new(true),
            params: RwLock::new(params),
            tuning: RwLock::new(tuning),
            clock,
            listener,
            status: RwLock::new(StatusIndex::new()),
            affinity: RwLock::new(AffinityRegistry::new()),
            timeline: RwLock::new(ExecutionTimeline::new()),
            tags: RwLock::new(TagIndex::new()),
            read_groups: RwLock::new(BTreeMap::new()),
            erase_queue: Mutex::new(IdSet::new()),
            expiry_cursor: Mutex::new([0; 8]),
        };
        queue.rebuild_indices()?;
        Ok(queue)
    }

    /// Reconstructs every cache from the block.
    fn rebuild_indices(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let summaries = record::scan_summaries(&tx)?;
        let tag_rows = record::scan_tags(&tx)?;
        let affinity_rows = record::scan_affinities(&tx)?;
        drop(tx);

        let now = self.clock.now_ms();
        let mut status = StatusIndex::new();
        let mut affinity = AffinityRegistry::new();
        let mut timeline = ExecutionTimeline::new();
        let mut tags = TagIndex::new();
        let mut groups: BTreeMap<u32, IdSet> = BTreeMap::new();
        let mut by_affinity: BTreeMap<u32, IdSet> = BTreeMap::new();

        for (id, token) in &affinity_rows {
            affinity.register(*id, token, now);
        }
        for summary in &summaries {
            status.force(summary.id, summary.status);
            if summary.affinity_id != 0 {
                by_affinity
                    .entry(summary.affinity_id)
                    .or_default()
                    .insert(summary.id);
            }
            if summary.status.is_active() {
                if let Some(at) = summary.run_deadline_ms {
                    timeline.insert(summary.id, at);
                }
            }
            if summary.status == JobStatus::Reading && summary.read_group != 0 {
                groups
                    .entry(summary.read_group)
                    .or_default()
                    .insert(summary.id);
            }
        }
        for (affinity_id, jobs) in &by_affinity {
            affinity.add_jobs(*affinity_id, jobs, now);
        }
        for (id, key, value) in tag_rows {
            tags.insert(id, &[(key, value)]);
        }
        status.optimize();

        info!(
            queue = %self.descr.name,
            position = self.descr.position,
            jobs = summaries.len(),
            affinities = affinity.len(),
            active = timeline.len(),
            "queue mounted"
        );

        *self.status.write() = status;
        *self.affinity.write() = affinity;
        *self.timeline.write() = timeline;
        *self.tags.write() = tags;
        *self.read_groups.write() = groups;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.descr.name
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descr
    }

    pub fn params(&self) -> QueueParams {
        self.params.read().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn set_params(&self, params: QueueParams) {
        *self.params.write() = params;
    }

    pub(crate) fn set_tuning(&self, tuning: Tuning) {
        *self.tuning.write() = tuning;
    }

    /// Empties the block and marks the queue gone so the slot can be reused.
    /// On error the queue stays alive and untouched.
    pub(crate) fn retire(&self) -> Result<(), QueueError> {
        let conn = self.conn.lock();
        self.ensure_alive()?;
        schema::truncate_block(&conn)?;
        self.alive.store(false, Ordering::Release);
        *self.status.write() = StatusIndex::new();
        *self.affinity.write() = AffinityRegistry::new();
        *self.timeline.write() = ExecutionTimeline::new();
        *self.tags.write() = TagIndex::new();
        self.read_groups.write().clear();
        self.erase_queue.lock().clear();
        info!(queue = %self.descr.name, position = self.descr.position, "queue unmounted");
        Ok(())
    }

    fn ensure_alive(&self) -> Result<(), QueueError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(QueueError::UnknownQueue(self.descr.name.clone()))
        }
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Runs `body` in an immediate transaction, retrying transient failures,
    /// then applies the staged effects of the successful attempt.
    pub(crate) fn write_tx<T>(
        &self,
        mut body: impl FnMut(&Transaction<'_>, &mut Vec<Effect>) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let retry = self.tuning.read().retry;
        let mut conn = self.conn.lock();
        self.ensure_alive()?;
        let (value, effects) = with_retry(&retry, || {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut effects = Vec::new();
            let value = body(&tx, &mut effects)?;
            tx.commit()?;
            Ok((value, effects))
        })?;
        let signals = self.apply(effects);
        drop(conn);
        self.emit(signals);
        Ok(value)
    }

    /// Read-only counterpart of [`Queue::write_tx`].
    pub(crate) fn read_tx<T>(
        &self,
        mut body: impl FnMut(&Transaction<'_>) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let retry = self.tuning.read().retry;
        let mut conn = self.conn.lock();
        self.ensure_alive()?;
        with_retry(&retry, || {
            let tx = conn.transaction()?;
            body(&tx)
        })
    }

    fn apply(&self, effects: Vec<Effect>) -> Vec<Signal> {
        let now = self.now_ms();
        let log_state = self.params.read().log_job_state;
        let queue = self.descr.name.as_str();
        let mut status = self.status.write();
        let mut affinity = self.affinity.write();
        let mut timeline = self.timeline.write();
        let mut tags = self.tags.write();
        let mut groups = self.read_groups.write();

        let mut pending_was_empty = status.is_empty(JobStatus::Pending);
        let mut signals = Vec::new();
        for effect in effects {
            match effect {
                Effect::Submitted { lo, hi } => {
                    status.add_range(lo, hi, JobStatus::Pending);
                    if log_state {
                        info!(queue, first_job_id = lo, last_job_id = hi, "jobs submitted");
                    }
                }
                Effect::Status { id, from, to } => {
                    if let Err(observed) = status.change(id, from, to) {
                        warn!(
                            queue,
                            job_id = id,
                            expected = %from,
                            observed = ?observed,
                            status = %to,
                            "status index out of sync with storage"
                        );
                        status.force(id, to);
                    }
                    if !to.is_active() {
                        timeline.remove(id);
                    }
                    if from == JobStatus::Reading && to != JobStatus::Reading {
                        leave_read_groups(&mut groups, id);
                    }
                    if log_state {
                        info!(queue, job_id = id, from = %from, status = %to, "job status changed");
                    }
                }
                Effect::Resync { id, status: stored } => {
                    warn!(queue, job_id = id, stored = ?stored, "resyncing status index from storage");
                    match stored {
                        Some(stored) => status.force(id, stored),
                        None => {
                            status.erase(id);
                            timeline.remove(id);
                            tags.remove(id);
                            leave_read_groups(&mut groups, id);
                        }
                    }
                }
                Effect::Erase { id, affinity_id } => {
                    status.erase(id);
                    timeline.remove(id);
                    tags.remove(id);
                    leave_read_groups(&mut groups, id);
                    if affinity_id != 0 {
                        affinity.remove_job(affinity_id, id, now);
                    }
                    self.erase_queue.lock().remove(id);
                    if log_state {
                        info!(queue, job_id = id, "job erased");
                    }
                }
                Effect::QueueErase(id) => {
                    self.erase_queue.lock().insert(id);
                }
                Effect::NewAffinity { id, token } => affinity.register(id, &token, now),
                Effect::AffinityJobs { affinity_id, jobs } => {
                    affinity.add_jobs(affinity_id, &jobs, now)
                }
                Effect::PinWorker {
                    affinity_id,
                    worker,
                } => affinity.pin_worker(affinity_id, &worker, now),
                Effect::UnpinWorker(worker) => {
                    affinity.unpin_worker(&worker);
                }
                Effect::RetireAffinity(id) => affinity.retire(id),
                Effect::Deadline { id, at } => match at {
                    Some(at) => timeline.insert(id, at),
                    None => {
                        timeline.remove(id);
                    }
                },
                Effect::Tags { id, tags: job_tags } => tags.insert(id, &job_tags),
                Effect::JoinReadGroup { group, id } => {
                    groups.entry(group).or_default().insert(id);
                }
                Effect::Wake { affinity_id } => {
                    if pending_was_empty && !status.is_empty(JobStatus::Pending) {
                        signals.push(Signal::Pending(affinity_id));
                        pending_was_empty = false;
                    }
                }
                Effect::Finished(job) => signals.push(Signal::Finished(job)),
            }
        }
        signals
    }

    fn emit(&self, signals: Vec<Signal>) {
        for signal in signals {
            match signal {
                Signal::Pending(affinity_id) => {
                    self.listener.on_pending(&self.descr.name, affinity_id)
                }
                Signal::Finished(job) => self.listener.on_job_finished(&self.descr.name, &job),
            }
        }
    }

    fn is_queued_for_erase(&self, id: JobId) -> bool {
        self.erase_queue.lock().contains(id)
    }
}

fn leave_read_groups(groups: &mut BTreeMap<u32, IdSet>, id: JobId) {
    groups.retain(|_, members| {
        members.remove(id);
        !members.is_empty()
    });
}

/// Empty list means everyone is allowed.
pub(crate) fn check_host(
    allowed: &[String],
    client: &ClientIdent,
    action: &str,
    queue: &str,
) -> Result<(), QueueError> {
    if allowed.is_empty() || allowed.iter().any(|host| host == &client.host) {
        return Ok(());
    }
    warn!(queue, host = %client.host, action, "access denied");
    Err(QueueError::AccessDenied(format!(
        "host '{}' may not {action} on queue '{queue}'",
        client.host
    )))
}

/// Checks that `job` sits in `expected` before moving it to `to`.
///
/// `Ok(false)` means the job already completed exactly this transition and
/// the request is a harmless re-delivery.
pub(crate) fn guard_transition(
    job: &Job,
    expected: JobStatus,
    to: JobStatus,
    op: &'static str,
) -> Result<bool, QueueError> {
    if job.status == expected && classify_transition(expected, to) == Transition::Legal {
        return Ok(true);
    }
    match classify_transition(job.status, to) {
        Transition::Duplicate => Ok(false),
        _ => {
            warn!(job_id = job.id, status = %job.status, to = %to, op, "illegal transition rejected");
            Err(QueueError::invalid_status(job.id, job.status, op))
        }
    }
}

pub(crate) fn fetch_existing(tx: &Transaction<'_>, id: JobId) -> Result<Job, QueueError> {
    record::fetch(tx, id)?.ok_or(QueueError::JobNotFound(id))
}

/// Effective dispatch-to-completion budget in ms, if any.
pub(crate) fn run_timeout_ms(job: &Job, params: &QueueParams) -> Option<i64> {
    let secs = if job.run_timeout_s > 0 {
        job.run_timeout_s
    } else {
        params.run_timeout_s
    };
    (secs > 0).then(|| secs_to_ms(secs))
}

pub(crate) fn finished_effect(job: &Job, now_ms: i64) -> Option<Effect> {
    job.wants_notification(now_ms).then(|| {
        Effect::Finished(FinishedJob {
            job_id: job.id,
            status: job.status,
            subm_addr: job.subm_addr.clone(),
            subm_port: job.subm_port,
        })
    })
}
