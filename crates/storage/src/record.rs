#![forbid(unsafe_code)]

//! Durable job records. Every function here runs inside a transaction owned
//! by the caller; index maintenance is the caller's job too.

use crate::error::QueueError;
use ns_core::JobStatus;
use ns_core::ids::JobId;
use rusqlite::{OptionalExtension, Row, Transaction, params};

/// Job may be dispatched without regard to submission order.
pub const MASK_OUT_OF_ORDER: u32 = 1;

/// Who is calling: a submitter, a worker node or a reader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientIdent {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

impl ClientIdent {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port: 0,
        }
    }
}

/// One execution attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRun {
    pub status: JobStatus,
    pub start_ms: i64,
    pub done_ms: Option<i64>,
    pub ret_code: Option<i32>,
    pub err_msg: String,
    pub node_id: String,
    pub client_ip: String,
    pub client_port: u16,
}

impl JobRun {
    pub(crate) fn started(worker: &ClientIdent, now_ms: i64) -> Self {
        Self {
            status: JobStatus::Running,
            start_ms: now_ms,
            done_ms: None,
            ret_code: None,
            err_msg: String::new(),
            node_id: worker.node_id.clone(),
            client_ip: worker.host.clone(),
            client_port: worker.port,
        }
    }

    pub(crate) fn close(&mut self, status: JobStatus, now_ms: i64) {
        self.status = status;
        self.done_ms = Some(now_ms);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub affinity_id: u32,
    pub affinity_token: Option<String>,
    pub input: String,
    pub output: String,
    pub progress_msg: String,
    pub submit_ms: i64,
    pub timeout_s: u64,
    pub run_timeout_s: u64,
    pub run_deadline_ms: Option<i64>,
    pub subm_addr: String,
    pub subm_port: u16,
    pub subm_timeout_s: u64,
    pub mask: u32,
    pub run_count: u32,
    pub read_count: u32,
    pub read_group: u32,
    pub runs: Vec<JobRun>,
    pub tags: Vec<(String, String)>,
}

impl Job {
    pub fn last_run(&self) -> Option<&JobRun> {
        self.runs.last()
    }

    pub(crate) fn last_run_mut(&mut self) -> Option<&mut JobRun> {
        self.runs.last_mut()
    }

    pub(crate) fn append_run(&mut self, run: JobRun) -> &mut JobRun {
        self.runs.push(run);
        let last = self.runs.len() - 1;
        &mut self.runs[last]
    }

    /// Absolute retention deadline; `queue_timeout_s` applies when the job
    /// carries no override.
    pub fn expires_at_ms(&self, queue_timeout_s: u64) -> i64 {
        let timeout_s = if self.timeout_s > 0 {
            self.timeout_s
        } else {
            queue_timeout_s
        };
        self.submit_ms
            .saturating_add(crate::clock::secs_to_ms(timeout_s))
    }

    pub(crate) fn wants_notification(&self, now_ms: i64) -> bool {
        self.subm_port != 0
            && !self.subm_addr.is_empty()
            && now_ms
                < self
                    .submit_ms
                    .saturating_add(crate::clock::secs_to_ms(self.subm_timeout_s))
    }
}

const JOB_COLUMNS: &str = r#"
    j.id, j.status, j.affinity_id, a.token, j.input, j.output, j.progress_msg, j.submit_ms,
    j.timeout_s, j.run_timeout_s, j.run_deadline_ms, j.subm_addr, j.subm_port,
    j.subm_timeout_s, j.mask, j.run_count, j.read_count, j.read_group
"#;

fn secs_to_sql(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn secs_from_sql(raw: i64) -> u64 {
    raw.max(0) as u64
}

fn status_from_row(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobStatus> {
    let code: i64 = row.get(idx)?;
    JobStatus::from_code(code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            format!("unknown job status code {code}").into(),
        )
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        status: status_from_row(row, 1)?,
        affinity_id: row.get(2)?,
        affinity_token: row.get(3)?,
        input: row.get(4)?,
        output: row.get(5)?,
        progress_msg: row.get(6)?,
        submit_ms: row.get(7)?,
        timeout_s: secs_from_sql(row.get(8)?),
        run_timeout_s: secs_from_sql(row.get(9)?),
        run_deadline_ms: row.get(10)?,
        subm_addr: row.get(11)?,
        subm_port: row.get(12)?,
        subm_timeout_s: secs_from_sql(row.get(13)?),
        mask: row.get(14)?,
        run_count: row.get(15)?,
        read_count: row.get(16)?,
        read_group: row.get(17)?,
        runs: Vec::new(),
        tags: Vec::new(),
    })
}

pub(crate) fn fetch(tx: &Transaction<'_>, id: JobId) -> Result<Option<Job>, QueueError> {
    let job = tx
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs j LEFT JOIN affinities a ON a.id = j.affinity_id WHERE j.id=?1"
            ),
            params![id],
            job_from_row,
        )
        .optional()?;
    let Some(mut job) = job else {
        return Ok(None);
    };

    let mut stmt = tx.prepare(
        r#"
        SELECT status, start_ms, done_ms, ret_code, err_msg, node_id, client_ip, client_port
        FROM job_runs WHERE job_id=?1 ORDER BY seq
        "#,
    )?;
    let runs = stmt.query_map(params![id], |row| {
        Ok(JobRun {
            status: status_from_row(row, 0)?,
            start_ms: row.get(1)?,
            done_ms: row.get(2)?,
            ret_code: row.get(3)?,
            err_msg: row.get(4)?,
            node_id: row.get(5)?,
            client_ip: row.get(6)?,
            client_port: row.get(7)?,
        })
    })?;
    for run in runs {
        job.runs.push(run?);
    }

    let mut stmt = tx.prepare("SELECT key, value FROM job_tags WHERE job_id=?1 ORDER BY key")?;
    let tags = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    for tag in tags {
        job.tags.push(tag?);
    }
    Ok(Some(job))
}

/// Upserts the job row and rewrites its run history. Tags are written once,
/// by [`insert_tags`].
pub(crate) fn flush(tx: &Transaction<'_>, job: &Job) -> Result<(), QueueError> {
    tx.execute(
        r#"
        INSERT INTO jobs(
          id, status, affinity_id, input, output, progress_msg, submit_ms, timeout_s,
          run_timeout_s, run_deadline_ms, subm_addr, subm_port, subm_timeout_s, mask,
          run_count, read_count, read_group
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT(id) DO UPDATE SET
          status=excluded.status,
          affinity_id=excluded.affinity_id,
          output=excluded.output,
          progress_msg=excluded.progress_msg,
          run_deadline_ms=excluded.run_deadline_ms,
          run_count=excluded.run_count,
          read_count=excluded.read_count,
          read_group=excluded.read_group
        "#,
        params![
            job.id,
            job.status.code(),
            job.affinity_id,
            job.input,
            job.output,
            job.progress_msg,
            job.submit_ms,
            secs_to_sql(job.timeout_s),
            secs_to_sql(job.run_timeout_s),
            job.run_deadline_ms,
            job.subm_addr,
            job.subm_port,
            secs_to_sql(job.subm_timeout_s),
            job.mask,
            job.run_count,
            job.read_count,
            job.read_group,
        ],
    )?;

    tx.execute("DELETE FROM job_runs WHERE job_id=?1", params![job.id])?;
    let mut stmt = tx.prepare_cached(
        r#"
        INSERT INTO job_runs(
          job_id, seq, status, start_ms, done_ms, ret_code, err_msg, node_id, client_ip,
          client_port
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )?;
    for (seq, run) in job.runs.iter().enumerate() {
        stmt.execute(params![
            job.id,
            seq as i64,
            run.status.code(),
            run.start_ms,
            run.done_ms,
            run.ret_code,
            run.err_msg,
            run.node_id,
            run.client_ip,
            run.client_port,
        ])?;
    }
    Ok(())
}

pub(crate) fn insert_tags(
    tx: &Transaction<'_>,
    id: JobId,
    tags: &[(String, String)],
) -> Result<(), QueueError> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR REPLACE INTO job_tags(job_id, key, value) VALUES (?1, ?2, ?3)",
    )?;
    for (key, value) in tags {
        stmt.execute(params![id, key, value])?;
    }
    Ok(())
}

/// Physically removes the job; runs and tags go with it.
pub(crate) fn delete(tx: &Transaction<'_>, id: JobId) -> Result<Option<u32>, QueueError> {
    let affinity_id: Option<u32> = tx
        .query_row(
            "SELECT affinity_id FROM jobs WHERE id=?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    if affinity_id.is_some() {
        tx.execute("DELETE FROM jobs WHERE id=?1", params![id])?;
    }
    Ok(affinity_id)
}

/// Resolves `token` to its affinity id, allocating one on first use.
/// Returns the id and whether it was created by this call.
pub(crate) fn resolve_affinity_tx(
    tx: &Transaction<'_>,
    token: &str,
) -> Result<(u32, bool), QueueError> {
    let existing: Option<u32> = tx
        .query_row(
            "SELECT id FROM affinities WHERE token=?1",
            params![token],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok((id, false));
    }
    let id = crate::schema::next_counter_tx(tx, crate::schema::LAST_AFFINITY_ID)?;
    tx.execute(
        "INSERT INTO affinities(id, token) VALUES (?1, ?2)",
        params![id, token],
    )?;
    Ok((id, true))
}

pub(crate) fn delete_affinity_tx(tx: &Transaction<'_>, id: u32) -> Result<(), QueueError> {
    tx.execute("DELETE FROM affinities WHERE id=?1", params![id])?;
    Ok(())
}

/// Ids of Running jobs whose current run belongs to `node_id`.
pub(crate) fn running_jobs_of_node(
    tx: &Transaction<'_>,
    node_id: &str,
) -> Result<Vec<JobId>, QueueError> {
    let mut stmt = tx.prepare(
        r#"
        SELECT j.id FROM jobs j
        JOIN job_runs r ON r.job_id = j.id
        WHERE j.status = ?1
          AND r.node_id = ?2
          AND r.seq = (SELECT MAX(seq) FROM job_runs WHERE job_id = j.id)
        ORDER BY j.id
        "#,
    )?;
    let rows = stmt.query_map(params![JobStatus::Running.code(), node_id], |row| row.get(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Compact per-job state used to rebuild in-memory indices on mount.
#[derive(Clone, Debug)]
pub(crate) struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    pub affinity_id: u32,
    pub run_deadline_ms: Option<i64>,
    pub read_group: u32,
}

pub(crate) fn scan_summaries(tx: &Transaction<'_>) -> Result<Vec<JobSummary>, QueueError> {
    let mut stmt = tx.prepare(
        "SELECT id, status, affinity_id, run_deadline_ms, read_group FROM jobs ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(JobSummary {
            id: row.get(0)?,
            status: status_from_row(row, 1)?,
            affinity_id: row.get(2)?,
            run_deadline_ms: row.get(3)?,
            read_group: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn scan_tags(tx: &Transaction<'_>) -> Result<Vec<(JobId, String, String)>, QueueError> {
    let mut stmt = tx.prepare("SELECT job_id, key, value FROM job_tags ORDER BY job_id, key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn scan_affinities(tx: &Transaction<'_>) -> Result<Vec<(u32, String)>, QueueError> {
    let mut stmt = tx.prepare("SELECT id, token FROM affinities ORDER BY id")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Retention inputs for the purge scan.
pub(crate) fn fetch_expiry(
    tx: &Transaction<'_>,
    id: JobId,
) -> Result<Option<(i64, u64)>, QueueError> {
    Ok(tx
        .query_row(
            "SELECT submit_ms, timeout_s FROM jobs WHERE id=?1",
            params![id],
            |row| Ok((row.get(0)?, secs_from_sql(row.get(1)?))),
        )
        .optional()?)
}
