#![forbid(unsafe_code)]

mod sql;

use crate::error::QueueError;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::Path;
use std::time::Duration;

pub(crate) const LAST_JOB_ID: &str = "last_job_id";
pub(crate) const LAST_AFFINITY_ID: &str = "last_affinity_id";
pub(crate) const LAST_GROUP_ID: &str = "last_group_id";

fn open_connection(path: &Path) -> Result<Connection, QueueError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
    Ok(conn)
}

/// Opens (creating if needed) the job block backing one queue slot.
pub(crate) fn open_block(path: &Path) -> Result<Connection, QueueError> {
    let conn = open_connection(path)?;
    conn.execute_batch(sql::BLOCK)?;
    Ok(conn)
}

pub(crate) fn open_admin(path: &Path) -> Result<Connection, QueueError> {
    let conn = open_connection(path)?;
    conn.execute_batch(sql::ADMIN)?;
    Ok(conn)
}

/// Drops every row of a block so the slot can host a fresh queue.
/// All or nothing: a failed statement rolls the whole batch back.
pub(crate) fn truncate_block(conn: &Connection) -> Result<(), QueueError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute_batch(sql::TRUNCATE_BLOCK)?;
    tx.commit()?;
    Ok(())
}

pub(crate) fn counter_tx(tx: &Transaction<'_>, name: &str) -> Result<i64, QueueError> {
    Ok(tx
        .query_row("SELECT value FROM meta WHERE key=?1", params![name], |row| {
            row.get(0)
        })
        .optional()?
        .unwrap_or(0))
}

/// Advances counter `name` by `count` and returns the first value of the
/// reserved range.
pub(crate) fn reserve_counter_tx(
    tx: &Transaction<'_>,
    name: &str,
    count: u32,
) -> Result<i64, QueueError> {
    let current = counter_tx(tx, name)?;
    let last = current + i64::from(count);
    if last > i64::from(u32::MAX) {
        return Err(QueueError::InvalidInput(format!("counter '{name}' exhausted")));
    }
    tx.execute(
        r#"
        INSERT INTO meta(key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value=excluded.value
        "#,
        params![name, last],
    )?;
    Ok(current + 1)
}

pub(crate) fn next_counter_tx(tx: &Transaction<'_>, name: &str) -> Result<u32, QueueError> {
    let next = reserve_counter_tx(tx, name, 1)?;
    u32::try_from(next).map_err(|_| QueueError::InvalidInput(format!("counter '{name}' exhausted")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_reserve_contiguous_ranges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut conn = open_block(&dir.path().join("block_000.db")).expect("open");
        let tx = conn.transaction().expect("tx");
        assert_eq!(reserve_counter_tx(&tx, LAST_JOB_ID, 5).expect("reserve"), 1);
        assert_eq!(next_counter_tx(&tx, LAST_JOB_ID).expect("next"), 6);
        assert_eq!(counter_tx(&tx, LAST_JOB_ID).expect("read"), 6);
        assert_eq!(counter_tx(&tx, LAST_GROUP_ID).expect("read"), 0);
        tx.commit().expect("commit");

        truncate_block(&conn).expect("truncate");
        let tx = conn.transaction().expect("tx");
        assert_eq!(next_counter_tx(&tx, LAST_JOB_ID).expect("next"), 1);
    }

    #[test]
    fn failed_truncate_rolls_back_and_leaves_connection_usable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut conn = open_block(&dir.path().join("block_000.db")).expect("open");
        let tx = conn.transaction().expect("tx");
        reserve_counter_tx(&tx, LAST_JOB_ID, 3).expect("reserve");
        tx.commit().expect("commit");
        conn.execute_batch(
            "CREATE TRIGGER keep_meta BEFORE DELETE ON meta BEGIN SELECT RAISE(ABORT, 'meta is pinned'); END;",
        )
        .expect("trigger");

        assert!(truncate_block(&conn).is_err());
        assert!(conn.is_autocommit());

        let tx = conn.transaction().expect("tx after failed truncate");
        assert_eq!(counter_tx(&tx, LAST_JOB_ID).expect("read"), 3);
        tx.commit().expect("commit");

        conn.execute_batch("DROP TRIGGER keep_meta;").expect("drop trigger");
        truncate_block(&conn).expect("truncate");
        let tx = conn.transaction().expect("tx");
        assert_eq!(counter_tx(&tx, LAST_JOB_ID).expect("read"), 0);
    }
}
