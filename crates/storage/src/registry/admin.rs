#![forbid(unsafe_code)]

//! Rows of `admin.db`: which queue lives in which block.

use crate::config::QueueParams;
use crate::error::QueueError;
use crate::queue::{QueueDescriptor, QueueKind};
use rusqlite::{Connection, params};

#[derive(Clone, Debug)]
pub(crate) struct AdminRow {
    pub descr: QueueDescriptor,
    pub params: QueueParams,
}

pub(crate) fn load(conn: &Connection) -> Result<Vec<AdminRow>, QueueError> {
    let mut stmt = conn.prepare(
        "SELECT name, kind, position, class, comment, params_json FROM queues ORDER BY position",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (name, kind, position, class, comment, params_json) = row?;
        let kind = QueueKind::parse(&kind)
            .ok_or_else(|| QueueError::Config(format!("queue '{name}' has unknown kind '{kind}'")))?;
        let position = usize::try_from(position)
            .map_err(|_| QueueError::Config(format!("queue '{name}' has bad position {position}")))?;
        let params: QueueParams = serde_json::from_str(&params_json)?;
        out.push(AdminRow {
            descr: QueueDescriptor {
                name,
                kind,
                class,
                comment,
                position,
            },
            params,
        });
    }
    Ok(out)
}

pub(crate) fn insert(conn: &Connection, row: &AdminRow, now_ms: i64) -> Result<(), QueueError> {
    let params_json = serde_json::to_string(&row.params)?;
    let position = i64::try_from(row.descr.position)
        .map_err(|_| QueueError::Config("queue position out of range".into()))?;
    conn.execute(
        r#"
        INSERT INTO queues(name, kind, position, class, comment, params_json, created_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            row.descr.name,
            row.descr.kind.as_str(),
            position,
            row.descr.class,
            row.descr.comment,
            params_json,
            now_ms,
        ],
    )?;
    Ok(())
}

pub(crate) fn update_params(
    conn: &Connection,
    name: &str,
    params: &QueueParams,
) -> Result<(), QueueError> {
    let params_json = serde_json::to_string(params)?;
    conn.execute(
        "UPDATE queues SET params_json=?2 WHERE name=?1",
        params![name, params_json],
    )?;
    Ok(())
}

pub(crate) fn delete(conn: &Connection, name: &str) -> Result<(), QueueError> {
    conn.execute("DELETE FROM queues WHERE name=?1", params![name])?;
    Ok(())
}
