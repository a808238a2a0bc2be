use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::*;

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub(crate) fn format_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidEnum {
            field: "timestamp".into(),
            value: raw.into(),
        })
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|_| DatabaseError::InvalidEnum {
        field: "uuid".into(),
        value: raw.into(),
    })
}

pub fn insert_task(conn: &Connection, task: &Task) -> Result<(), DatabaseError> {
    let body = serde_json::to_string(task)?;
    conn.execute(
        "INSERT INTO tasks (id, fingerprint, rule_id, rule_version, state, instant, body,
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            task.id.to_string(),
            task.fingerprint,
            task.rule_id,
            task.rule_version,
            task.state.as_str(),
            task.instant as i32,
            body,
            format_ts(&task.created_at),
            format_ts(&task.updated_at),
        ],
    )?;
    append_transitions(conn, task)?;
    Ok(())
}

/// Persist the current body and append any transitions not yet stored.
pub fn update_task(conn: &Connection, task: &Task) -> Result<(), DatabaseError> {
    let body = serde_json::to_string(task)?;
    let changed = conn.execute(
        "UPDATE tasks SET state = ?1, body = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            task.state.as_str(),
            body,
            format_ts(&task.updated_at),
            task.id.to_string(),
        ],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "Task".into(),
            id: task.id.to_string(),
        });
    }
    append_transitions(conn, task)?;
    Ok(())
}

fn append_transitions(conn: &Connection, task: &Task) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO task_transitions (task_id, seq, from_state, to_state, at, note)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (seq, t) in task.transitions.iter().enumerate() {
        stmt.execute(params![
            task.id.to_string(),
            seq as i64,
            t.from.map(|s| s.as_str()),
            t.to.as_str(),
            format_ts(&t.at),
            t.note,
        ])?;
    }
    Ok(())
}

pub fn get_task(conn: &Connection, id: &Uuid) -> Result<Option<Task>, DatabaseError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM tasks WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| serde_json::from_str(&b).map_err(DatabaseError::from))
        .transpose()
}

pub fn require_task(conn: &Connection, id: &Uuid) -> Result<Task, DatabaseError> {
    get_task(conn, id)?.ok_or_else(|| DatabaseError::NotFound {
        entity_type: "Task".into(),
        id: id.to_string(),
    })
}

/// Most recent Task with this fingerprint whose extraction result is final.
/// In-flight, failed and rejected Tasks are skipped.
pub fn find_reusable_task(conn: &Connection, fingerprint: &str) -> Result<Option<Task>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT state, body FROM tasks WHERE fingerprint = ?1 ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map(params![fingerprint], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    for row in rows {
        let (state, body) = row?;
        if TaskState::from_str(&state)?.has_final_result() {
            return Ok(Some(serde_json::from_str(&body)?));
        }
    }
    Ok(None)
}

pub fn list_tasks_by_state(conn: &Connection, state: TaskState) -> Result<Vec<Task>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT body FROM tasks WHERE state = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![state.as_str()], |row| row.get::<_, String>(0))?;
    let mut tasks = Vec::new();
    for body in rows {
        tasks.push(serde_json::from_str(&body?)?);
    }
    Ok(tasks)
}

/// Transition log as stored, in order.
pub fn get_transitions(conn: &Connection, task_id: &Uuid) -> Result<Vec<Transition>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT from_state, to_state, at, note FROM task_transitions
         WHERE task_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![task_id.to_string()], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (from, to, at, note) = row?;
        out.push(Transition {
            from: from.as_deref().map(TaskState::from_str).transpose()?,
            to: TaskState::from_str(&to)?,
            at: parse_ts(&at)?,
            note,
        });
    }
    Ok(out)
}
