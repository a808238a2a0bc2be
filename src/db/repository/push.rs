use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::task::{format_ts, parse_ts, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

/// Append one attempt. Rows are never updated or deleted afterwards.
pub fn insert_push_attempt(conn: &Connection, attempt: &PushAttempt) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO push_attempts (id, task_id, target_id, attempt, success, status_code, error,
         duration_ms, request, response, retry_delay_secs, attempted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            attempt.id.to_string(),
            attempt.task_id.to_string(),
            attempt.target_id,
            attempt.attempt,
            attempt.success as i32,
            attempt.status_code,
            attempt.error,
            attempt.duration_ms as i64,
            serde_json::to_string(&attempt.request)?,
            attempt.response.as_ref().map(serde_json::to_string).transpose()?,
            attempt.retry_delay_secs.map(|d| d as i64),
            format_ts(&attempt.attempted_at),
        ],
    )?;
    Ok(())
}

struct AttemptRow {
    id: String,
    task_id: String,
    target_id: String,
    attempt: u32,
    success: i32,
    status_code: Option<u16>,
    error: Option<String>,
    duration_ms: i64,
    request: String,
    response: Option<String>,
    retry_delay_secs: Option<i64>,
    attempted_at: String,
}

const ATTEMPT_COLUMNS: &str = "id, task_id, target_id, attempt, success, status_code, error,
     duration_ms, request, response, retry_delay_secs, attempted_at";

fn read_attempt_row(row: &Row<'_>) -> rusqlite::Result<AttemptRow> {
    Ok(AttemptRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        target_id: row.get(2)?,
        attempt: row.get(3)?,
        success: row.get(4)?,
        status_code: row.get(5)?,
        error: row.get(6)?,
        duration_ms: row.get(7)?,
        request: row.get(8)?,
        response: row.get(9)?,
        retry_delay_secs: row.get(10)?,
        attempted_at: row.get(11)?,
    })
}

fn attempt_from_row(row: AttemptRow) -> Result<PushAttempt, DatabaseError> {
    Ok(PushAttempt {
        id: parse_uuid(&row.id)?,
        task_id: parse_uuid(&row.task_id)?,
        target_id: row.target_id,
        attempt: row.attempt,
        success: row.success != 0,
        status_code: row.status_code,
        error: row.error,
        duration_ms: row.duration_ms.max(0) as u64,
        request: serde_json::from_str(&row.request)?,
        response: row.response.as_deref().map(serde_json::from_str).transpose()?,
        retry_delay_secs: row.retry_delay_secs.map(|d| d.max(0) as u64),
        attempted_at: parse_ts(&row.attempted_at)?,
    })
}

/// Every attempt for a Task, grouped by target and ordered by attempt number.
pub fn list_push_attempts(conn: &Connection, task_id: &Uuid) -> Result<Vec<PushAttempt>, DatabaseError> {
    let sql = format!(
        "SELECT {ATTEMPT_COLUMNS} FROM push_attempts WHERE task_id = ?1
         ORDER BY target_id ASC, attempt ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![task_id.to_string()], read_attempt_row)?;
    rows.map(|r| attempt_from_row(r?)).collect()
}

pub fn list_target_attempts(
    conn: &Connection,
    task_id: &Uuid,
    target_id: &str,
) -> Result<Vec<PushAttempt>, DatabaseError> {
    let sql = format!(
        "SELECT {ATTEMPT_COLUMNS} FROM push_attempts WHERE task_id = ?1 AND target_id = ?2
         ORDER BY attempt ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![task_id.to_string(), target_id], read_attempt_row)?;
    rows.map(|r| attempt_from_row(r?)).collect()
}

/// Ordinal for the next attempt against this target (1 when none exist).
pub fn next_attempt_number(conn: &Connection, task_id: &Uuid, target_id: &str) -> Result<u32, DatabaseError> {
    let max: Option<u32> = conn.query_row(
        "SELECT MAX(attempt) FROM push_attempts WHERE task_id = ?1 AND target_id = ?2",
        params![task_id.to_string(), target_id],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

/// Insert or refresh the dead-letter entry for a (task, target) pair.
pub fn upsert_dead_letter(conn: &Connection, letter: &DeadLetter) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO dead_letters (id, task_id, target_id, attempts, last_error, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(task_id, target_id) DO UPDATE SET
            attempts = excluded.attempts,
            last_error = excluded.last_error",
        params![
            letter.id.to_string(),
            letter.task_id.to_string(),
            letter.target_id,
            letter.attempts,
            letter.last_error,
            format_ts(&letter.created_at),
        ],
    )?;
    Ok(())
}

fn read_dead_letter(row: &Row<'_>) -> rusqlite::Result<(String, String, String, u32, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn dead_letter_from_row(
    (id, task_id, target_id, attempts, last_error, created_at): (String, String, String, u32, String, String),
) -> Result<DeadLetter, DatabaseError> {
    Ok(DeadLetter {
        id: parse_uuid(&id)?,
        task_id: parse_uuid(&task_id)?,
        target_id,
        attempts,
        last_error,
        created_at: parse_ts(&created_at)?,
    })
}

pub fn list_dead_letters(conn: &Connection) -> Result<Vec<DeadLetter>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, task_id, target_id, attempts, last_error, created_at
         FROM dead_letters ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map([], read_dead_letter)?;
    rows.map(|r| dead_letter_from_row(r?)).collect()
}

pub fn get_dead_letter(conn: &Connection, id: &Uuid) -> Result<Option<DeadLetter>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, task_id, target_id, attempts, last_error, created_at
             FROM dead_letters WHERE id = ?1",
            params![id.to_string()],
            read_dead_letter,
        )
        .optional()?;
    row.map(dead_letter_from_row).transpose()
}

pub fn count_dead_letters_for_task(conn: &Connection, task_id: &Uuid) -> Result<u32, DatabaseError> {
    let n: u32 = conn.query_row(
        "SELECT COUNT(*) FROM dead_letters WHERE task_id = ?1",
        params![task_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(n)
}

pub fn delete_dead_letter(conn: &Connection, id: &Uuid) -> Result<(), DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM dead_letters WHERE id = ?1",
        params![id.to_string()],
    )?;
    if deleted == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "DeadLetter".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}
