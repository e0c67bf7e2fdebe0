use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, ToSql};
use uuid::Uuid;

use crate::db::{
    helpers::{format_datetime, parse_datetime, parse_optional_datetime, parse_status, to_i64, to_u64},
    models::{FocusSession, SessionStatus},
    Database,
};

const SESSION_COLUMNS: &str =
    "id, task_id, started_at, ended_at, planned_ms, focus_ms, status, notes";

fn row_to_session(row: &Row) -> Result<FocusSession> {
    let started_at: String = row.get("started_at")?;
    let status: String = row.get("status")?;
    let planned_ms: i64 = row.get("planned_ms")?;
    let focus_ms: i64 = row.get("focus_ms")?;

    Ok(FocusSession {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_optional_datetime(row.get("ended_at")?, "ended_at")?,
        planned_ms: to_u64(planned_ms, "planned_ms")?,
        focus_ms: to_u64(focus_ms, "focus_ms")?,
        status: parse_status(&status)?,
        notes: row.get("notes")?,
    })
}

fn query_sessions(
    conn: &Connection,
    filter: &str,
    values: &[&dyn ToSql],
) -> Result<Vec<FocusSession>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM focus_sessions {filter} ORDER BY started_at DESC"
    ))?;
    let mut rows = stmt.query(values)?;
    let mut sessions = Vec::new();
    while let Some(row) = rows.next()? {
        sessions.push(row_to_session(row)?);
    }
    Ok(sessions)
}

impl Database {
    pub async fn insert_focus_session(
        &self,
        planned_ms: u64,
        task_id: Option<i64>,
    ) -> Result<FocusSession> {
        let session = FocusSession {
            id: Uuid::new_v4().to_string(),
            task_id,
            started_at: Utc::now(),
            ended_at: None,
            planned_ms,
            focus_ms: 0,
            status: SessionStatus::Active,
            notes: None,
        };
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO focus_sessions (id, task_id, started_at, ended_at, planned_ms, focus_ms, status, notes)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7)",
                params![
                    record.id,
                    record.task_id,
                    format_datetime(&record.started_at),
                    to_i64(record.planned_ms)?,
                    to_i64(record.focus_ms)?,
                    record.status.as_str(),
                    record.notes,
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(session)
    }

    /// Overwrites the mutable fields of a session. `None` means no such row.
    pub async fn save_focus_session(&self, session: &FocusSession) -> Result<Option<FocusSession>> {
        let record = session.clone();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE focus_sessions
                 SET task_id = ?1,
                     ended_at = ?2,
                     planned_ms = ?3,
                     focus_ms = ?4,
                     status = ?5,
                     notes = ?6
                 WHERE id = ?7",
                params![
                    record.task_id,
                    record.ended_at.as_ref().map(format_datetime),
                    to_i64(record.planned_ms)?,
                    to_i64(record.focus_ms)?,
                    record.status.as_str(),
                    record.notes,
                    record.id,
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_sessions(conn, "WHERE id = ?1", &[&record.id])
                .map(|mut found| found.pop())
        })
        .await
    }

    pub async fn get_focus_session(&self, id: &str) -> Result<Option<FocusSession>> {
        let id = id.to_string();
        self.execute(move |conn| {
            query_sessions(conn, "WHERE id = ?1", &[&id]).map(|mut found| found.pop())
        })
        .await
    }

    pub async fn list_focus_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<FocusSession>> {
        self.execute(move |conn| query_sessions(conn, "WHERE status = ?1", &[&status.as_str()]))
            .await
    }

    pub async fn list_focus_sessions_for_task(&self, task_id: i64) -> Result<Vec<FocusSession>> {
        self.execute(move |conn| query_sessions(conn, "WHERE task_id = ?1", &[&task_id]))
            .await
    }

    /// Sessions that started within `[from, to)`.
    pub async fn list_focus_sessions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FocusSession>> {
        if to < from {
            return Err(anyhow!("time range ends before it starts"));
        }
        let from = format_datetime(&from);
        let to = format_datetime(&to);
        self.execute(move |conn| {
            query_sessions(
                conn,
                "WHERE started_at >= ?1 AND started_at < ?2",
                &[&from, &to],
            )
        })
        .await
    }

    pub async fn delete_focus_session(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute("DELETE FROM focus_sessions WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }
}
