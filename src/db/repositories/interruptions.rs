use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, ToSql};
use uuid::Uuid;

use crate::db::{
    helpers::{format_datetime, parse_datetime, to_i64, to_u64},
    models::{Interruption, NewInterruption},
    Database,
};

fn row_to_interruption(row: &Row) -> Result<Interruption> {
    let occurred_at: String = row.get("occurred_at")?;
    let duration_ms: Option<i64> = row.get("duration_ms")?;

    Ok(Interruption {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        occurred_at: parse_datetime(&occurred_at, "occurred_at")?,
        duration_ms: duration_ms
            .map(|value| to_u64(value, "duration_ms"))
            .transpose()?,
        kind: row.get("type")?,
        note: row.get("note")?,
        screenshot_uri: row.get("screenshot_uri")?,
    })
}

fn query_interruptions(
    conn: &Connection,
    filter: &str,
    values: &[&dyn ToSql],
) -> Result<Vec<Interruption>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, session_id, occurred_at, duration_ms, type, note, screenshot_uri
         FROM interruptions {filter}
         ORDER BY occurred_at ASC"
    ))?;
    let mut rows = stmt.query(values)?;
    let mut interruptions = Vec::new();
    while let Some(row) = rows.next()? {
        interruptions.push(row_to_interruption(row)?);
    }
    Ok(interruptions)
}

impl Database {
    pub async fn insert_interruption(&self, input: NewInterruption) -> Result<Interruption> {
        let record = input.into_record(Uuid::new_v4().to_string());
        let stored = record.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO interruptions (id, session_id, occurred_at, duration_ms, type, note, screenshot_uri)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id,
                    record.session_id,
                    format_datetime(&record.occurred_at),
                    record.duration_ms.map(to_i64).transpose()?,
                    record.kind,
                    record.note,
                    record.screenshot_uri,
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(stored)
    }

    pub async fn list_interruptions_for_session(&self, session_id: &str) -> Result<Vec<Interruption>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| query_interruptions(conn, "WHERE session_id = ?1", &[&session_id]))
            .await
    }

    /// Interruptions that occurred within `[from, to)`.
    pub async fn list_interruptions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Interruption>> {
        let from = format_datetime(&from);
        let to = format_datetime(&to);
        self.execute(move |conn| {
            query_interruptions(
                conn,
                "WHERE occurred_at >= ?1 AND occurred_at < ?2",
                &[&from, &to],
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::db::{models::NewInterruption, test_support::open_temp};

    fn interruption_for(session_id: &str, minutes_ago: i64) -> NewInterruption {
        NewInterruption {
            session_id: session_id.to_string(),
            occurred_at: Utc::now() - Duration::minutes(minutes_ago),
            duration_ms: None,
            kind: Some("screenshot of user playing a video game".into()),
            note: Some("off-track ratio 0.40 over 5 samples".into()),
            screenshot_uri: None,
        }
    }

    #[tokio::test]
    async fn lists_by_session_in_occurrence_order() {
        let (_dir, db) = open_temp();
        let session = db.insert_focus_session(60_000, None).await.unwrap();
        let other = db.insert_focus_session(60_000, None).await.unwrap();

        let later = db.insert_interruption(interruption_for(&session.id, 1)).await.unwrap();
        let earlier = db.insert_interruption(interruption_for(&session.id, 5)).await.unwrap();
        db.insert_interruption(interruption_for(&other.id, 1)).await.unwrap();

        let found = db.list_interruptions_for_session(&session.id).await.unwrap();
        let ids: Vec<_> = found.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec![earlier.id.as_str(), later.id.as_str()]);
        assert_eq!(found[0].kind.as_deref(), Some("screenshot of user playing a video game"));
    }

    #[tokio::test]
    async fn range_query_and_cascade_delete() {
        let (_dir, db) = open_temp();
        let session = db.insert_focus_session(60_000, None).await.unwrap();
        db.insert_interruption(interruption_for(&session.id, 90)).await.unwrap();
        db.insert_interruption(interruption_for(&session.id, 2)).await.unwrap();

        let now = Utc::now();
        let recent = db
            .list_interruptions_between(now - Duration::minutes(10), now)
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);

        db.delete_focus_session(&session.id).await.unwrap();
        assert!(db
            .list_interruptions_for_session(&session.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let (_dir, db) = open_temp();

        assert!(db.insert_interruption(interruption_for("nope", 0)).await.is_err());
    }
}
