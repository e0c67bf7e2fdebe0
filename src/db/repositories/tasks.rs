use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::db::{
    helpers::{format_datetime, parse_optional_datetime, to_i64, to_u64},
    models::{NewTask, Task, TaskStatus},
    Database,
};

const TASK_COLUMNS: &str = "id, task_name, description, status, created_at, updated_at, completed_at, timespent, timeset, due";

fn row_to_task(row: &Row) -> Result<Task> {
    let status: String = row.get("status")?;
    let timespent: i64 = row.get("timespent")?;
    let timeset: i64 = row.get("timeset")?;

    Ok(Task {
        id: row.get("id")?,
        task_name: row.get("task_name")?,
        description: row.get("description")?,
        status: TaskStatus::parse(&status)?,
        created_at: parse_optional_datetime(row.get("created_at")?, "created_at")?,
        updated_at: parse_optional_datetime(row.get("updated_at")?, "updated_at")?,
        completed_at: parse_optional_datetime(row.get("completed_at")?, "completed_at")?,
        time_spent_ms: to_u64(timespent, "timespent")?,
        time_set_ms: to_u64(timeset, "timeset")?,
        due: parse_optional_datetime(row.get("due")?, "due")?,
    })
}

fn select_task(conn: &Connection, id: i64) -> Result<Option<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_task(row)?)),
        None => Ok(None),
    }
}

fn collect_tasks(conn: &Connection, sql: &str, status: Option<&str>) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = match status {
        Some(status) => stmt.query(params![status])?,
        None => stmt.query([])?,
    };
    let mut tasks = Vec::new();
    while let Some(row) = rows.next()? {
        tasks.push(row_to_task(row)?);
    }
    Ok(tasks)
}

impl Database {
    pub async fn insert_task(&self, input: NewTask) -> Result<Task> {
        self.execute(move |conn| {
            let now = format_datetime(&Utc::now());
            conn.execute(
                "INSERT INTO tasks (task_name, description, status, created_at, updated_at, completed_at, timespent, timeset, due)
                 VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, ?6, ?7)",
                params![
                    input.task_name,
                    input.description,
                    input.status.unwrap_or_default().as_str(),
                    now,
                    to_i64(input.time_spent_ms.unwrap_or(0))?,
                    to_i64(input.time_set_ms.unwrap_or(0))?,
                    input.due.as_ref().map(format_datetime),
                ],
            )?;
            let id = conn.last_insert_rowid();
            select_task(conn, id)?
                .ok_or_else(|| anyhow!("task {id} missing right after insert"))
        })
        .await
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        self.execute(move |conn| select_task(conn, id)).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.execute(|conn| {
            collect_tasks(
                conn,
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, id DESC"),
                None,
            )
        })
        .await
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.execute(move |conn| {
            collect_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at DESC, id DESC"
                ),
                Some(status.as_str()),
            )
        })
        .await
    }

    pub async fn count_tasks(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
            to_u64(count, "count")
        })
        .await
    }

    /// Moving to `Done` stamps `completed_at` once; any other status clears it.
    pub async fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<Option<Task>> {
        self.execute(move |conn| {
            let now = format_datetime(&Utc::now());
            let changed = conn.execute(
                "UPDATE tasks
                 SET status = ?1,
                     updated_at = ?2,
                     completed_at = CASE WHEN ?1 = 'done' THEN COALESCE(completed_at, ?2) ELSE NULL END
                 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            select_task(conn, id)
        })
        .await
    }

    pub async fn update_task(&self, task: &Task) -> Result<Option<Task>> {
        let record = task.clone();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks
                 SET task_name = ?1,
                     description = ?2,
                     status = ?3,
                     updated_at = ?4,
                     completed_at = ?5,
                     timespent = ?6,
                     timeset = ?7,
                     due = ?8
                 WHERE id = ?9",
                params![
                    record.task_name,
                    record.description,
                    record.status.as_str(),
                    format_datetime(&Utc::now()),
                    record.completed_at.as_ref().map(format_datetime),
                    to_i64(record.time_spent_ms)?,
                    to_i64(record.time_set_ms)?,
                    record.due.as_ref().map(format_datetime),
                    record.id,
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            select_task(conn, record.id)
        })
        .await
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool> {
        self.execute(move |conn| {
            let changed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    /// Returns false when the task no longer exists.
    pub async fn add_time_spent(&self, id: i64, focus_ms: u64) -> Result<bool> {
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET timespent = timespent + ?1, updated_at = ?2 WHERE id = ?3",
                params![to_i64(focus_ms)?, format_datetime(&Utc::now()), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{models::NewTask, test_support::open_temp, TaskStatus};

    #[tokio::test]
    async fn insert_defaults_to_todo() {
        let (_dir, db) = open_temp();

        let task = db
            .insert_task(NewTask {
                task_name: Some("write report".into()),
                ..NewTask::default()
            })
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.time_spent_ms, 0);
        assert!(task.created_at.is_some());
        assert_eq!(db.count_tasks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn done_stamps_completed_at_and_reopen_clears_it() {
        let (_dir, db) = open_temp();
        let task = db.insert_task(NewTask::default()).await.unwrap();

        let done = db
            .update_task_status(task.id, TaskStatus::Done)
            .await
            .unwrap()
            .unwrap();
        assert!(done.completed_at.is_some());

        let reopened = db
            .update_task_status(task.id, TaskStatus::InProgress)
            .await
            .unwrap()
            .unwrap();
        assert!(reopened.completed_at.is_none());

        assert!(db
            .update_task_status(9999, TaskStatus::Done)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn filters_by_status_and_deletes() {
        let (_dir, db) = open_temp();
        let a = db.insert_task(NewTask::default()).await.unwrap();
        db.insert_task(NewTask {
            status: Some(TaskStatus::Done),
            ..NewTask::default()
        })
        .await
        .unwrap();

        let todo = db.list_tasks_by_status(TaskStatus::Todo).await.unwrap();
        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0].id, a.id);
        assert_eq!(db.list_tasks().await.unwrap().len(), 2);

        assert!(db.delete_task(a.id).await.unwrap());
        assert!(!db.delete_task(a.id).await.unwrap());
        assert!(db.get_task(a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn time_spent_accumulates() {
        let (_dir, db) = open_temp();
        let task = db.insert_task(NewTask::default()).await.unwrap();

        assert!(db.add_time_spent(task.id, 1_500).await.unwrap());
        assert!(db.add_time_spent(task.id, 500).await.unwrap());
        assert!(!db.add_time_spent(task.id + 1, 500).await.unwrap());

        let task = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.time_spent_ms, 2_000);
    }
}
