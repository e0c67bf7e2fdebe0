use anyhow::Result;
use async_trait::async_trait;

use crate::storage::Storage;

use super::{Database, FocusSession, Interruption, NewInterruption, SessionStatus};

#[async_trait]
impl Storage for Database {
    async fn create_focus_session(
        &self,
        planned_ms: u64,
        task_id: Option<i64>,
    ) -> Result<FocusSession> {
        self.insert_focus_session(planned_ms, task_id).await
    }

    async fn update_focus_session(&self, session: &FocusSession) -> Result<Option<FocusSession>> {
        self.save_focus_session(session).await
    }

    async fn create_interruption(&self, input: NewInterruption) -> Result<Interruption> {
        self.insert_interruption(input).await
    }

    async fn active_focus_sessions(&self) -> Result<Vec<FocusSession>> {
        self.list_focus_sessions_by_status(SessionStatus::Active).await
    }

    async fn add_task_time_spent(&self, task_id: i64, focus_ms: u64) -> Result<bool> {
        self.add_time_spent(task_id, focus_ms).await
    }
}
