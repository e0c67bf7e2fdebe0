use anyhow::Result;
use async_trait::async_trait;

use crate::db::{FocusSession, Interruption, NewInterruption};

/// Persistence the timer core depends on.
///
/// The core only writes through this trait; read-side accessors used by the UI
/// live on the concrete store.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_focus_session(
        &self,
        planned_ms: u64,
        task_id: Option<i64>,
    ) -> Result<FocusSession>;

    /// `Ok(None)` means the session does not exist.
    async fn update_focus_session(&self, session: &FocusSession) -> Result<Option<FocusSession>>;

    async fn create_interruption(&self, input: NewInterruption) -> Result<Interruption>;

    /// Sessions still marked active, e.g. left behind by a crashed process.
    async fn active_focus_sessions(&self) -> Result<Vec<FocusSession>>;

    /// Adds finalized focus time to a task. `Ok(false)` means the task is gone.
    async fn add_task_time_spent(&self, task_id: i64, focus_ms: u64) -> Result<bool>;
}
