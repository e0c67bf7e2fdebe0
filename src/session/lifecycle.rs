use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    db::{FocusSession, Interruption, NewInterruption, SessionStatus},
    storage::Storage,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create focus session: {0:#}")]
    SessionCreateFailed(anyhow::Error),
    #[error("a focus session is already active")]
    SessionAlreadyActive,
}

/// Owns the single open focus session and every write made against it.
///
/// Opening is strict: a storage failure is returned to the caller. Everything
/// after that (progress, finalize, interruptions) is best-effort and only logs
/// failures, so local timer state never waits on persistence.
#[derive(Clone)]
pub struct SessionLifecycle {
    storage: Arc<dyn Storage>,
    active: Arc<Mutex<Option<FocusSession>>>,
}

impl SessionLifecycle {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn active_session(&self) -> Option<FocusSession> {
        self.active.lock().await.clone()
    }

    pub async fn active_session_id(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|session| session.id.clone())
    }

    pub async fn open(
        &self,
        planned_ms: u64,
        task_id: Option<i64>,
    ) -> Result<FocusSession, SessionError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(SessionError::SessionAlreadyActive);
        }

        let session = self
            .storage
            .create_focus_session(planned_ms, task_id)
            .await
            .map_err(SessionError::SessionCreateFailed)?;

        info!(
            "Opened focus session {} (planned {}ms, task {:?})",
            session.id, planned_ms, task_id
        );
        *active = Some(session.clone());
        Ok(session)
    }

    /// Closes the active session. Returns the finalized record, or `None` when
    /// nothing was open.
    pub async fn finalize(
        &self,
        status: SessionStatus,
        focus_ms: u64,
        ended_at: DateTime<Utc>,
    ) -> Option<FocusSession> {
        let mut session = self.active.lock().await.take()?;

        session.status = status;
        session.focus_ms = focus_ms;
        if session.ended_at.is_none() {
            session.ended_at = Some(ended_at);
        }

        match self.storage.update_focus_session(&session).await {
            Ok(Some(_)) => info!(
                "Finalized focus session {} as {} ({}ms)",
                session.id,
                status.as_str(),
                focus_ms
            ),
            Ok(None) => warn!(
                "Focus session {} vanished from storage before finalize",
                session.id
            ),
            Err(err) => error!("Failed to persist finalized session {}: {err:#}", session.id),
        }

        if let Some(task_id) = session.task_id {
            if focus_ms > 0 {
                match self.storage.add_task_time_spent(task_id, focus_ms).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Task {task_id} no longer exists; focus time not recorded"),
                    Err(err) => error!("Failed to add focus time to task {task_id}: {err:#}"),
                }
            }
        }

        Some(session)
    }

    /// Persists running progress for the open session. Ignored once that
    /// session has been finalized or replaced.
    pub async fn record_progress(&self, session_id: &str, focus_ms: u64) {
        // Held across the write so a finalize cannot interleave with it.
        let mut active = self.active.lock().await;
        let Some(session) = active.as_mut().filter(|session| session.id == session_id) else {
            return;
        };
        session.focus_ms = focus_ms;

        if let Err(err) = self.storage.update_focus_session(session).await {
            debug!("Progress update for session {session_id} failed: {err:#}");
        }
    }

    /// Logs an interruption against the open session. No session, no record.
    pub async fn record_interruption(
        &self,
        occurred_at: DateTime<Utc>,
        kind: Option<String>,
        note: Option<String>,
    ) -> Option<Interruption> {
        let Some(session_id) = self.active_session_id().await else {
            debug!("Interruption dropped: no active focus session");
            return None;
        };

        let input = NewInterruption {
            session_id: session_id.clone(),
            occurred_at,
            duration_ms: None,
            kind,
            note,
            screenshot_uri: None,
        };

        match self.storage.create_interruption(input).await {
            Ok(interruption) => Some(interruption),
            Err(err) => {
                error!("Failed to record interruption for session {session_id}: {err:#}");
                None
            }
        }
    }

    /// Cancels sessions left active by a previous run of the process.
    pub async fn recover_orphaned(&self) -> anyhow::Result<usize> {
        let open_id = self.active_session_id().await;
        let orphans = self.storage.active_focus_sessions().await?;
        let now = Utc::now();
        let mut recovered = 0;

        for mut session in orphans {
            if open_id.as_deref() == Some(session.id.as_str()) {
                continue;
            }
            warn!("Recovered orphaned focus session {}; marking as cancelled", session.id);
            session.status = SessionStatus::Cancelled;
            if session.ended_at.is_none() {
                session.ended_at = Some(now);
            }
            if self.storage.update_focus_session(&session).await?.is_some() {
                recovered += 1;
            }
        }

        Ok(recovered)
    }
}
