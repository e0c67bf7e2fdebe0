//! In-memory collaborators shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, RwLock,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    db::{FocusSession, Interruption, NewInterruption, SessionStatus},
    monitoring::{Monitor, WorkerMessage},
    notify::{Notification, Notifier},
    settings::{Settings, SettingsSource},
    storage::Storage,
};

/// `Storage` kept in hash maps, with switches to make writes fail.
#[derive(Default)]
pub struct MemoryStorage {
    sessions: Mutex<HashMap<String, FocusSession>>,
    interruptions: Mutex<Vec<Interruption>>,
    task_time: Mutex<HashMap<i64, u64>>,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
    fail_creates: AtomicBool,
    fail_updates: AtomicBool,
}

impl MemoryStorage {
    pub fn session(&self, id: &str) -> Option<FocusSession> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<FocusSession> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    pub fn interruptions(&self) -> Vec<Interruption> {
        self.interruptions.lock().unwrap().clone()
    }

    pub fn task_time(&self, task_id: i64) -> u64 {
        self.task_time
            .lock()
            .unwrap()
            .get(&task_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Inserts an active session as if a previous process had left it open.
    pub fn seed_active_session(&self, planned_ms: u64) -> FocusSession {
        let session = new_session(planned_ms, None);
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        session
    }
}

fn new_session(planned_ms: u64, task_id: Option<i64>) -> FocusSession {
    FocusSession {
        id: Uuid::new_v4().to_string(),
        task_id,
        started_at: Utc::now(),
        ended_at: None,
        planned_ms,
        focus_ms: 0,
        status: SessionStatus::Active,
        notes: None,
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_focus_session(
        &self,
        planned_ms: u64,
        task_id: Option<i64>,
    ) -> Result<FocusSession> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(anyhow!("storage unavailable"));
        }
        let session = new_session(planned_ms, task_id);
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn update_focus_session(&self, session: &FocusSession) -> Result<Option<FocusSession>> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(anyhow!("storage unavailable"));
        }
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&session.id) {
            Some(stored) => {
                *stored = session.clone();
                Ok(Some(session.clone()))
            }
            None => Ok(None),
        }
    }

    async fn create_interruption(&self, input: NewInterruption) -> Result<Interruption> {
        if !self.sessions.lock().unwrap().contains_key(&input.session_id) {
            return Err(anyhow!("unknown session {}", input.session_id));
        }
        let record = input.into_record(Uuid::new_v4().to_string());
        self.interruptions.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn active_focus_sessions(&self) -> Result<Vec<FocusSession>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|session| session.is_active())
            .cloned()
            .collect())
    }

    async fn add_task_time_spent(&self, task_id: i64, focus_ms: u64) -> Result<bool> {
        *self.task_time.lock().unwrap().entry(task_id).or_default() += focus_ms;
        Ok(true)
    }
}

/// `Monitor` driven by hand: tests push messages with [`FakeMonitor::emit`].
pub struct FakeMonitor {
    results: broadcast::Sender<WorkerMessage>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    refuse: AtomicBool,
}

impl Default for FakeMonitor {
    fn default() -> Self {
        let (results, _) = broadcast::channel(16);
        Self {
            results,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        }
    }
}

impl FakeMonitor {
    pub fn emit(&self, message: WorkerMessage) {
        let _ = self.results.send(message);
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Monitor for FakeMonitor {
    async fn start_monitoring(&self) -> bool {
        // Real workers await their own lock here; give other callers a turn.
        tokio::task::yield_now().await;
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn stop_monitoring(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
        self.results.subscribe()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}

pub struct StaticSettings {
    settings: RwLock<Settings>,
}

impl StaticSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn set(&self, settings: Settings) {
        *self.settings.write().unwrap() = settings;
    }
}

impl SettingsSource for StaticSettings {
    fn current(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }
}
