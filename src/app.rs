use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::{
    db::{Database, DB_FILE},
    detection::{DetectorConfig, InterruptionDetector},
    monitoring::{Classifier, MonitoringWorker, ScreenCapture},
    notify::Notifier,
    session::SessionLifecycle,
    settings::{SettingsStore, SETTINGS_FILE},
    timer::{FocusTimer, TimerConfig},
    utils::init_logging,
};

pub const DB_PATH_ENV: &str = "NONCRAST_DB_PATH";

/// Everything the UI layer talks to, wired together.
pub struct App {
    db: Database,
    settings: Arc<SettingsStore>,
    monitor: Arc<MonitoringWorker>,
    timer: FocusTimer,
}

impl App {
    /// Opens storage and settings under `data_dir`, cancels sessions a
    /// previous run left active, then builds the timer.
    pub async fn open(
        data_dir: &Path,
        capture: Arc<dyn ScreenCapture>,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        init_logging();
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let db = Database::new(resolve_db_path(data_dir, std::env::var_os(DB_PATH_ENV)))?;
        let settings = Arc::new(SettingsStore::new(data_dir.join(SETTINGS_FILE))?);

        let lifecycle = SessionLifecycle::new(Arc::new(db.clone()));
        match lifecycle.recover_orphaned().await {
            Ok(0) => {}
            Ok(count) => warn!("Cancelled {count} focus session(s) left open by a previous run"),
            Err(err) => warn!("Orphaned session recovery failed: {err:#}"),
        }

        let monitor = Arc::new(MonitoringWorker::new(
            capture,
            classifier,
            settings.clone(),
        ));
        let detector = InterruptionDetector::new(
            monitor.clone(),
            settings.clone(),
            lifecycle.clone(),
            notifier,
            DetectorConfig::default(),
        );
        let timer = FocusTimer::new(lifecycle, detector, TimerConfig::from_env());

        info!("noncrast ready (data in {})", data_dir.display());
        Ok(Self {
            db,
            settings,
            monitor,
            timer,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn monitor(&self) -> &MonitoringWorker {
        &self.monitor
    }

    pub fn timer(&self) -> &FocusTimer {
        &self.timer
    }
}

fn resolve_db_path(data_dir: &Path, override_path: Option<OsString>) -> PathBuf {
    match override_path.filter(|path| !path.is_empty()) {
        Some(path) => PathBuf::from(path),
        None => data_dir.join(DB_FILE),
    }
}
