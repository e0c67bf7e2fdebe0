use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub version: u32,
    /// Hour (0-23) at which a new day starts for daily stats.
    pub end_of_day: u8,
    pub theme: Theme,
    pub enable_detection: bool,
    /// Seconds between captures; fractional values are allowed.
    pub interruption_detection_interval_s: f64,
    /// Off-track ratio at or above which an interruption fires.
    pub interruption_threshold: f64,
    /// Number of interruptions in one session before the timer auto-pauses.
    pub interruption_pause_trigger: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 0,
            end_of_day: 0,
            theme: Theme::Light,
            enable_detection: true,
            interruption_detection_interval_s: 1.0,
            interruption_threshold: 0.3,
            interruption_pause_trigger: 2,
        }
    }
}

impl Settings {
    /// Clamps every field into its valid range.
    pub fn normalized(mut self) -> Self {
        self.version = 0;
        self.end_of_day = self.end_of_day.min(23);
        self.interruption_detection_interval_s = if self.interruption_detection_interval_s.is_finite() {
            self.interruption_detection_interval_s.max(1.0)
        } else {
            Settings::default().interruption_detection_interval_s
        };
        self.interruption_threshold = if self.interruption_threshold.is_nan() {
            Settings::default().interruption_threshold
        } else {
            self.interruption_threshold.clamp(0.0, 1.0)
        };
        self.interruption_pause_trigger = self.interruption_pause_trigger.max(1);
        self
    }
}

/// Partial settings patch; `None` fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub end_of_day: Option<u8>,
    pub theme: Option<Theme>,
    pub enable_detection: Option<bool>,
    pub interruption_detection_interval_s: Option<f64>,
    pub interruption_threshold: Option<f64>,
    pub interruption_pause_trigger: Option<u32>,
}

impl SettingsUpdate {
    fn apply(self, base: &Settings) -> Settings {
        Settings {
            version: base.version,
            end_of_day: self.end_of_day.unwrap_or(base.end_of_day),
            theme: self.theme.unwrap_or(base.theme),
            enable_detection: self.enable_detection.unwrap_or(base.enable_detection),
            interruption_detection_interval_s: self
                .interruption_detection_interval_s
                .unwrap_or(base.interruption_detection_interval_s),
            interruption_threshold: self
                .interruption_threshold
                .unwrap_or(base.interruption_threshold),
            interruption_pause_trigger: self
                .interruption_pause_trigger
                .unwrap_or(base.interruption_pause_trigger),
        }
        .normalized()
    }
}

/// Synchronous settings read used by the timer core and the monitoring worker.
pub trait SettingsSource: Send + Sync {
    fn current(&self) -> Settings;
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str::<Settings>(&contents) {
                Ok(parsed) => parsed.normalized(),
                Err(err) => {
                    warn!(
                        "Settings at {} are invalid, using defaults: {err}",
                        path.display()
                    );
                    Settings::default()
                }
            }
        } else {
            Settings::default()
        };

        let store = Self {
            path,
            data: RwLock::new(data),
        };
        store.persist(&store.read())?;
        Ok(store)
    }

    pub fn get(&self) -> Settings {
        self.read().clone()
    }

    pub fn update(&self, patch: SettingsUpdate) -> Result<Settings> {
        let mut guard = self.write();
        let merged = patch.apply(&guard);
        self.persist(&merged)?;
        *guard = merged.clone();
        Ok(merged)
    }

    pub fn reset(&self) -> Result<Settings> {
        let mut guard = self.write();
        let defaults = Settings::default();
        self.persist(&defaults)?;
        *guard = defaults.clone();
        Ok(defaults)
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, Settings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Settings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SettingsSource for SettingsStore {
    fn current(&self) -> Settings {
        self.get()
    }
}
