//! Focus timer core: a countdown state machine backed by SQLite sessions, with
//! screenshot-based interruption detection that can pause the timer.

pub mod app;
pub mod db;
pub mod detection;
pub mod monitoring;
pub mod notify;
pub mod session;
pub mod settings;
pub mod storage;
pub mod timer;
pub mod utils;

#[cfg(test)]
mod testutil;

pub use app::App;
pub use detection::{InterruptionDetector, PauseSink};
pub use notify::{LogNotifier, Notification, Notifier};
pub use session::{SessionError, SessionLifecycle};
pub use settings::{Settings, SettingsSource, SettingsStore, SettingsUpdate};
pub use storage::Storage;
pub use timer::{FocusTimer, TimerEvent, TimerPhase, TimerSnapshot, TimerState};
pub use utils::init_logging;
