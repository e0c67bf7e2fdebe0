use serde::Serialize;

use crate::db::FocusSession;

use super::TimerState;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub state: TimerState,
    pub remaining_ms: u64,
}

/// Pushed to observers over the timer's broadcast channel.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum TimerEvent {
    StateChanged(TimerSnapshot),
    #[serde(rename_all = "camelCase")]
    Tick {
        elapsed_ms: u64,
        remaining_ms: u64,
    },
    Heartbeat(TimerSnapshot),
    TimeUp(TimerSnapshot),
    SessionFinished(FocusSession),
}
