use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::accumulator::ElapsedAccumulator;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimerPhase {
    /// No open session.
    #[default]
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub phase: TimerPhase,
    pub duration_ms: u64,
    /// Last synced value; use [`TimerState::current_elapsed_ms`] for a live read.
    pub elapsed_ms: u64,
    pub current_task_id: Option<i64>,
    pub active_session_id: Option<String>,
    #[serde(skip)]
    accumulator: ElapsedAccumulator,
}

impl TimerState {
    pub fn new(duration_ms: u64) -> Self {
        Self {
            phase: TimerPhase::Idle,
            duration_ms,
            elapsed_ms: 0,
            current_task_id: None,
            active_session_id: None,
            accumulator: ElapsedAccumulator::new(),
        }
    }

    pub fn current_elapsed_ms(&self, now: Instant) -> u64 {
        self.accumulator.elapsed_ms(now)
    }

    /// Recomputed from the stored anchors on every call.
    pub fn remaining_ms(&self, now: Instant) -> u64 {
        self.duration_ms
            .saturating_sub(self.current_elapsed_ms(now))
    }

    pub fn sync(&mut self, now: Instant) {
        self.elapsed_ms = self.current_elapsed_ms(now);
    }

    pub(crate) fn begin(&mut self, session_id: String, now: Instant) {
        self.accumulator.reset();
        self.accumulator.open_segment(now);
        self.phase = TimerPhase::Running;
        self.active_session_id = Some(session_id);
        self.elapsed_ms = 0;
    }

    pub(crate) fn pause(&mut self, now: Instant) {
        self.accumulator.close_segment(now);
        self.phase = TimerPhase::Paused;
        self.sync(now);
    }

    pub(crate) fn resume(&mut self, now: Instant) {
        self.accumulator.open_segment(now);
        self.phase = TimerPhase::Running;
        self.sync(now);
    }

    /// Ends the session from stop or reset. Returns the focus time to record;
    /// the displayed elapsed time goes back to zero.
    pub(crate) fn finish(&mut self, now: Instant) -> u64 {
        self.accumulator.close_segment(now);
        let focus_ms = self.accumulator.elapsed_ms(now).min(self.duration_ms);
        self.accumulator.reset();
        self.elapsed_ms = 0;
        self.phase = TimerPhase::Idle;
        self.active_session_id = None;
        focus_ms
    }

    /// Ends the session because the countdown ran out. Elapsed is pinned to
    /// the full duration.
    pub(crate) fn expire(&mut self) -> u64 {
        self.accumulator.reset_to(self.duration_ms);
        self.elapsed_ms = self.duration_ms;
        self.phase = TimerPhase::Idle;
        self.active_session_id = None;
        self.duration_ms
    }
}
