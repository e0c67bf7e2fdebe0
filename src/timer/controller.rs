use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    db::SessionStatus,
    detection::{InterruptionDetector, PauseSink},
    session::{SessionError, SessionLifecycle},
};

use super::{TimerConfig, TimerEvent, TimerPhase, TimerSnapshot, TimerState};

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct TimerInner {
    state: Mutex<TimerState>,
    /// Serializes transitions, including the autonomous time-up.
    transitions: Mutex<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    /// Bumped whenever a ticker is started or retired; stale tickers bail.
    ticker_epoch: AtomicU64,
    lifecycle: SessionLifecycle,
    detector: InterruptionDetector,
    events: broadcast::Sender<TimerEvent>,
    config: TimerConfig,
}

/// The focus timer: owns phase and elapsed-time accounting, opens and closes
/// the backing session, and starts/stops detection alongside the run segments.
#[derive(Clone)]
pub struct FocusTimer {
    inner: Arc<TimerInner>,
}

impl FocusTimer {
    pub fn new(
        lifecycle: SessionLifecycle,
        detector: InterruptionDetector,
        config: TimerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState::new(config.default_duration_ms())),
            transitions: Mutex::new(()),
            ticker: Mutex::new(None),
            ticker_epoch: AtomicU64::new(0),
            lifecycle,
            detector,
            events,
            config,
        });

        inner
            .detector
            .bind_timer(Arc::new(TimerHandle(Arc::downgrade(&inner))));

        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.inner.events.subscribe()
    }

    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.inner.lifecycle
    }

    pub fn detector(&self) -> &InterruptionDetector {
        &self.inner.detector
    }

    pub async fn snapshot(&self) -> TimerSnapshot {
        let mut state = self.inner.state.lock().await;
        snapshot_of(&mut state, Instant::now())
    }

    /// Opens a session and starts counting. A no-op unless idle.
    pub async fn start(&self) -> Result<TimerSnapshot, SessionError> {
        let _transition = self.inner.transitions.lock().await;

        let (duration_ms, task_id) = {
            let mut state = self.inner.state.lock().await;
            if state.phase != TimerPhase::Idle {
                return Ok(snapshot_of(&mut state, Instant::now()));
            }
            (state.duration_ms, state.current_task_id)
        };

        let session = match self.inner.lifecycle.open(duration_ms, task_id).await {
            Ok(session) => session,
            Err(err) => {
                warn!("Timer not started: {err}");
                return Err(err);
            }
        };

        let snapshot = {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            state.begin(session.id.clone(), now);
            snapshot_of(&mut state, now)
        };

        self.spawn_ticker().await;
        if !self.inner.detector.start_detection().await {
            info!("Session {} running without interruption detection", session.id);
        }

        info!("Timer started for {duration_ms}ms (session {})", session.id);
        self.emit(TimerEvent::StateChanged(snapshot.clone()));
        Ok(snapshot)
    }

    pub async fn pause(&self) -> TimerSnapshot {
        self.pause_transition().await.0
    }

    /// The flag reports whether a running timer was actually paused.
    async fn pause_transition(&self) -> (TimerSnapshot, bool) {
        let _transition = self.inner.transitions.lock().await;

        let snapshot = {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            if state.phase != TimerPhase::Running {
                return (snapshot_of(&mut state, now), false);
            }
            state.pause(now);
            snapshot_of(&mut state, now)
        };

        self.cancel_ticker().await;
        self.inner.detector.stop_detection().await;

        info!("Timer paused at {}ms", snapshot.state.elapsed_ms);
        self.emit(TimerEvent::StateChanged(snapshot.clone()));
        (snapshot, true)
    }

    pub async fn unpause(&self) -> TimerSnapshot {
        let _transition = self.inner.transitions.lock().await;

        let snapshot = {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            if state.phase != TimerPhase::Paused {
                return snapshot_of(&mut state, now);
            }
            state.resume(now);
            snapshot_of(&mut state, now)
        };

        self.spawn_ticker().await;
        self.inner.detector.start_detection().await;

        info!("Timer resumed at {}ms", snapshot.state.elapsed_ms);
        self.emit(TimerEvent::StateChanged(snapshot.clone()));
        snapshot
    }

    pub async fn resume(&self) -> TimerSnapshot {
        self.unpause().await
    }

    /// Ends the session as completed.
    pub async fn stop(&self) -> TimerSnapshot {
        self.finish(SessionStatus::Completed).await
    }

    /// Ends the session as cancelled, discarding progress.
    pub async fn reset(&self) -> TimerSnapshot {
        self.finish(SessionStatus::Cancelled).await
    }

    /// Changes the duration in any phase without touching elapsed time.
    ///
    /// Shrinking the duration of a running timer to or below the time already
    /// counted ends the session right away, exactly as if time had run out.
    pub async fn set_time(&self, duration_ms: u64) -> TimerSnapshot {
        let _transition = self.inner.transitions.lock().await;

        let (snapshot, expired) = {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            state.duration_ms = duration_ms;
            let expired = state.phase == TimerPhase::Running && state.remaining_ms(now) == 0;
            if expired {
                state.expire();
            }
            (snapshot_of(&mut state, now), expired)
        };

        if expired {
            // Not on the ticker task, so aborting it is safe.
            self.cancel_ticker().await;
            self.finish_time_up(snapshot.clone()).await;
        } else {
            self.emit(TimerEvent::StateChanged(snapshot.clone()));
        }
        snapshot
    }

    pub async fn set_task(&self, task_id: i64) -> TimerSnapshot {
        self.update_task(Some(task_id)).await
    }

    pub async fn unset_task(&self) -> TimerSnapshot {
        self.update_task(None).await
    }

    async fn update_task(&self, task_id: Option<i64>) -> TimerSnapshot {
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            state.current_task_id = task_id;
            snapshot_of(&mut state, Instant::now())
        };
        self.emit(TimerEvent::StateChanged(snapshot.clone()));
        snapshot
    }

    async fn finish(&self, status: SessionStatus) -> TimerSnapshot {
        let _transition = self.inner.transitions.lock().await;

        let (focus_ms, snapshot) = {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            if state.phase == TimerPhase::Idle {
                return snapshot_of(&mut state, now);
            }
            let focus_ms = state.finish(now);
            (focus_ms, snapshot_of(&mut state, now))
        };

        self.cancel_ticker().await;
        self.close_session(status, focus_ms).await;

        info!("Timer ended as {} after {focus_ms}ms", status.as_str());
        self.emit(TimerEvent::StateChanged(snapshot.clone()));
        snapshot
    }

    /// Time-up path, run from the ticker task itself.
    async fn expire(&self, epoch: u64) {
        let _transition = self.inner.transitions.lock().await;

        let snapshot = {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            if state.phase != TimerPhase::Running || !self.is_current_ticker(epoch) {
                return;
            }
            state.expire();
            snapshot_of(&mut state, now)
        };

        // Detach rather than abort: this code runs on the ticker task.
        self.inner.ticker_epoch.fetch_add(1, Ordering::SeqCst);
        drop(self.inner.ticker.lock().await.take());

        self.finish_time_up(snapshot).await;
    }

    /// Closes the session after the state has been expired.
    async fn finish_time_up(&self, snapshot: TimerSnapshot) {
        let focus_ms = snapshot.state.elapsed_ms;
        self.close_session(SessionStatus::Completed, focus_ms).await;

        info!("Time up after {focus_ms}ms");
        self.emit(TimerEvent::TimeUp(snapshot.clone()));
        self.emit(TimerEvent::StateChanged(snapshot));
    }

    async fn close_session(&self, status: SessionStatus, focus_ms: u64) {
        self.inner.detector.stop_detection().await;
        let finalized = self
            .inner
            .lifecycle
            .finalize(status, focus_ms, Utc::now())
            .await;
        self.inner.detector.reset_escalation();

        if let Some(session) = finalized {
            self.emit(TimerEvent::SessionFinished(session));
        }
    }

    async fn spawn_ticker(&self) {
        let epoch = self.inner.ticker_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.refresh_interval;
        let heartbeat_every = self.inner.config.heartbeat_every_ticks.max(1);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u32 = 0;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ticks = ticks.wrapping_add(1);
                let timer = FocusTimer { inner };
                if !timer.tick(epoch, ticks % heartbeat_every == 0).await {
                    break;
                }
            }
        });

        let mut ticker = self.inner.ticker.lock().await;
        if let Some(previous) = ticker.replace(handle) {
            previous.abort();
        }
    }

    async fn cancel_ticker(&self) {
        self.inner.ticker_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.inner.ticker.lock().await.take() {
            handle.abort();
        }
    }

    fn is_current_ticker(&self, epoch: u64) -> bool {
        self.inner.ticker_epoch.load(Ordering::SeqCst) == epoch
    }

    /// One display recompute. Returns false once the ticker should exit.
    async fn tick(&self, epoch: u64, heartbeat: bool) -> bool {
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            if state.phase != TimerPhase::Running || !self.is_current_ticker(epoch) {
                return false;
            }
            snapshot_of(&mut state, Instant::now())
        };

        if snapshot.remaining_ms == 0 {
            self.expire(epoch).await;
            return false;
        }

        self.emit(TimerEvent::Tick {
            elapsed_ms: snapshot.state.elapsed_ms,
            remaining_ms: snapshot.remaining_ms,
        });

        if heartbeat {
            if let Some(session_id) = snapshot.state.active_session_id.clone() {
                let lifecycle = self.inner.lifecycle.clone();
                let focus_ms = snapshot.state.elapsed_ms;
                tokio::spawn(async move {
                    lifecycle.record_progress(&session_id, focus_ms).await;
                });
            }
            self.emit(TimerEvent::Heartbeat(snapshot));
        }
        true
    }

    fn emit(&self, event: TimerEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

fn snapshot_of(state: &mut TimerState, now: Instant) -> TimerSnapshot {
    state.sync(now);
    TimerSnapshot {
        remaining_ms: state.remaining_ms(now),
        state: state.clone(),
    }
}

/// Lets the detector pause the timer without keeping it alive.
struct TimerHandle(Weak<TimerInner>);

#[async_trait]
impl PauseSink for TimerHandle {
    async fn pause_for_interruption(&self) -> bool {
        let Some(inner) = self.0.upgrade() else {
            return false;
        };
        let timer = FocusTimer { inner };
        let (snapshot, paused) = timer.pause_transition().await;
        if paused {
            info!(
                "Timer auto-paused by interruption detection at {}ms",
                snapshot.state.elapsed_ms
            );
        }
        paused
    }
}
