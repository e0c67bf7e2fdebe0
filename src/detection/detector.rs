use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    monitoring::{ClassificationResult, Monitor, WorkerMessage},
    notify::{Notification, Notifier},
    session::SessionLifecycle,
    settings::SettingsSource,
};

use super::window::SlidingWindow;

/// Whatever can pause the running timer when escalation kicks in.
#[async_trait]
pub trait PauseSink: Send + Sync {
    /// Returns true only if a running timer was actually paused.
    async fn pause_for_interruption(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    pub window_length: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_length: Duration::from_secs(30),
        }
    }
}

/// Threshold crossings counted against one session.
#[derive(Debug, Default)]
struct Escalation {
    session_id: Option<String>,
    count: u32,
}

struct DetectorState {
    active: bool,
    generation: u64,
    window: SlidingWindow,
    escalation: Escalation,
    listener: Option<CancellationToken>,
}

struct Trigger {
    ratio: f64,
    samples: usize,
    escalations: u32,
}

struct DetectorInner {
    monitor: Arc<dyn Monitor>,
    settings: Arc<dyn SettingsSource>,
    lifecycle: SessionLifecycle,
    notifier: Arc<dyn Notifier>,
    timer: RwLock<Option<Arc<dyn PauseSink>>>,
    state: Mutex<DetectorState>,
}

/// Turns the stream of classification results into interruptions.
///
/// Each activation gets a fresh generation number; results delivered for an
/// older generation are ignored, so a verdict that lands after
/// `stop_detection` cannot leak into the next activation.
#[derive(Clone)]
pub struct InterruptionDetector {
    inner: Arc<DetectorInner>,
}

impl InterruptionDetector {
    pub fn new(
        monitor: Arc<dyn Monitor>,
        settings: Arc<dyn SettingsSource>,
        lifecycle: SessionLifecycle,
        notifier: Arc<dyn Notifier>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                monitor,
                settings,
                lifecycle,
                notifier,
                timer: RwLock::new(None),
                state: Mutex::new(DetectorState {
                    active: false,
                    generation: 0,
                    window: SlidingWindow::new(config.window_length),
                    escalation: Escalation::default(),
                    listener: None,
                }),
            }),
        }
    }

    pub fn bind_timer(&self, timer: Arc<dyn PauseSink>) {
        let mut slot = self
            .inner
            .timer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(timer);
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    pub fn escalation_count(&self) -> u32 {
        self.state().escalation.count
    }

    /// Returns whether detection is running once the call completes.
    ///
    /// Activation is claimed under the state lock before the monitor is asked
    /// to start, so concurrent callers start it at most once.
    pub async fn start_detection(&self) -> bool {
        if self.is_active() {
            return true;
        }
        if !self.inner.settings.current().enable_detection {
            debug!("Detection disabled in settings; not starting");
            return false;
        }

        let session_id = self.inner.lifecycle.active_session_id().await;
        let (generation, token) = {
            let mut state = self.state();
            if state.active {
                return true;
            }
            state.active = true;
            state.generation += 1;
            state.window.clear();
            if state.escalation.session_id != session_id {
                state.escalation = Escalation {
                    session_id,
                    count: 0,
                };
            }
            let token = CancellationToken::new();
            state.listener = Some(token.clone());
            (state.generation, token)
        };

        let results = self.inner.monitor.subscribe();
        if !self.inner.monitor.start_monitoring().await {
            warn!("Monitoring worker refused to start; timer continues without detection");
            let mut state = self.state();
            if state.generation == generation {
                state.active = false;
                state.generation += 1;
                state.listener = None;
            }
            token.cancel();
            return false;
        }

        // A stop may have landed while the monitor was starting.
        let superseded = {
            let state = self.state();
            (state.generation != generation).then_some(state.active)
        };
        if let Some(newer_active) = superseded {
            if !newer_active {
                self.inner.monitor.stop_monitoring().await;
            }
            debug!("Detection activation {generation} superseded before it started");
            return newer_active;
        }

        self.spawn_listener(generation, results, token);
        info!("Interruption detection started (generation {generation})");
        true
    }

    /// Keeps the escalation count; it only resets when the session ends.
    pub async fn stop_detection(&self) {
        let listener = {
            let mut state = self.state();
            if !state.active {
                return;
            }
            state.active = false;
            state.generation += 1;
            state.window.clear();
            state.listener.take()
        };

        if let Some(token) = listener {
            token.cancel();
        }
        self.inner.monitor.stop_monitoring().await;
        info!("Interruption detection stopped");
    }

    pub fn reset_escalation(&self) {
        self.state().escalation = Escalation::default();
    }

    /// Feeds one verdict into the current activation.
    pub async fn on_result(&self, result: ClassificationResult) {
        self.evaluate(None, result).await;
    }

    async fn handle_message(&self, generation: u64, message: WorkerMessage) {
        let job = message.id;
        if let Some(err) = message.error.as_deref() {
            warn!("Classification job {job:?} failed: {err}");
            return;
        }
        match message.into_result() {
            Some(result) => self.evaluate(Some(generation), result).await,
            None => warn!("Dropping malformed classification message (job {job:?})"),
        }
    }

    async fn evaluate(&self, generation: Option<u64>, result: ClassificationResult) {
        // Read per result so live settings changes apply to the next check.
        let settings = self.inner.settings.current().normalized();

        let trigger = {
            let mut state = self.state();
            if !state.active {
                debug!("Ignoring classification result: detection inactive");
                return;
            }
            if generation.is_some_and(|generation| generation != state.generation) {
                debug!("Ignoring classification result from a previous activation");
                return;
            }

            state.window.push(Instant::now(), result.off_track);
            let Some(ratio) = state.window.ratio() else {
                return;
            };
            if ratio < settings.interruption_threshold {
                return;
            }

            let samples = state.window.len();
            state.window.clear();
            state.escalation.count += 1;
            Trigger {
                ratio,
                samples,
                escalations: state.escalation.count,
            }
        };

        self.fire(trigger, result.label, settings.interruption_pause_trigger)
            .await;
    }

    async fn fire(&self, trigger: Trigger, label: String, pause_trigger: u32) {
        let percent = (trigger.ratio * 100.0).round() as u32;
        let window_secs = self.state().window.length().as_secs();
        info!(
            "Off-track threshold crossed: {percent}% of {} samples (alert {} of {pause_trigger})",
            trigger.samples, trigger.escalations
        );

        let note = format!(
            "off-track ratio {:.2} over {} samples",
            trigger.ratio, trigger.samples
        );
        self.inner
            .lifecycle
            .record_interruption(Utc::now(), Some(label), Some(note))
            .await;

        self.inner.notifier.notify(Notification::new(
            "Looks like you're off track",
            format!("About {percent}% of the last {window_secs}s looked off-track."),
        ));

        if trigger.escalations < pause_trigger {
            return;
        }

        let timer = self
            .inner
            .timer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let paused = match timer {
            Some(timer) => timer.pause_for_interruption().await,
            None => {
                warn!("Escalation reached but no timer is bound to pause");
                false
            }
        };
        if !paused {
            debug!("Escalation reached but the timer was not running");
            return;
        }

        self.inner.notifier.notify(Notification::new(
            "Timer paused",
            format!(
                "Paused after {} off-track alerts this session.",
                trigger.escalations
            ),
        ));
    }

    fn spawn_listener(
        &self,
        generation: u64,
        mut results: broadcast::Receiver<WorkerMessage>,
        token: CancellationToken,
    ) {
        let detector = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = results.recv() => match received {
                        Ok(message) => detector.handle_message(generation, message).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Detector lagged behind monitor; skipped {skipped} results");
                        }
                        Err(RecvError::Closed) => {
                            warn!("Monitor result channel closed");
                            break;
                        }
                    },
                }
            }
            debug!("Detection listener for generation {generation} exited");
        });
    }

    fn state(&self) -> MutexGuard<'_, DetectorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn window_len(&self) -> usize {
        self.state().window.len()
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.state().generation
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::{
        settings::Settings,
        testutil::{FakeMonitor, MemoryStorage, RecordingNotifier, StaticSettings},
    };

    #[derive(Default)]
    struct CountingPause {
        calls: AtomicUsize,
        already_paused: AtomicBool,
    }

    #[async_trait]
    impl PauseSink for CountingPause {
        async fn pause_for_interruption(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            !self.already_paused.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        detector: InterruptionDetector,
        monitor: Arc<FakeMonitor>,
        storage: Arc<MemoryStorage>,
        notifier: Arc<RecordingNotifier>,
        settings: Arc<StaticSettings>,
        pause: Arc<CountingPause>,
        lifecycle: SessionLifecycle,
    }

    fn harness(settings: Settings) -> Harness {
        let monitor = Arc::new(FakeMonitor::default());
        let storage = Arc::new(MemoryStorage::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let settings = Arc::new(StaticSettings::new(settings));
        let pause = Arc::new(CountingPause::default());
        let lifecycle = SessionLifecycle::new(storage.clone());
        let detector = InterruptionDetector::new(
            monitor.clone(),
            settings.clone(),
            lifecycle.clone(),
            notifier.clone(),
            DetectorConfig::default(),
        );
        detector.bind_timer(pause.clone());
        Harness {
            detector,
            monitor,
            storage,
            notifier,
            settings,
            pause,
            lifecycle,
        }
    }

    fn verdict(off_track: bool) -> ClassificationResult {
        ClassificationResult {
            label: if off_track {
                "screenshot of user watching a video".into()
            } else {
                "screenshot of user working".into()
            },
            score: 0.9,
            off_track,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_detection_never_starts_the_monitor() {
        let h = harness(Settings {
            enable_detection: false,
            ..Settings::default()
        });

        assert!(!h.detector.start_detection().await);
        assert!(!h.detector.is_active());
        assert_eq!(h.monitor.starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_monitor_leaves_detection_inactive() {
        let h = harness(Settings::default());
        h.monitor.refuse(true);

        assert!(!h.detector.start_detection().await);
        assert!(!h.detector.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let h = harness(Settings::default());

        assert!(h.detector.start_detection().await);
        assert!(h.detector.start_detection().await);
        assert_eq!(h.monitor.starts(), 1);

        h.detector.stop_detection().await;
        h.detector.stop_detection().await;
        assert_eq!(h.monitor.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn crossing_threshold_records_one_interruption_and_clears_window() {
        let h = harness(Settings::default());
        h.lifecycle.open(60_000, None).await.unwrap();
        h.detector.start_detection().await;

        for off in [false, false, false, true] {
            h.detector.on_result(verdict(off)).await;
        }
        assert!(h.storage.interruptions().is_empty());
        assert_eq!(h.detector.window_len(), 4);

        h.detector.on_result(verdict(true)).await;

        let interruptions = h.storage.interruptions();
        assert_eq!(interruptions.len(), 1);
        assert_eq!(
            interruptions[0].kind.as_deref(),
            Some("screenshot of user watching a video")
        );
        assert!(interruptions[0].note.as_deref().unwrap().contains("0.40"));
        assert_eq!(h.notifier.count(), 1);
        assert!(h.notifier.all()[0].body.contains("40%"));
        assert_eq!(h.detector.window_len(), 0);
        assert_eq!(h.pause.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_crossing_pauses_the_timer_once() {
        let h = harness(Settings::default());
        h.lifecycle.open(60_000, None).await.unwrap();
        h.detector.start_detection().await;

        h.detector.on_result(verdict(true)).await;
        assert_eq!(h.pause.calls.load(Ordering::SeqCst), 0);

        h.detector.on_result(verdict(true)).await;
        assert_eq!(h.pause.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.detector.escalation_count(), 2);

        let titles: Vec<_> = h.notifier.all().into_iter().map(|n| n.title).collect();
        assert_eq!(
            titles,
            vec![
                "Looks like you're off track",
                "Looks like you're off track",
                "Timer paused"
            ]
        );

        h.detector.reset_escalation();
        assert_eq!(h.detector.escalation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_paused_notice_when_timer_was_not_running() {
        let h = harness(Settings::default());
        h.lifecycle.open(60_000, None).await.unwrap();
        h.detector.start_detection().await;
        h.pause.already_paused.store(true, Ordering::SeqCst);

        h.detector.on_result(verdict(true)).await;
        h.detector.on_result(verdict(true)).await;

        assert_eq!(h.pause.calls.load(Ordering::SeqCst), 1);
        let titles: Vec<_> = h.notifier.all().into_iter().map(|n| n.title).collect();
        assert!(!titles.iter().any(|title| title == "Timer paused"));
        assert_eq!(titles.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_launch_the_monitor_once() {
        let h = harness(Settings::default());

        let (first, second) = tokio::join!(h.detector.start_detection(), h.detector.start_detection());

        assert!(first && second);
        assert!(h.detector.is_active());
        assert_eq!(h.monitor.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_start_can_be_retried() {
        let h = harness(Settings::default());
        h.monitor.refuse(true);
        assert!(!h.detector.start_detection().await);

        h.monitor.refuse(false);
        assert!(h.detector.start_detection().await);
        assert!(h.detector.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_escalation_but_clears_window() {
        let h = harness(Settings {
            interruption_pause_trigger: 3,
            ..Settings::default()
        });
        h.lifecycle.open(60_000, None).await.unwrap();
        h.detector.start_detection().await;

        h.detector.on_result(verdict(true)).await;
        h.detector.on_result(verdict(false)).await;
        h.detector.stop_detection().await;

        assert_eq!(h.detector.window_len(), 0);
        assert_eq!(h.detector.escalation_count(), 1);

        h.detector.start_detection().await;
        assert_eq!(h.detector.escalation_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_session_starts_with_fresh_escalation() {
        let h = harness(Settings {
            interruption_pause_trigger: 5,
            ..Settings::default()
        });
        h.lifecycle.open(60_000, None).await.unwrap();
        h.detector.start_detection().await;
        h.detector.on_result(verdict(true)).await;
        h.detector.stop_detection().await;
        h.lifecycle
            .finalize(crate::db::SessionStatus::Completed, 1, Utc::now())
            .await;

        h.lifecycle.open(60_000, None).await.unwrap();
        h.detector.start_detection().await;

        assert_eq!(h.detector.escalation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_samples_fall_out_of_the_window() {
        let h = harness(Settings {
            interruption_threshold: 0.5,
            ..Settings::default()
        });
        h.detector.start_detection().await;

        for _ in 0..3 {
            h.detector.on_result(verdict(false)).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        h.detector.on_result(verdict(true)).await;

        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_is_read_live() {
        let h = harness(Settings {
            interruption_threshold: 0.9,
            ..Settings::default()
        });
        h.detector.start_detection().await;

        h.detector.on_result(verdict(false)).await;
        h.detector.on_result(verdict(true)).await;
        assert_eq!(h.notifier.count(), 0);

        h.settings.set(Settings {
            interruption_threshold: 0.3,
            ..Settings::default()
        });
        h.detector.on_result(verdict(false)).await;

        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_session_means_notification_without_record() {
        let h = harness(Settings::default());
        h.detector.start_detection().await;

        h.detector.on_result(verdict(true)).await;

        assert_eq!(h.notifier.count(), 1);
        assert!(h.storage.interruptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn results_while_inactive_are_ignored() {
        let h = harness(Settings::default());

        h.detector.on_result(verdict(true)).await;

        assert_eq!(h.notifier.count(), 0);
        assert_eq!(h.detector.escalation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_results_from_previous_activation_are_ignored() {
        let h = harness(Settings::default());
        h.detector.start_detection().await;
        let first_generation = h.detector.generation();
        h.detector.stop_detection().await;
        h.detector.start_detection().await;

        h.detector
            .handle_message(
                first_generation,
                WorkerMessage {
                    id: Some(1),
                    label: Some("unknown".into()),
                    score: Some(0.4),
                    off_track: Some(true),
                    error: None,
                },
            )
            .await;

        assert_eq!(h.notifier.count(), 0);
        assert_eq!(h.detector.window_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn listens_to_monitor_messages_and_drops_malformed_ones() {
        let h = harness(Settings::default());
        h.lifecycle.open(60_000, None).await.unwrap();
        h.detector.start_detection().await;

        h.monitor.emit(WorkerMessage {
            id: Some(1),
            error: Some("worker crashed".into()),
            ..WorkerMessage::default()
        });
        h.monitor.emit(WorkerMessage {
            id: Some(2),
            label: Some("unknown".into()),
            ..WorkerMessage::default()
        });
        h.monitor.emit(WorkerMessage {
            id: Some(3),
            label: Some("screenshot of the home screen".into()),
            score: Some(0.7),
            off_track: Some(true),
            error: None,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.notifier.count(), 1);
        assert_eq!(h.storage.interruptions().len(), 1);

        h.detector.stop_detection().await;
        h.monitor.emit(WorkerMessage {
            id: Some(4),
            label: Some("screenshot of the home screen".into()),
            score: Some(0.7),
            off_track: Some(true),
            error: None,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.notifier.count(), 1);
    }
}
