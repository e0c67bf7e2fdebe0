use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex as StdMutex,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{broadcast, Mutex},
    task::{JoinHandle, JoinSet},
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::settings::SettingsSource;

use super::{
    labels::CANDIDATE_LABELS,
    phash::{compute_hamming_distance, compute_phash},
    Monitor, WorkerMessage,
};

// Set to false to silence per-capture logging
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const CAPTURE_TIMEOUT_SECS: u64 = 10;
const CLASSIFY_TIMEOUT_SECS: u64 = 30;
const VERDICT_REUSE_SECS: u64 = 30;
const PHASH_CHANGE_THRESHOLD: u32 = 8;
const RESULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub bytes: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl CapturedFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            captured_at: Utc::now(),
        }
    }
}

/// Screen grabber. Blocking; always invoked from a blocking thread.
pub trait ScreenCapture: Send + Sync + 'static {
    fn capture(&self) -> Result<CapturedFrame>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub score: f64,
}

/// Zero-shot image classifier; returns the best-scoring candidate.
#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    async fn classify(&self, frame: Arc<Vec<u8>>, candidates: &[&str]) -> Result<Classification>;
}

struct RunningLoop {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

/// Last classified frame, reused while the screen looks the same.
#[derive(Default)]
struct VerdictCache {
    entry: Option<(String, Classification, Instant)>,
}

impl VerdictCache {
    fn lookup(&self, phash: &str) -> Option<Classification> {
        let (cached_hash, verdict, at) = self.entry.as_ref()?;
        if at.elapsed() >= Duration::from_secs(VERDICT_REUSE_SECS) {
            return None;
        }
        if compute_hamming_distance(phash, cached_hash) >= PHASH_CHANGE_THRESHOLD {
            return None;
        }
        Some(verdict.clone())
    }

    fn store(&mut self, phash: String, verdict: Classification) {
        self.entry = Some((phash, verdict, Instant::now()));
    }
}

#[derive(Clone)]
struct LoopContext {
    capture: Arc<dyn ScreenCapture>,
    classifier: Arc<dyn Classifier>,
    results: broadcast::Sender<WorkerMessage>,
    next_job: Arc<AtomicU64>,
    cache: Arc<StdMutex<VerdictCache>>,
}

/// Captures the screen on a fixed cadence and publishes one classification
/// message per frame.
pub struct MonitoringWorker {
    capture: Arc<dyn ScreenCapture>,
    classifier: Arc<dyn Classifier>,
    settings: Arc<dyn SettingsSource>,
    results: broadcast::Sender<WorkerMessage>,
    running: Mutex<Option<RunningLoop>>,
    next_job: Arc<AtomicU64>,
}

impl MonitoringWorker {
    pub fn new(
        capture: Arc<dyn ScreenCapture>,
        classifier: Arc<dyn Classifier>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            capture,
            classifier,
            settings,
            results,
            running: Mutex::new(None),
            next_job: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

#[async_trait]
impl Monitor for MonitoringWorker {
    async fn start_monitoring(&self) -> bool {
        let settings = self.settings.current().normalized();
        if !settings.enable_detection {
            log_info!("monitoring refused: detection disabled in settings");
            return false;
        }

        let mut running = self.running.lock().await;
        if running.is_some() {
            return true;
        }

        let ctx = LoopContext {
            capture: self.capture.clone(),
            classifier: self.classifier.clone(),
            results: self.results.clone(),
            next_job: self.next_job.clone(),
            cache: Arc::new(StdMutex::new(VerdictCache::default())),
        };
        let cadence = Duration::from_secs_f64(settings.interruption_detection_interval_s);
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(monitoring_loop(ctx, cadence, cancel_token.clone()));

        log_info!("monitoring started (every {:.1}s)", cadence.as_secs_f64());
        *running = Some(RunningLoop {
            handle,
            cancel_token,
        });
        true
    }

    async fn stop_monitoring(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        // The loop winds down on its own; callers never wait on a capture.
        running.cancel_token.cancel();
        tokio::spawn(async move {
            if let Err(err) = running.handle.await {
                log_error!("monitoring loop failed to join: {err}");
            }
        });
        log_info!("monitoring stop requested");
    }

    fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
        self.results.subscribe()
    }
}

async fn monitoring_loop(ctx: LoopContext, cadence: Duration, cancel_token: CancellationToken) {
    let mut ticker = time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut jobs = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log_info!("monitoring loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let capture = time::timeout(
                    Duration::from_secs(CAPTURE_TIMEOUT_SECS),
                    capture_frame(ctx.capture.clone()),
                );
                let outcome = tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => {
                        log_info!("monitoring loop cancelled mid-capture");
                        break;
                    }
                    outcome = capture => outcome,
                };
                match outcome {
                    Ok(Ok(frame)) if frame.bytes.is_empty() => {
                        log_warn!("captured frame is empty, skipping");
                    }
                    Ok(Ok(frame)) => {
                        let job_id = ctx.next_job.fetch_add(1, Ordering::Relaxed);
                        jobs.spawn(classify_job(ctx.clone(), job_id, frame));
                    }
                    Ok(Err(err)) => log_warn!("screen capture failed: {err:#}"),
                    Err(_) => log_warn!("screen capture timeout (> {}s)", CAPTURE_TIMEOUT_SECS),
                }
            }
            Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(err) = joined {
                    if !err.is_cancelled() {
                        log_error!("classification job panicked: {err}");
                    }
                }
            }
        }
    }

    jobs.shutdown().await;
}

async fn capture_frame(capture: Arc<dyn ScreenCapture>) -> Result<CapturedFrame> {
    tokio::task::spawn_blocking(move || capture.capture())
        .await
        .context("screen capture worker join failed")?
}

async fn classify_job(ctx: LoopContext, job_id: u64, frame: CapturedFrame) {
    let bytes = Arc::new(frame.bytes);

    let phash = match tokio::task::spawn_blocking({
        let bytes = Arc::clone(&bytes);
        move || compute_phash(&bytes)
    })
    .await
    {
        Ok(Ok(hash)) => Some(hash),
        Ok(Err(err)) => {
            log_debug!("job {job_id}: no perceptual hash: {err:#}");
            None
        }
        Err(err) => {
            log_warn!("job {job_id}: phash worker join failed: {err}");
            None
        }
    };

    if let Some(hash) = phash.as_deref() {
        let reused = ctx
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .lookup(hash);
        if let Some(verdict) = reused {
            log_debug!("job {job_id}: frame unchanged, reusing '{}'", verdict.label);
            publish(&ctx.results, WorkerMessage::result(job_id, verdict));
            return;
        }
    }

    let started = Instant::now();
    let outcome = time::timeout(
        Duration::from_secs(CLASSIFY_TIMEOUT_SECS),
        ctx.classifier.classify(Arc::clone(&bytes), &CANDIDATE_LABELS),
    )
    .await;

    let message = match outcome {
        Ok(Ok(verdict)) => {
            log_debug!(
                "job {job_id}: '{}' ({:.2}) in {}ms",
                verdict.label,
                verdict.score,
                started.elapsed().as_millis()
            );
            if let Some(hash) = phash {
                ctx.cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .store(hash, verdict.clone());
            }
            WorkerMessage::result(job_id, verdict)
        }
        Ok(Err(err)) => {
            log_warn!("job {job_id}: classification failed: {err:#}");
            WorkerMessage::failure(job_id, err.to_string())
        }
        Err(_) => {
            log_warn!("job {job_id}: classification timeout (> {}s)", CLASSIFY_TIMEOUT_SECS);
            WorkerMessage::failure(job_id, "classification timed out")
        }
    };

    publish(&ctx.results, message);
}

fn publish(results: &broadcast::Sender<WorkerMessage>, message: WorkerMessage) {
    if results.send(message).is_err() {
        log_debug!("classification result dropped: no subscribers");
    }
}
