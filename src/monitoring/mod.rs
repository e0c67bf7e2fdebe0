//! Background capture+classify worker and the contract the detector consumes.

mod labels;
mod phash;
mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use labels::{is_off_track, CANDIDATE_LABELS, OFF_TRACK_LABELS};
pub use worker::{CapturedFrame, Classification, Classifier, MonitoringWorker, ScreenCapture};

/// Periodic screenshot classification running outside the timer's control flow.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Returns false when the worker refuses to run (e.g. detection disabled).
    async fn start_monitoring(&self) -> bool;

    async fn stop_monitoring(&self);

    /// Results arrive in completion order, not submission order. Dropping the
    /// receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<WorkerMessage>;
}

/// Message posted by the classification worker for one job.
///
/// Every field is optional on the wire; [`WorkerMessage::into_result`] decides
/// whether the message is usable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMessage {
    pub id: Option<u64>,
    pub label: Option<String>,
    pub score: Option<f64>,
    pub off_track: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub label: String,
    pub score: f64,
    pub off_track: bool,
}

impl WorkerMessage {
    pub fn result(id: u64, classification: Classification) -> Self {
        let off_track = is_off_track(&classification.label);
        Self {
            id: Some(id),
            label: Some(classification.label),
            score: Some(classification.score),
            off_track: Some(off_track),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// `None` for error reports and messages missing `label` or `offTrack`.
    pub fn into_result(self) -> Option<ClassificationResult> {
        if self.error.is_some() {
            return None;
        }
        let label = self.label?;
        let off_track = self.off_track?;
        let score = self.score.filter(|score| score.is_finite()).unwrap_or(0.0);
        Some(ClassificationResult {
            label,
            score,
            off_track,
        })
    }
}
