use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Interruption {
    pub id: String,
    pub session_id: String,
    pub occurred_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    /// Classifier label that triggered the interruption.
    pub kind: Option<String>,
    pub note: Option<String>,
    pub screenshot_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewInterruption {
    pub session_id: String,
    pub occurred_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub kind: Option<String>,
    pub note: Option<String>,
    pub screenshot_uri: Option<String>,
}

impl NewInterruption {
    pub fn into_record(self, id: String) -> Interruption {
        Interruption {
            id,
            session_id: self.session_id,
            occurred_at: self.occurred_at,
            duration_ms: self.duration_ms,
            kind: self.kind,
            note: self.note,
            screenshot_uri: self.screenshot_uri,
        }
    }
}
