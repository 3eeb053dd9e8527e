use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Keyset cursor over the source change feed.
///
/// Ordered by `modified_at`, then `code`, matching the feed's sort order, so two
/// records sharing a timestamp still have a total order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    pub modified_at: DateTime<Utc>,
    pub code: String,
}

impl Watermark {
    pub fn new(modified_at: DateTime<Utc>, code: impl Into<String>) -> Self {
        Self {
            modified_at,
            code: code.into(),
        }
    }

    /// Cursor that sorts before every record stamped `modified_at` or later.
    pub fn floor(modified_at: DateTime<Utc>) -> Self {
        Self::new(modified_at, "")
    }
}

/// Outcome of the last cycle, stored next to the cursor for status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Idle,
    Failed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub entity_type: String,
    pub integration: String,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub cursor_value: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncWatermark {
    pub fn cursor(&self) -> Option<Watermark> {
        self.last_modified_at
            .map(|ts| Watermark::new(ts, self.cursor_value.clone().unwrap_or_default()))
    }
}
