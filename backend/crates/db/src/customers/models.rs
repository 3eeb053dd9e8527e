use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::models::Watermark;

/// One customer row read from the business database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub code: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub modified_at: DateTime<Utc>,
}

impl SourceRecord {
    /// Position of this record in the change feed.
    pub fn cursor(&self) -> Watermark {
        Watermark::new(self.modified_at, self.code.clone())
    }
}

/// Trim a nullable text column; blank values become `None`.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Join the two address lines the ledger stores separately.
pub fn join_address(line1: Option<String>, line2: Option<String>) -> Option<String> {
    match (non_blank(line1), non_blank(line2)) {
        (Some(a), Some(b)) => Some(format!("{a}, {b}")),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
