/// Cycle-level failures. Per-record problems never show up here; they are
/// reported as [`crate::reconcile::Outcome::Failed`] instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("watermark persistence failed: {0}")]
    Persistence(String),

    #[error("{integration} rejected credentials: {message}")]
    AuthFailure {
        integration: String,
        message: String,
    },

    #[error("a cycle is already running")]
    AlreadyRunning,
}

impl SyncError {
    /// Needs a human to fix credentials before the next cycle can succeed.
    pub fn needs_alert(&self) -> bool {
        matches!(self, Self::AuthFailure { .. })
    }
}
