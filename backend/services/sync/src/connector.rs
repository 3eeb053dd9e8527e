use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Stable key correlating a source customer with its remote contact.
///
/// `originator` names the source company, `external_id` is the customer code.
/// Both are written onto the contact at creation, so lookups keep resolving to
/// the same contact when the name or any other attribute changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchKey {
    pub originator: String,
    pub external_id: String,
}

impl MatchKey {
    pub fn new(originator: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            originator: originator.into(),
            external_id: external_id.into(),
        }
    }
}

impl std::fmt::Display for MatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.originator, self.external_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Work,
    Mobile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedValue {
    pub value: String,
    pub kind: ValueKind,
    /// Remote identifier of this entry, when the remote tracks entries separately.
    pub entry_id: Option<String>,
}

impl TypedValue {
    pub fn work(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: ValueKind::Work,
            entry_id: None,
        }
    }

    pub fn mobile(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: ValueKind::Mobile,
            entry_id: None,
        }
    }
}

/// Contact as the remote service sees it. `None` / empty fields are left out of
/// the payload so the remote keeps whatever it already has for them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetRecord {
    pub remote_id: Option<String>,
    pub match_key: Option<MatchKey>,
    pub name: Option<String>,
    pub phones: Vec<TypedValue>,
    pub emails: Vec<TypedValue>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    /// Retryable failure that outlived the connector's retry budget.
    #[error("transient failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    #[error("rejected by remote: {0}")]
    Permanent(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),
}

/// Remote side of the sync. Implementations own rate limiting and retries.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    fn integration_name(&self) -> &str;

    async fn find(&self, key: &MatchKey) -> Result<Option<TargetRecord>, TargetError>;

    /// Returns the remote identifier of the new record.
    async fn create(&self, record: &TargetRecord) -> Result<String, TargetError>;

    async fn update(&self, remote_id: &str, record: &TargetRecord) -> Result<(), TargetError>;
}
