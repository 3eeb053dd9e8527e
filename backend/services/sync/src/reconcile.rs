use std::sync::Arc;

use relay_db::customers::models::SourceRecord;

use crate::connector::{MatchKey, TargetConnector, TargetError, TargetRecord, TypedValue};
use crate::error::SyncError;

/// Result of reconciling one source record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created { remote_id: String },
    Updated { remote_id: String },
    /// Not attempted: the record lacks required data.
    Skipped(String),
    /// Attempted and rejected, or retries exhausted.
    Failed(String),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Create-or-update driver for one company mapping.
pub struct Reconciler<C> {
    connector: Arc<C>,
    originator: String,
    source_label: String,
}

impl<C: TargetConnector> Reconciler<C> {
    pub fn new(connector: Arc<C>, source_company: &str, source_label: impl Into<String>) -> Self {
        Self {
            connector,
            originator: format!("relay:{source_company}"),
            source_label: source_label.into(),
        }
    }

    pub fn integration_name(&self) -> &str {
        self.connector.integration_name()
    }

    pub fn match_key(&self, record: &SourceRecord) -> MatchKey {
        MatchKey::new(self.originator.clone(), record.code.trim())
    }

    /// Field-by-field projection. Absent source fields stay absent so the remote
    /// keeps its current values for them.
    pub fn map_record(&self, record: &SourceRecord) -> TargetRecord {
        let mut phones = Vec::new();
        if let Some(phone) = &record.phone {
            phones.push(TypedValue::work(phone.clone()));
        }
        if let Some(mobile) = &record.mobile {
            phones.push(TypedValue::mobile(mobile.clone()));
        }

        TargetRecord {
            remote_id: None,
            match_key: Some(self.match_key(record)),
            name: record.name.clone(),
            phones,
            emails: record.email.iter().cloned().map(TypedValue::work).collect(),
            address: record.address.clone(),
            city: record.city.clone(),
            postal_code: record.postal_code.clone(),
            country: record.country.clone(),
            note: Some(format!(
                "Synced from {} - Customer Code: {}",
                self.source_label,
                record.code.trim()
            )),
        }
    }

    /// Only [`SyncError::AuthFailure`] comes back as `Err`; every other connector
    /// error is folded into [`Outcome::Failed`].
    pub async fn reconcile(&self, record: &SourceRecord) -> Result<Outcome, SyncError> {
        if record.code.trim().is_empty() {
            return Ok(Outcome::Skipped("missing customer code".to_string()));
        }
        if record.name.is_none() {
            return Ok(Outcome::Skipped("missing name".to_string()));
        }

        let mut target = self.map_record(record);
        let key = self.match_key(record);

        let existing = match self.connector.find(&key).await {
            Ok(found) => found,
            Err(e) => return self.failed(&key, "find", e),
        };

        match existing {
            Some(existing) => {
                let Some(remote_id) = existing.remote_id.clone() else {
                    return Ok(Outcome::Failed(format!("match for {key} has no remote id")));
                };
                carry_entry_ids(&mut target.phones, &existing.phones);
                carry_entry_ids(&mut target.emails, &existing.emails);

                match self.connector.update(&remote_id, &target).await {
                    Ok(()) => Ok(Outcome::Updated { remote_id }),
                    Err(e) => self.failed(&key, "update", e),
                }
            }
            None => match self.connector.create(&target).await {
                Ok(remote_id) => Ok(Outcome::Created { remote_id }),
                Err(e) => self.failed(&key, "create", e),
            },
        }
    }

    fn failed(&self, key: &MatchKey, op: &str, err: TargetError) -> Result<Outcome, SyncError> {
        match err {
            TargetError::AuthFailure(message) => Err(SyncError::AuthFailure {
                integration: self.connector.integration_name().to_string(),
                message,
            }),
            other => {
                tracing::warn!(key = %key, op, error = %other, "record failed");
                Ok(Outcome::Failed(format!("{op}: {other}")))
            }
        }
    }
}

/// Reuse the remote entry ids of `existing` (first unused entry of the same kind)
/// so an update overwrites values in place instead of appending duplicates.
fn carry_entry_ids(values: &mut [TypedValue], existing: &[TypedValue]) {
    let mut used = vec![false; existing.len()];
    for value in values.iter_mut() {
        let slot = existing
            .iter()
            .enumerate()
            .find(|(i, e)| !used[*i] && e.kind == value.kind && e.entry_id.is_some());
        if let Some((i, entry)) = slot {
            used[i] = true;
            value.entry_id = entry.entry_id.clone();
        }
    }
}
