//! In-memory doubles for the feed, the watermark store and the connector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use relay_common::error::{RelayError, RelayResult};
use relay_db::customers::models::SourceRecord;
use relay_db::customers::repositories::ChangeFeed;
use relay_db::sync::models::{CycleStatus, SyncWatermark, Watermark};
use relay_db::sync::repositories::SyncWatermarkRepository;

use crate::connector::{MatchKey, TargetConnector, TargetError, TargetRecord};

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn record(code: &str, modified_secs: i64) -> SourceRecord {
    SourceRecord {
        code: code.to_string(),
        name: Some(format!("Customer {code}")),
        phone: Some("972000000".to_string()),
        mobile: None,
        email: None,
        address: Some("Carrer Major 1".to_string()),
        city: Some("Girona".to_string()),
        postal_code: Some("17001".to_string()),
        country: Some("ES".to_string()),
        modified_at: ts(modified_secs),
    }
}

// ── Connector ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// External id looked up.
    Find(String),
    /// External id created.
    Create(String),
    /// Remote id updated.
    Update(String),
}

#[derive(Default)]
pub struct FakeConnector {
    contacts: Mutex<Vec<TargetRecord>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<String, TargetError>>,
    next_id: AtomicU64,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a contact as if it already existed remotely; returns its id.
    pub fn seed(&self, mut record: TargetRecord) -> String {
        let id = self.allocate_id();
        record.remote_id = Some(id.clone());
        self.contacts.lock().unwrap().push(record);
        id
    }

    /// Every operation on `external_id` fails with `err` from now on.
    pub fn fail_code(&self, external_id: &str, err: TargetError) {
        self.failures
            .lock()
            .unwrap()
            .insert(external_id.to_string(), err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn contacts(&self) -> Vec<TargetRecord> {
        self.contacts.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| !matches!(c, Call::Find(_)))
            .count()
    }

    fn allocate_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 100).to_string()
    }

    fn scripted_failure(&self, external_id: &str) -> Option<TargetError> {
        self.failures.lock().unwrap().get(external_id).cloned()
    }
}

#[async_trait]
impl TargetConnector for FakeConnector {
    fn integration_name(&self) -> &str {
        "fake"
    }

    async fn find(&self, key: &MatchKey) -> Result<Option<TargetRecord>, TargetError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Find(key.external_id.clone()));
        if let Some(err) = self.scripted_failure(&key.external_id) {
            return Err(err);
        }
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.match_key.as_ref() == Some(key))
            .cloned())
    }

    async fn create(&self, record: &TargetRecord) -> Result<String, TargetError> {
        let external_id = record
            .match_key
            .as_ref()
            .map(|k| k.external_id.clone())
            .unwrap_or_default();
        self.calls
            .lock()
            .unwrap()
            .push(Call::Create(external_id.clone()));
        if let Some(err) = self.scripted_failure(&external_id) {
            return Err(err);
        }
        Ok(self.seed(record.clone()))
    }

    async fn update(&self, remote_id: &str, record: &TargetRecord) -> Result<(), TargetError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Update(remote_id.to_string()));
        let mut contacts = self.contacts.lock().unwrap();
        match contacts
            .iter_mut()
            .find(|c| c.remote_id.as_deref() == Some(remote_id))
        {
            Some(existing) => {
                *existing = TargetRecord {
                    remote_id: Some(remote_id.to_string()),
                    ..record.clone()
                };
                Ok(())
            }
            None => Err(TargetError::Permanent(format!("no contact {remote_id}"))),
        }
    }
}

// ── Change feed ─────────────────────────────────────────────

#[derive(Default)]
pub struct FakeFeed {
    records: Mutex<Vec<SourceRecord>>,
    fetches: Mutex<Vec<Watermark>>,
    unavailable: AtomicBool,
    gate: Option<Arc<Semaphore>>,
    delay: Duration,
}

impl FakeFeed {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Default::default()
        }
    }

    /// Every fetch waits for a permit on `gate` first.
    pub fn gated(records: Vec<SourceRecord>, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(records)
        }
    }

    /// Every fetch takes `delay` (on the tokio clock).
    pub fn slow(records: Vec<SourceRecord>, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(records)
        }
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Cursors each fetch was called with.
    pub fn fetches(&self) -> Vec<Watermark> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn fetch_changed(&self, since: &Watermark, limit: i64) -> RelayResult<Vec<SourceRecord>> {
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| RelayError::Database(e.to_string()))?;
        }
        self.fetches.lock().unwrap().push(since.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelayError::Database("connection refused".to_string()));
        }

        let mut matching: Vec<SourceRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.cursor() > *since)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.cursor());
        matching.truncate(limit as usize);
        Ok(matching)
    }
}

// ── Watermark store ─────────────────────────────────────────

#[derive(Default)]
struct StoreState {
    stored: Mutex<Option<Watermark>>,
    advances: Mutex<Vec<Watermark>>,
    cycles: Mutex<Vec<(CycleStatus, Option<String>)>>,
    read_at: Mutex<Vec<Instant>>,
    fail_reads: AtomicBool,
    fail_advances: AtomicBool,
}

/// Clones share state, so a test can keep one to inspect what the scheduler wrote.
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<StoreState>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watermark(watermark: Watermark) -> Self {
        let store = Self::default();
        *store.state.stored.lock().unwrap() = Some(watermark);
        store
    }

    pub fn stored(&self) -> Option<Watermark> {
        self.state.stored.lock().unwrap().clone()
    }

    pub fn advances(&self) -> Vec<Watermark> {
        self.state.advances.lock().unwrap().clone()
    }

    pub fn cycles(&self) -> Vec<(CycleStatus, Option<String>)> {
        self.state.cycles.lock().unwrap().clone()
    }

    /// When each watermark read (the first step of a cycle) happened.
    pub fn read_times(&self) -> Vec<Instant> {
        self.state.read_at.lock().unwrap().clone()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_advances(&self, fail: bool) {
        self.state.fail_advances.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncWatermarkRepository for FakeStore {
    async fn read(
        &self,
        _entity_type: &str,
        _integration: &str,
        floor: Watermark,
    ) -> RelayResult<Watermark> {
        self.state.read_at.lock().unwrap().push(Instant::now());
        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(RelayError::Database("state db down".to_string()));
        }
        Ok(self.stored().unwrap_or(floor))
    }

    async fn advance(
        &self,
        _entity_type: &str,
        _integration: &str,
        watermark: &Watermark,
    ) -> RelayResult<()> {
        if self.state.fail_advances.load(Ordering::SeqCst) {
            return Err(RelayError::Database("disk full".to_string()));
        }
        self.state.advances.lock().unwrap().push(watermark.clone());
        let mut stored = self.state.stored.lock().unwrap();
        if stored.as_ref().map_or(true, |current| watermark > current) {
            *stored = Some(watermark.clone());
        }
        Ok(())
    }

    async fn record_cycle(
        &self,
        _entity_type: &str,
        _integration: &str,
        status: CycleStatus,
        error_message: Option<&str>,
    ) -> RelayResult<()> {
        self.state
            .cycles
            .lock()
            .unwrap()
            .push((status, error_message.map(str::to_string)));
        Ok(())
    }

    async fn get(
        &self,
        _entity_type: &str,
        _integration: &str,
    ) -> RelayResult<Option<SyncWatermark>> {
        Ok(None)
    }
}
