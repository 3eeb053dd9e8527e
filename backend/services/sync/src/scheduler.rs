use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_common::error::RelayResult;
use relay_config::{CompanyMapping, SyncSettings};
use relay_db::customers::repositories::ChangeFeed;
use relay_db::sync::models::{CycleStatus, Watermark};
use relay_db::sync::repositories::SyncWatermarkRepository;

use crate::connector::TargetConnector;
use crate::error::SyncError;
use crate::reconcile::{Outcome, Reconciler};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub entity_type: String,
    /// Watermark key; one per company mapping.
    pub integration: String,
    pub interval: Duration,
    pub batch_size: i64,
    /// How far back the first cycle looks when no watermark is stored.
    pub lookback: chrono::Duration,
    /// Commit the watermark after this many confirmed records.
    pub advance_every: usize,
    /// Bound on each feed query and each watermark write.
    pub io_timeout: Duration,
}

impl SchedulerConfig {
    pub fn for_mapping(settings: &SyncSettings, integration_name: &str, mapping: &CompanyMapping) -> Self {
        Self {
            entity_type: "customers".to_string(),
            integration: format!(
                "{integration_name}:{}->{}",
                mapping.source_company, mapping.target_company
            ),
            interval: Duration::from_secs(settings.interval_minutes * 60),
            batch_size: settings.batch_size,
            lookback: chrono::Duration::hours(settings.lookback_hours),
            advance_every: settings.advance_every.max(1),
            io_timeout: Duration::from_secs(settings.io_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulerState {
    #[default]
    Idle,
    Running,
    /// Last cycle hit a fatal error. The spawned loop moves back to `Idle` once
    /// the result is published; the error stays in `last_result`.
    Failed,
    /// Parked by [`SchedulerHandle::stop`].
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub code: String,
    pub reason: String,
}

/// Summary of one cycle, suitable for a status display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleResult {
    pub integration: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub seen: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<RecordFailure>,
    /// Watermark committed by this cycle, if it moved.
    pub watermark: Option<Watermark>,
    pub fatal_error: Option<SyncError>,
    pub persistence_error: Option<String>,
    pub cancelled: bool,
}

impl CycleResult {
    fn new(integration: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            integration: integration.to_string(),
            started_at,
            finished_at: started_at,
            seen: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
            watermark: None,
            fatal_error: None,
            persistence_error: None,
            cancelled: false,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.updated
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub last_result: Option<CycleResult>,
    pub cycles_completed: u64,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Watermark commits for one cycle. Staging stops for good after the first
/// failed record, so the committed cursor never passes an unconfirmed record.
struct PendingAdvance {
    staged: Option<Watermark>,
    staged_count: usize,
    every: usize,
    blocked: bool,
    halted: bool,
}

impl PendingAdvance {
    fn new(every: usize) -> Self {
        Self {
            staged: None,
            staged_count: 0,
            every,
            blocked: false,
            halted: false,
        }
    }

    /// Returns `true` when enough records are staged to commit.
    fn stage(&mut self, cursor: Watermark) -> bool {
        if self.blocked || self.halted {
            return false;
        }
        self.staged = Some(cursor);
        self.staged_count += 1;
        self.staged_count >= self.every
    }

    fn block(&mut self) {
        self.blocked = true;
    }

    fn take(&mut self) -> Option<Watermark> {
        self.staged_count = 0;
        if self.halted {
            return None;
        }
        self.staged.take()
    }
}

/// Control surface for a spawned scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    status: watch::Receiver<SchedulerStatus>,
    trigger: mpsc::Sender<()>,
    control: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    #[allow(dead_code)]
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    /// Ask for a cycle now. Returns `false` once the scheduler task has ended.
    /// Ignored while stopped.
    pub fn trigger(&self) -> bool {
        match self.trigger.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    /// Park the scheduler. A running cycle ends after its current record; no
    /// further cycles run until [`SchedulerHandle::start`].
    pub fn stop(&self) {
        self.control.send_replace(false);
    }

    /// Resume a stopped scheduler with an immediate cycle.
    pub fn start(&self) {
        self.control.send_replace(true);
    }

    pub fn is_started(&self) -> bool {
        *self.control.borrow()
    }
}

pub struct SyncScheduler<F, S, C> {
    config: SchedulerConfig,
    feed: F,
    store: S,
    reconciler: Reconciler<C>,
    status: watch::Sender<SchedulerStatus>,
}

impl<F, S, C> SyncScheduler<F, S, C>
where
    F: ChangeFeed,
    S: SyncWatermarkRepository,
    C: TargetConnector,
{
    pub fn new(config: SchedulerConfig, feed: F, store: S, reconciler: Reconciler<C>) -> Self {
        let (status, _) = watch::channel(SchedulerStatus::default());
        Self {
            config,
            feed,
            store,
            reconciler,
            status,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    /// Run one full cycle. Fails only with [`SyncError::AlreadyRunning`]; any
    /// other failure is reported in [`CycleResult::fatal_error`].
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleResult, SyncError> {
        self.try_begin()?;

        let mut result = CycleResult::new(&self.config.integration, Utc::now());
        tracing::info!(integration = %self.config.integration, "sync cycle started");

        if let Err(err) = self.drive(cancel, &mut result).await {
            if err.needs_alert() {
                tracing::error!(
                    alert = true,
                    integration = %self.config.integration,
                    error = %err,
                    "sync cycle aborted, credentials need attention"
                );
            } else {
                tracing::error!(
                    integration = %self.config.integration,
                    error = %err,
                    "sync cycle aborted"
                );
            }
            result.fatal_error = Some(err);
        }
        result.finished_at = Utc::now();

        self.finish(&result).await;
        Ok(result)
    }

    /// Atomic transition to `Running` from any other state.
    fn try_begin(&self) -> Result<(), SyncError> {
        let mut started = false;
        self.status.send_if_modified(|status| {
            if status.state == SchedulerState::Running {
                return false;
            }
            status.state = SchedulerState::Running;
            started = true;
            true
        });

        if started {
            Ok(())
        } else {
            tracing::info!(integration = %self.config.integration, "cycle already running, skipping");
            Err(SyncError::AlreadyRunning)
        }
    }

    async fn finish(&self, result: &CycleResult) {
        let (state, cycle_status) = match result.fatal_error {
            Some(_) => (SchedulerState::Failed, CycleStatus::Failed),
            None => (SchedulerState::Idle, CycleStatus::Idle),
        };

        tracing::info!(
            integration = %result.integration,
            seen = result.seen,
            succeeded = result.succeeded(),
            created = result.created,
            updated = result.updated,
            skipped = result.skipped,
            failed = result.failed,
            watermark = ?result.watermark,
            cancelled = result.cancelled,
            duration_ms = (result.finished_at - result.started_at).num_milliseconds(),
            "sync cycle finished"
        );
        if let Some(first) = result.failures.first() {
            tracing::warn!(
                integration = %result.integration,
                failed = result.failures.len(),
                first_code = %first.code,
                first_reason = %first.reason,
                "watermark held before the first failed record"
            );
        }

        let message = result
            .fatal_error
            .as_ref()
            .map(|e| e.to_string())
            .or_else(|| result.persistence_error.clone());
        let recorded = self
            .bounded(self.store.record_cycle(
                &self.config.entity_type,
                &self.config.integration,
                cycle_status,
                message.as_deref(),
            ))
            .await;
        if let Err(e) = recorded {
            tracing::warn!(error = %e, "failed to record cycle status");
        }

        self.status.send_modify(|status| {
            status.state = state;
            status.last_result = Some(result.clone());
            status.cycles_completed += 1;
        });
    }

    async fn drive(&self, cancel: &CancellationToken, result: &mut CycleResult) -> Result<(), SyncError> {
        let floor = Watermark::floor(Utc::now() - self.config.lookback);
        let committed = self
            .bounded(self.store.read(&self.config.entity_type, &self.config.integration, floor))
            .await
            .map_err(SyncError::Persistence)?;

        tracing::debug!(
            integration = %self.config.integration,
            since = %committed.modified_at,
            code = %committed.code,
            "read watermark"
        );

        let mut pending = PendingAdvance::new(self.config.advance_every);
        let outcome = self.drain(cancel, committed, &mut pending, result).await;
        // Confirmed records are committed even when the cycle aborts.
        self.flush(&mut pending, result).await;
        outcome
    }

    async fn drain(
        &self,
        cancel: &CancellationToken,
        mut cursor: Watermark,
        pending: &mut PendingAdvance,
        result: &mut CycleResult,
    ) -> Result<(), SyncError> {
        loop {
            if cancel.is_cancelled() {
                result.cancelled = true;
                return Ok(());
            }

            let batch = self
                .bounded(self.feed.fetch_changed(&cursor, self.config.batch_size))
                .await
                .map_err(SyncError::SourceUnavailable)?;
            let drained = (batch.len() as i64) < self.config.batch_size;

            for record in &batch {
                if cancel.is_cancelled() {
                    tracing::info!(integration = %self.config.integration, "stop requested, ending cycle");
                    result.cancelled = true;
                    return Ok(());
                }

                result.seen += 1;
                let outcome = self.reconciler.reconcile(record).await?;
                match &outcome {
                    Outcome::Created { remote_id } => {
                        tracing::debug!(code = %record.code, remote_id = %remote_id, "contact created");
                        result.created += 1;
                    }
                    Outcome::Updated { remote_id } => {
                        tracing::debug!(code = %record.code, remote_id = %remote_id, "contact updated");
                        result.updated += 1;
                    }
                    Outcome::Skipped(reason) => {
                        tracing::info!(code = %record.code, reason = %reason, "record skipped");
                        result.skipped += 1;
                    }
                    Outcome::Failed(reason) => {
                        result.failed += 1;
                        result.failures.push(RecordFailure {
                            code: record.code.clone(),
                            reason: reason.clone(),
                        });
                    }
                }

                if outcome.is_failed() {
                    pending.block();
                } else if pending.stage(record.cursor()) {
                    self.flush(pending, result).await;
                }
            }

            match batch.last() {
                Some(last) if !drained => cursor = last.cursor(),
                _ => return Ok(()),
            }
        }
    }

    async fn flush(&self, pending: &mut PendingAdvance, result: &mut CycleResult) {
        let Some(cursor) = pending.take() else {
            return;
        };

        match self
            .bounded(self.store.advance(&self.config.entity_type, &self.config.integration, &cursor))
            .await
        {
            Ok(()) => result.watermark = Some(cursor),
            Err(e) => {
                tracing::error!(
                    integration = %self.config.integration,
                    error = %e,
                    "watermark advance failed, no further advances this cycle"
                );
                pending.halted = true;
                result.persistence_error.get_or_insert(e);
            }
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = RelayResult<T>>) -> Result<T, String> {
        match tokio::time::timeout(self.config.io_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.config.io_timeout)),
        }
    }
}

impl<F, S, C> SyncScheduler<F, S, C>
where
    F: ChangeFeed + 'static,
    S: SyncWatermarkRepository + 'static,
    C: TargetConnector + 'static,
{
    /// Run cycles on a fixed-rate grid (first one immediately) until
    /// `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> (SchedulerHandle, JoinHandle<()>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let control = Arc::new(watch::channel(true).0);
        let handle = SchedulerHandle {
            status: self.status.subscribe(),
            trigger: trigger_tx,
            control: control.clone(),
        };
        let task = tokio::spawn(async move { self.run(shutdown, control, trigger_rx).await });
        (handle, task)
    }

    async fn run(
        self,
        shutdown: CancellationToken,
        control: Arc<watch::Sender<bool>>,
        mut trigger_rx: mpsc::Receiver<()>,
    ) {
        let mut started = control.subscribe();
        let mut next_tick = Instant::now();

        tracing::info!(
            integration = %self.config.integration,
            interval_secs = self.config.interval.as_secs(),
            "scheduler started"
        );

        loop {
            if !*started.borrow_and_update() {
                if !self.park(&shutdown, &mut started, &mut trigger_rx).await {
                    break;
                }
                next_tick = Instant::now();
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = started.changed() => continue,
                _ = tokio::time::sleep_until(next_tick) => {}
                Some(()) = trigger_rx.recv() => {
                    tracing::info!(integration = %self.config.integration, "manual sync triggered");
                }
            }

            let cycle_cancel = shutdown.child_token();
            let cycle = self.run_cycle(&cycle_cancel);
            tokio::pin!(cycle);
            let outcome = tokio::select! {
                outcome = &mut cycle => outcome,
                _ = stop_requested(&mut started) => {
                    tracing::info!(integration = %self.config.integration, "stop requested, ending cycle");
                    cycle_cancel.cancel();
                    cycle.await
                }
            };
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "cycle not started");
            }

            let now = Instant::now();
            next_tick = roll_forward(next_tick, self.config.interval, now);
            let next_run_at = wall_clock(next_tick, now);
            self.status.send_modify(|status| {
                if status.state == SchedulerState::Failed {
                    status.state = SchedulerState::Idle;
                }
                status.next_run_at = Some(next_run_at);
            });
        }

        tracing::info!(integration = %self.config.integration, "scheduler shut down");
    }

    /// Wait out a stop. Returns `false` when shutdown arrives first. Triggers
    /// sent while stopped are dropped.
    async fn park(
        &self,
        shutdown: &CancellationToken,
        started: &mut watch::Receiver<bool>,
        trigger_rx: &mut mpsc::Receiver<()>,
    ) -> bool {
        self.status.send_modify(|status| {
            status.state = SchedulerState::Stopped;
            status.next_run_at = None;
        });
        tracing::info!(integration = %self.config.integration, "scheduler stopped, waiting for start");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = started.changed() => {
                    if *started.borrow_and_update() {
                        break;
                    }
                }
                Some(()) = trigger_rx.recv() => {
                    tracing::info!(integration = %self.config.integration, "trigger ignored while stopped");
                }
            }
        }
        while trigger_rx.try_recv().is_ok() {}

        self.status.send_modify(|status| status.state = SchedulerState::Idle);
        tracing::info!(integration = %self.config.integration, "scheduler resumed");
        true
    }
}

async fn stop_requested(started: &mut watch::Receiver<bool>) {
    let _ = started.wait_for(|on| !*on).await;
}

/// Next point of the `tick + k * interval` grid strictly after `now`. Points
/// already behind `now` are skipped, not fired late.
fn roll_forward(tick: Instant, interval: Duration, now: Instant) -> Instant {
    if interval.is_zero() {
        return now;
    }
    let mut next = tick;
    while next <= now {
        next += interval;
    }
    next
}

fn wall_clock(at: Instant, now: Instant) -> DateTime<Utc> {
    let ahead = chrono::Duration::from_std(at.saturating_duration_since(now))
        .unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() + ahead
}
