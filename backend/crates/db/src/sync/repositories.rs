use async_trait::async_trait;

use crate::sync::models::{CycleStatus, SyncWatermark, Watermark};
use relay_common::error::RelayResult;

#[async_trait]
pub trait SyncWatermarkRepository: Send + Sync {
    /// Stored cursor for an entity type + integration pair, or `floor` if none
    /// has ever been committed.
    async fn read(
        &self,
        entity_type: &str,
        integration: &str,
        floor: Watermark,
    ) -> RelayResult<Watermark>;

    /// Durably move the cursor forward. Never moves it backwards: a cursor at or
    /// below the stored one leaves the row untouched. An `Err` means the advance
    /// did not happen.
    async fn advance(
        &self,
        entity_type: &str,
        integration: &str,
        watermark: &Watermark,
    ) -> RelayResult<()>;

    /// Record the outcome of the last cycle without touching the cursor.
    async fn record_cycle(
        &self,
        entity_type: &str,
        integration: &str,
        status: CycleStatus,
        error_message: Option<&str>,
    ) -> RelayResult<()>;

    /// Full row, for status display.
    async fn get(&self, entity_type: &str, integration: &str)
        -> RelayResult<Option<SyncWatermark>>;
}
