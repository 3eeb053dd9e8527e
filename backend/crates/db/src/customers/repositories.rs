use async_trait::async_trait;

use crate::customers::models::SourceRecord;
use crate::sync::models::Watermark;
use relay_common::error::RelayResult;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Records strictly after `since`, ascending by `(modified_at, code)`, at most
    /// `limit` of them. A short page means the change window is drained.
    async fn fetch_changed(&self, since: &Watermark, limit: i64) -> RelayResult<Vec<SourceRecord>>;
}
