use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::sync::models::{CycleStatus, SyncWatermark, Watermark};
use crate::sync::repositories::SyncWatermarkRepository;
use relay_common::error::{RelayError, RelayResult};

#[derive(Clone)]
pub struct PgSyncRepository {
    pool: PgPool,
}

impl PgSyncRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `sync_watermarks` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> RelayResult<()> {
        sqlx::query(
            "create table if not exists sync_watermarks (
               id uuid primary key,
               entity_type text not null,
               integration text not null,
               last_modified_at timestamptz,
               cursor_value text,
               status text not null default 'idle',
               error_message text,
               created_at timestamptz not null default now(),
               updated_at timestamptz not null default now(),
               unique (entity_type, integration)
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(())
    }

    fn map_row(row: sqlx::postgres::PgRow) -> SyncWatermark {
        SyncWatermark {
            entity_type: row.get("entity_type"),
            integration: row.get("integration"),
            last_modified_at: row.get("last_modified_at"),
            cursor_value: row.get("cursor_value"),
            status: row.get("status"),
            error_message: row.get("error_message"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl SyncWatermarkRepository for PgSyncRepository {
    async fn read(
        &self,
        entity_type: &str,
        integration: &str,
        floor: Watermark,
    ) -> RelayResult<Watermark> {
        let stored = self.get(entity_type, integration).await?;
        Ok(stored.and_then(|wm| wm.cursor()).unwrap_or(floor))
    }

    async fn advance(
        &self,
        entity_type: &str,
        integration: &str,
        watermark: &Watermark,
    ) -> RelayResult<()> {
        // The where clause keeps the stored cursor monotonic; "C" collation matches
        // the byte order the change feed sorts codes by.
        sqlx::query(
            "insert into sync_watermarks (id, entity_type, integration, last_modified_at, cursor_value, updated_at)
             values ($1, $2, $3, $4, $5, $6)
             on conflict (entity_type, integration) do update
             set last_modified_at = excluded.last_modified_at,
                 cursor_value = excluded.cursor_value,
                 updated_at = excluded.updated_at
             where sync_watermarks.last_modified_at is null
                or (sync_watermarks.last_modified_at, coalesce(sync_watermarks.cursor_value, '') collate \"C\")
                   < (excluded.last_modified_at, excluded.cursor_value collate \"C\")",
        )
        .bind(Uuid::new_v4())
        .bind(entity_type)
        .bind(integration)
        .bind(watermark.modified_at)
        .bind(&watermark.code)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(())
    }

    async fn record_cycle(
        &self,
        entity_type: &str,
        integration: &str,
        status: CycleStatus,
        error_message: Option<&str>,
    ) -> RelayResult<()> {
        sqlx::query(
            "insert into sync_watermarks (id, entity_type, integration, status, error_message, updated_at)
             values ($1, $2, $3, $4, $5, $6)
             on conflict (entity_type, integration) do update
             set status = excluded.status,
                 error_message = excluded.error_message,
                 updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(entity_type)
        .bind(integration)
        .bind(status.as_str())
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get(
        &self,
        entity_type: &str,
        integration: &str,
    ) -> RelayResult<Option<SyncWatermark>> {
        let row = sqlx::query(
            "select entity_type, integration, last_modified_at, cursor_value, status, error_message, updated_at
             from sync_watermarks
             where entity_type = $1 and integration = $2",
        )
        .bind(entity_type)
        .bind(integration)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(row.map(Self::map_row))
    }
}
