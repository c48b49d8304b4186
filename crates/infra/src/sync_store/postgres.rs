//! Postgres sync stores.
//!
//! The watermark lock is a conditional UPDATE with RETURNING, so two
//! concurrent runners cannot both claim a stream. The cursor advance uses
//! `GREATEST(last_modified_on_fetched, $candidate)` which ignores NULLs on
//! either side, making the advance monotone without a read-modify-write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use inflow_core::StagingId;
use inflow_sync::canonical::CrmJob;
use inflow_sync::staging::StagingRecord;
use inflow_sync::store::{CanonicalStore, StagingStore, SyncStoreError, WatermarkStore};
use inflow_sync::watermark::{SyncType, SyncWatermark};

fn storage_err(context: &str, e: impl std::fmt::Display) -> SyncStoreError {
    SyncStoreError::Storage(format!("{context}: {e}"))
}

const WATERMARK_COLUMNS: &str = r#"
    sync_type, last_successful_sync_at, last_modified_on_fetched,
    records_processed, sync_duration_ms, last_error, last_error_at,
    running, run_started_at, updated_at
"#;

fn watermark_from_row(row: &PgRow) -> Result<SyncWatermark, SyncStoreError> {
    let sync_type: String = row
        .try_get("sync_type")
        .map_err(|e| storage_err("sync_type", e))?;

    Ok(SyncWatermark {
        sync_type: SyncType::new(sync_type),
        last_successful_sync_at: row
            .try_get("last_successful_sync_at")
            .map_err(|e| storage_err("last_successful_sync_at", e))?,
        last_modified_on_fetched: row
            .try_get("last_modified_on_fetched")
            .map_err(|e| storage_err("last_modified_on_fetched", e))?,
        records_processed: row
            .try_get::<i64, _>("records_processed")
            .map_err(|e| storage_err("records_processed", e))? as u64,
        sync_duration_ms: row
            .try_get::<Option<i64>, _>("sync_duration_ms")
            .map_err(|e| storage_err("sync_duration_ms", e))?
            .map(|ms| ms as u64),
        last_error: row
            .try_get("last_error")
            .map_err(|e| storage_err("last_error", e))?,
        last_error_at: row
            .try_get("last_error_at")
            .map_err(|e| storage_err("last_error_at", e))?,
        running: row
            .try_get("running")
            .map_err(|e| storage_err("running", e))?,
        run_started_at: row
            .try_get("run_started_at")
            .map_err(|e| storage_err("run_started_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| storage_err("updated_at", e))?,
    })
}

/// Watermark store on the `sync_watermarks` table.
#[derive(Debug, Clone)]
pub struct PostgresWatermarkStore {
    pool: Arc<PgPool>,
}

impl PostgresWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl WatermarkStore for PostgresWatermarkStore {
    async fn get(&self, sync_type: &SyncType) -> Result<Option<SyncWatermark>, SyncStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WATERMARK_COLUMNS} FROM sync_watermarks WHERE sync_type = $1"
        ))
        .bind(sync_type.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage_err("get watermark", e))?;

        row.as_ref().map(watermark_from_row).transpose()
    }

    async fn get_or_create(&self, sync_type: &SyncType) -> Result<SyncWatermark, SyncStoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sync_watermarks (sync_type, updated_at)
            VALUES ($1, now())
            ON CONFLICT (sync_type) DO UPDATE SET sync_type = EXCLUDED.sync_type
            RETURNING {WATERMARK_COLUMNS}
            "#
        ))
        .bind(sync_type.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| storage_err("get_or_create watermark", e))?;

        watermark_from_row(&row)
    }

    async fn try_begin_run(
        &self,
        sync_type: &SyncType,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Option<SyncWatermark>, SyncStoreError> {
        let stale_cutoff = now - chrono::Duration::from_std(stale_after).unwrap_or_default();

        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_watermarks
            SET running = TRUE, run_started_at = $2, updated_at = $2
            WHERE sync_type = $1
              AND (running = FALSE OR run_started_at IS NULL OR run_started_at < $3)
            RETURNING {WATERMARK_COLUMNS}
            "#
        ))
        .bind(sync_type.as_str())
        .bind(now)
        .bind(stale_cutoff)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage_err("try_begin_run", e))?;

        row.as_ref().map(watermark_from_row).transpose()
    }

    async fn complete_run(
        &self,
        sync_type: &SyncType,
        candidate: Option<DateTime<Utc>>,
        records_processed: u64,
        duration: Duration,
    ) -> Result<(), SyncStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_watermarks
            SET last_modified_on_fetched = GREATEST(last_modified_on_fetched, $2),
                last_successful_sync_at = now(),
                records_processed = $3,
                sync_duration_ms = $4,
                last_error = NULL,
                running = FALSE,
                run_started_at = NULL,
                updated_at = now()
            WHERE sync_type = $1
            "#,
        )
        .bind(sync_type.as_str())
        .bind(candidate)
        .bind(records_processed as i64)
        .bind(duration.as_millis() as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_err("complete_run", e))?;

        if result.rows_affected() == 0 {
            return Err(SyncStoreError::NotFound(sync_type.to_string()));
        }
        Ok(())
    }

    async fn fail_run(&self, sync_type: &SyncType, error: &str) -> Result<(), SyncStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_watermarks
            SET last_error = $2,
                last_error_at = now(),
                running = FALSE,
                run_started_at = NULL,
                updated_at = now()
            WHERE sync_type = $1
            "#,
        )
        .bind(sync_type.as_str())
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_err("fail_run", e))?;

        if result.rows_affected() == 0 {
            return Err(SyncStoreError::NotFound(sync_type.to_string()));
        }
        Ok(())
    }
}

fn staging_from_row(row: &PgRow) -> Result<StagingRecord, SyncStoreError> {
    Ok(StagingRecord {
        id: StagingId::from_uuid(row.try_get("id").map_err(|e| storage_err("id", e))?),
        external_id: row
            .try_get("external_id")
            .map_err(|e| storage_err("external_id", e))?,
        raw_data: row
            .try_get("raw_data")
            .map_err(|e| storage_err("raw_data", e))?,
        fetched_at: row
            .try_get("fetched_at")
            .map_err(|e| storage_err("fetched_at", e))?,
        processed_at: row
            .try_get("processed_at")
            .map_err(|e| storage_err("processed_at", e))?,
        processing_error: row
            .try_get("processing_error")
            .map_err(|e| storage_err("processing_error", e))?,
    })
}

/// Staging store on the `crm_jobs_staging` table.
#[derive(Debug, Clone)]
pub struct PostgresStagingStore {
    pool: Arc<PgPool>,
}

impl PostgresStagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl StagingStore for PostgresStagingStore {
    async fn stage(&self, records: Vec<StagingRecord>) -> Result<(), SyncStoreError> {
        if records.is_empty() {
            return Ok(());
        }

        // One transaction per staged page; a crashed fetch leaves no
        // half-written page behind.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("begin stage tx", e))?;

        for record in &records {
            sqlx::query(
                r#"
                INSERT INTO crm_jobs_staging
                    (id, external_id, raw_data, fetched_at, processed_at, processing_error)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(&record.external_id)
            .bind(&record.raw_data)
            .bind(record.fetched_at)
            .bind(record.processed_at)
            .bind(&record.processing_error)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("stage insert", e))?;
        }

        tx.commit().await.map_err(|e| storage_err("commit stage tx", e))
    }

    async fn list_unprocessed(&self, limit: usize) -> Result<Vec<StagingRecord>, SyncStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, raw_data, fetched_at, processed_at, processing_error
            FROM crm_jobs_staging
            WHERE processed_at IS NULL AND processing_error IS NULL
            ORDER BY fetched_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage_err("list_unprocessed", e))?;

        rows.iter().map(staging_from_row).collect()
    }

    async fn mark_processed(
        &self,
        id: StagingId,
        at: DateTime<Utc>,
    ) -> Result<(), SyncStoreError> {
        let result = sqlx::query("UPDATE crm_jobs_staging SET processed_at = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| storage_err("mark_processed", e))?;

        if result.rows_affected() == 0 {
            return Err(SyncStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_error(&self, id: StagingId, error: &str) -> Result<(), SyncStoreError> {
        let result =
            sqlx::query("UPDATE crm_jobs_staging SET processing_error = $2 WHERE id = $1")
                .bind(id.as_uuid())
                .bind(error)
                .execute(&*self.pool)
                .await
                .map_err(|e| storage_err("mark_error", e))?;

        if result.rows_affected() == 0 {
            return Err(SyncStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Canonical store on the `crm_jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresCanonicalStore {
    pool: Arc<PgPool>,
}

impl PostgresCanonicalStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<CrmJob, SyncStoreError> {
    Ok(CrmJob {
        external_id: row
            .try_get("external_id")
            .map_err(|e| storage_err("external_id", e))?,
        title: row.try_get("title").map_err(|e| storage_err("title", e))?,
        status: row
            .try_get("status")
            .map_err(|e| storage_err("status", e))?,
        customer_email: row
            .try_get("customer_email")
            .map_err(|e| storage_err("customer_email", e))?,
        scheduled_for: row
            .try_get("scheduled_for")
            .map_err(|e| storage_err("scheduled_for", e))?,
        modified_on: row
            .try_get("modified_on")
            .map_err(|e| storage_err("modified_on", e))?,
        synced_at: row
            .try_get("synced_at")
            .map_err(|e| storage_err("synced_at", e))?,
    })
}

#[async_trait]
impl CanonicalStore for PostgresCanonicalStore {
    async fn upsert(&self, job: &CrmJob) -> Result<(), SyncStoreError> {
        sqlx::query(
            r#"
            INSERT INTO crm_jobs
                (external_id, title, status, customer_email, scheduled_for, modified_on, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_id) DO UPDATE SET
                title = EXCLUDED.title,
                status = EXCLUDED.status,
                customer_email = EXCLUDED.customer_email,
                scheduled_for = EXCLUDED.scheduled_for,
                modified_on = EXCLUDED.modified_on,
                synced_at = EXCLUDED.synced_at
            "#,
        )
        .bind(&job.external_id)
        .bind(&job.title)
        .bind(&job.status)
        .bind(&job.customer_email)
        .bind(job.scheduled_for)
        .bind(job.modified_on)
        .bind(job.synced_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_err("upsert crm job", e))?;

        Ok(())
    }

    async fn get(&self, external_id: &str) -> Result<Option<CrmJob>, SyncStoreError> {
        let row = sqlx::query(
            r#"
            SELECT external_id, title, status, customer_email, scheduled_for, modified_on, synced_at
            FROM crm_jobs WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage_err("get crm job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn count(&self) -> Result<u64, SyncStoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM crm_jobs")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| storage_err("count crm jobs", e))?;

        let n: i64 = row.try_get("n").map_err(|e| storage_err("count", e))?;
        Ok(n as u64)
    }
}
