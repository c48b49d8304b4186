//! Postgres-backed failure queue.
//!
//! The claim is a conditional UPDATE over a `FOR UPDATE SKIP LOCKED`
//! subselect: two scheduler instances racing on the same pending record
//! cannot both win, and neither blocks the other. This is the mutual
//! exclusion the whole retry pipeline depends on — it is deliberately a
//! single statement, never a read-then-write pair.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use sqlx::postgres::PgRow;

use inflow_core::FailureId;
use inflow_webhooks::failure::{FailureStatus, WebhookFailureRecord};
use inflow_webhooks::store::{FailureQueueError, FailureQueueStore, QueueStats};

const RECORD_COLUMNS: &str = r#"
    id, source, event_name, raw_payload, headers, signature,
    attempt_count, max_attempts, next_retry_at, last_attempt_at,
    last_error, status, received_at, processed_at, moved_to_dead_letter_at
"#;

/// Failure queue on the `webhook_failures` table.
#[derive(Debug, Clone)]
pub struct PostgresFailureQueue {
    pool: Arc<PgPool>,
}

impl PostgresFailureQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> FailureQueueError {
    FailureQueueError::Storage(format!("{context}: {e}"))
}

fn record_from_row(row: &PgRow) -> Result<WebhookFailureRecord, FailureQueueError> {
    let source: String = row
        .try_get("source")
        .map_err(|e| storage_err("source", e))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| storage_err("status", e))?;
    let headers: serde_json::Value = row
        .try_get("headers")
        .map_err(|e| storage_err("headers", e))?;

    Ok(WebhookFailureRecord {
        id: FailureId::from_uuid(row.try_get("id").map_err(|e| storage_err("id", e))?),
        source: source
            .parse()
            .map_err(|e: String| FailureQueueError::Storage(e))?,
        event_name: row
            .try_get("event_name")
            .map_err(|e| storage_err("event_name", e))?,
        raw_payload: row
            .try_get("raw_payload")
            .map_err(|e| storage_err("raw_payload", e))?,
        headers: serde_json::from_value(headers)
            .map_err(|e| storage_err("headers shape", e))?,
        signature: row
            .try_get("signature")
            .map_err(|e| storage_err("signature", e))?,
        attempt_count: row
            .try_get::<i32, _>("attempt_count")
            .map_err(|e| storage_err("attempt_count", e))? as u32,
        max_attempts: row
            .try_get::<i32, _>("max_attempts")
            .map_err(|e| storage_err("max_attempts", e))? as u32,
        next_retry_at: row
            .try_get("next_retry_at")
            .map_err(|e| storage_err("next_retry_at", e))?,
        last_attempt_at: row
            .try_get("last_attempt_at")
            .map_err(|e| storage_err("last_attempt_at", e))?,
        last_error: row
            .try_get("last_error")
            .map_err(|e| storage_err("last_error", e))?,
        status: FailureStatus::from_str(&status).map_err(FailureQueueError::Storage)?,
        received_at: row
            .try_get("received_at")
            .map_err(|e| storage_err("received_at", e))?,
        processed_at: row
            .try_get("processed_at")
            .map_err(|e| storage_err("processed_at", e))?,
        moved_to_dead_letter_at: row
            .try_get("moved_to_dead_letter_at")
            .map_err(|e| storage_err("moved_to_dead_letter_at", e))?,
    })
}

#[async_trait]
impl FailureQueueStore for PostgresFailureQueue {
    async fn enqueue(&self, record: WebhookFailureRecord) -> Result<FailureId, FailureQueueError> {
        let headers = serde_json::to_value(&record.headers)
            .map_err(|e| storage_err("serialize headers", e))?;

        sqlx::query(
            r#"
            INSERT INTO webhook_failures (
                id, source, event_name, raw_payload, headers, signature,
                attempt_count, max_attempts, next_retry_at, last_attempt_at,
                last_error, status, received_at, processed_at, moved_to_dead_letter_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.source.as_str())
        .bind(&record.event_name)
        .bind(&record.raw_payload)
        .bind(headers)
        .bind(&record.signature)
        .bind(record.attempt_count as i32)
        .bind(record.max_attempts as i32)
        .bind(record.next_retry_at)
        .bind(record.last_attempt_at)
        .bind(&record.last_error)
        .bind(record.status.as_str())
        .bind(record.received_at)
        .bind(record.processed_at)
        .bind(record.moved_to_dead_letter_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_err("enqueue", e))?;

        Ok(record.id)
    }

    async fn get(&self, id: FailureId) -> Result<Option<WebhookFailureRecord>, FailureQueueError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM webhook_failures WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage_err("get", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookFailureRecord>, FailureQueueError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE webhook_failures
            SET status = 'processing', last_attempt_at = $1
            WHERE id IN (
                SELECT id FROM webhook_failures
                WHERE status = 'pending' AND next_retry_at <= $1
                ORDER BY next_retry_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage_err("claim_due", e))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn update(&self, record: &WebhookFailureRecord) -> Result<(), FailureQueueError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_failures
            SET attempt_count = $2,
                next_retry_at = $3,
                last_attempt_at = $4,
                last_error = $5,
                status = $6,
                processed_at = $7,
                moved_to_dead_letter_at = $8
            WHERE id = $1
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.attempt_count as i32)
        .bind(record.next_retry_at)
        .bind(record.last_attempt_at)
        .bind(&record.last_error)
        .bind(record.status.as_str())
        .bind(record.processed_at)
        .bind(record.moved_to_dead_letter_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_err("update", e))?;

        if result.rows_affected() == 0 {
            return Err(FailureQueueError::NotFound(record.id));
        }
        Ok(())
    }

    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        stall_after: Duration,
    ) -> Result<u64, FailureQueueError> {
        let cutoff = now - chrono::Duration::from_std(stall_after).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE webhook_failures
            SET status = 'pending', next_retry_at = $1
            WHERE status = 'processing'
              AND last_attempt_at IS NOT NULL
              AND last_attempt_at < $2
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_err("recover_stalled", e))?;

        Ok(result.rows_affected())
    }

    async fn list_by_status(
        &self,
        status: Option<FailureStatus>,
        limit: usize,
    ) -> Result<Vec<WebhookFailureRecord>, FailureQueueError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM webhook_failures
            WHERE $1::text IS NULL OR status = $1
            ORDER BY received_at DESC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage_err("list_by_status", e))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn retry_dead_letter(
        &self,
        id: FailureId,
    ) -> Result<WebhookFailureRecord, FailureQueueError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE webhook_failures
            SET status = 'pending',
                attempt_count = 0,
                next_retry_at = $2,
                last_error = NULL,
                moved_to_dead_letter_at = NULL
            WHERE id = $1 AND status = 'dead_letter'
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage_err("retry_dead_letter", e))?;

        match row {
            Some(row) => record_from_row(&row),
            None => {
                // Distinguish "absent" from "present but not dead-lettered".
                match self.get(id).await? {
                    Some(_) => Err(FailureQueueError::NotDeadLettered(id)),
                    None => Err(FailureQueueError::NotFound(id)),
                }
            }
        }
    }

    async fn stats(&self) -> Result<QueueStats, FailureQueueError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM webhook_failures GROUP BY status",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage_err("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| storage_err("status", e))?;
            let n: i64 = row.try_get("n").map_err(|e| storage_err("count", e))?;
            match FailureStatus::from_str(&status) {
                Ok(FailureStatus::Pending) => stats.pending = n as u64,
                Ok(FailureStatus::Processing) => stats.processing = n as u64,
                Ok(FailureStatus::Succeeded) => stats.succeeded = n as u64,
                Ok(FailureStatus::DeadLetter) => stats.dead_letter = n as u64,
                Err(_) => {}
            }
        }
        Ok(stats)
    }
}
