use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tokio_postgres::Client;

use crate::error::StorageError;
use crate::policy::DelayRule;
use crate::storage::{OutcomeWrite, Storage};
use crate::types::{ClaimOutcome, DedupKey, DispatchRecord, DispatchStatus};

/// PostgreSQL-backed storage.
///
/// The claim runs inside a single transaction: the row is created if absent,
/// then locked with `SELECT ... FOR UPDATE`, so concurrent claims for one key
/// serialize on the row lock while claims for different keys proceed in
/// parallel. Claims from different processes serialize the same way.
pub struct PostgresStorage {
    client: Mutex<Client>,
}

impl PostgresStorage {
    pub async fn new(client: Client) -> Result<Self, StorageError> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS dispatch_log (
                    dedup_key TEXT PRIMARY KEY,
                    message_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    retry_count BIGINT NOT NULL DEFAULT 0,
                    created_at TIMESTAMPTZ NOT NULL,
                    last_attempt_at TIMESTAMPTZ,
                    last_success_at TIMESTAMPTZ,
                    request_snapshot JSONB,
                    http_code TEXT,
                    error_code TEXT,
                    error_message TEXT,
                    trace_id TEXT
                )",
                &[],
            )
            .await?;

        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn claim(
        &self,
        key: &DedupKey,
        message_type: &str,
        now: DateTime<Utc>,
        rule: Option<DelayRule>,
    ) -> Result<ClaimOutcome, StorageError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        // The row must exist before FOR UPDATE so racing first claims
        // serialize on it.
        tx.execute(
            "INSERT INTO dispatch_log (dedup_key, message_type, status, retry_count, created_at)
             VALUES ($1, $2, 'PENDING', 0, $3)
             ON CONFLICT (dedup_key) DO NOTHING",
            &[&key.0, &message_type, &now],
        )
        .await?;

        let row = tx
            .query_one(
                "SELECT status, retry_count, last_attempt_at
                 FROM dispatch_log WHERE dedup_key = $1 FOR UPDATE",
                &[&key.0],
            )
            .await?;

        let status: String = row.try_get(0)?;
        let retry_count: i64 = row.try_get(1)?;
        let last_attempt_at: Option<DateTime<Utc>> = row.try_get(2)?;

        if status == DispatchStatus::Success.as_str() {
            tx.commit().await?;
            return Ok(ClaimOutcome::AlreadySent);
        }

        let outcome = match rule {
            None => {
                tx.execute(
                    "UPDATE dispatch_log SET status = 'PENDING' WHERE dedup_key = $1",
                    &[&key.0],
                )
                .await?;
                ClaimOutcome::Proceed {
                    key: key.clone(),
                    retry_count: 0,
                }
            }
            Some(rule) => {
                let delay_open = last_attempt_at.is_some_and(|last| {
                    now < last + Duration::milliseconds(rule.delay_millis)
                });
                if delay_open {
                    ClaimOutcome::DelayActive
                } else if retry_count >= i64::from(rule.max_retries) {
                    tx.execute(
                        "UPDATE dispatch_log SET status = 'FAILED' WHERE dedup_key = $1",
                        &[&key.0],
                    )
                    .await?;
                    ClaimOutcome::Exhausted {
                        attempts: saturating_u32(retry_count),
                    }
                } else {
                    tx.execute(
                        "UPDATE dispatch_log
                         SET status = 'PENDING', retry_count = retry_count + 1, last_attempt_at = $2
                         WHERE dedup_key = $1",
                        &[&key.0, &now],
                    )
                    .await?;
                    ClaimOutcome::Proceed {
                        key: key.clone(),
                        retry_count: saturating_u32(retry_count + 1),
                    }
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn record_outcome(
        &self,
        key: &DedupKey,
        write: &OutcomeWrite,
    ) -> Result<(), StorageError> {
        let last_success_at = if write.status == DispatchStatus::Success {
            Some(write.now)
        } else {
            None
        };

        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO dispatch_log
                   (dedup_key, message_type, status, retry_count, created_at, last_success_at,
                    request_snapshot, http_code, error_code, error_message, trace_id)
                 VALUES ($1, $2, $3, 0, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (dedup_key) DO UPDATE SET
                   message_type = EXCLUDED.message_type,
                   status = EXCLUDED.status,
                   last_success_at = COALESCE(EXCLUDED.last_success_at, dispatch_log.last_success_at),
                   request_snapshot = EXCLUDED.request_snapshot,
                   http_code = EXCLUDED.http_code,
                   error_code = EXCLUDED.error_code,
                   error_message = EXCLUDED.error_message,
                   trace_id = EXCLUDED.trace_id",
                &[
                    &key.0,
                    &write.message_type,
                    &write.status.as_str(),
                    &write.now,
                    &last_success_at,
                    &write.request_snapshot,
                    &write.http_code,
                    &write.error_code,
                    &write.error_message,
                    &write.trace_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn fetch(&self, key: &DedupKey) -> Result<Option<DispatchRecord>, StorageError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT message_type, status, retry_count, created_at, last_attempt_at,
                        last_success_at, request_snapshot, http_code, error_code, error_message,
                        trace_id
                 FROM dispatch_log WHERE dedup_key = $1",
                &[&key.0],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_text: String = row.try_get(1)?;
        let status = DispatchStatus::parse(&status_text)
            .ok_or_else(|| StorageError::Backend(format!("unknown status: {status_text}")))?;
        let retry_count: i64 = row.try_get(2)?;

        Ok(Some(DispatchRecord {
            dedup_key: key.clone(),
            message_type: row.try_get(0)?,
            status,
            retry_count: saturating_u32(retry_count),
            created_at: row.try_get(3)?,
            last_attempt_at: row.try_get(4)?,
            last_success_at: row.try_get(5)?,
            request_snapshot: row.try_get(6)?,
            http_code: row.try_get(7)?,
            error_code: row.try_get(8)?,
            error_message: row.try_get(9)?,
            trace_id: row.try_get(10)?,
        }))
    }
}

fn saturating_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
