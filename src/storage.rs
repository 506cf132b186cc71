use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::policy::DelayRule;
use crate::types::{ClaimOutcome, DedupKey, DispatchRecord, DispatchStatus};

/// Terminal-state write applied by the outcome recorder.
#[derive(Debug, Clone)]
pub struct OutcomeWrite {
    pub message_type: String,
    pub status: DispatchStatus,
    pub request_snapshot: Option<serde_json::Value>,
    pub trace_id: Option<String>,
    pub http_code: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub now: DateTime<Utc>,
}

/// Persistence contract for dispatch records.
///
/// `claim` is the heart of it: the whole read-decide-write sequence for a key
/// must execute under the store's isolation primitive, because the service
/// may be horizontally scaled and an in-memory lock cannot serialize claims
/// across processes. Two concurrent claims for one key must serialize so that
/// only one observes the pre-update state and wins `Proceed`. Claims for
/// different keys proceed in parallel.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Run the atomic claim protocol for `key`.
    ///
    /// With `rule == None` (undelayed type): SUCCESS means `AlreadySent`,
    /// anything else creates-or-updates the record to PENDING and proceeds
    /// with `retry_count = 0`.
    ///
    /// With a rule: SUCCESS means `AlreadySent`; an open delay window means
    /// `DelayActive` without touching the record; a reached retry ceiling
    /// marks the record FAILED and returns `Exhausted`; otherwise the retry
    /// count increments, `last_attempt_at` is set to `now`, the status
    /// becomes PENDING and the claim proceeds.
    async fn claim(
        &self,
        key: &DedupKey,
        message_type: &str,
        now: DateTime<Utc>,
        rule: Option<DelayRule>,
    ) -> Result<ClaimOutcome, StorageError>;

    /// Persist a terminal outcome, creating the record defensively when it is
    /// missing. A success write must not disturb `retry_count`.
    async fn record_outcome(&self, key: &DedupKey, write: &OutcomeWrite)
        -> Result<(), StorageError>;

    /// Audit lookup.
    async fn fetch(&self, key: &DedupKey) -> Result<Option<DispatchRecord>, StorageError>;
}

/// In-memory storage for tests and single-process deployments.
///
/// One mutex over the whole record map: every claim holds it for the full
/// read-decide-write, which is a stronger serialization than the per-key
/// contract requires.
#[derive(Default)]
pub struct InMemoryStorage {
    records: Mutex<HashMap<DedupKey, DispatchRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn claim(
        &self,
        key: &DedupKey,
        message_type: &str,
        now: DateTime<Utc>,
        rule: Option<DelayRule>,
    ) -> Result<ClaimOutcome, StorageError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(key.clone())
            .or_insert_with(|| DispatchRecord::new(key.clone(), message_type, now));

        if record.status == DispatchStatus::Success {
            return Ok(ClaimOutcome::AlreadySent);
        }

        let Some(rule) = rule else {
            record.status = DispatchStatus::Pending;
            return Ok(ClaimOutcome::Proceed {
                key: key.clone(),
                retry_count: 0,
            });
        };

        if let Some(last_attempt) = record.last_attempt_at {
            let delay_until = last_attempt + Duration::milliseconds(rule.delay_millis);
            if now < delay_until {
                return Ok(ClaimOutcome::DelayActive);
            }
        }

        if record.retry_count >= rule.max_retries {
            record.status = DispatchStatus::Failed;
            return Ok(ClaimOutcome::Exhausted {
                attempts: record.retry_count,
            });
        }

        record.retry_count += 1;
        record.last_attempt_at = Some(now);
        record.status = DispatchStatus::Pending;
        Ok(ClaimOutcome::Proceed {
            key: key.clone(),
            retry_count: record.retry_count,
        })
    }

    async fn record_outcome(
        &self,
        key: &DedupKey,
        write: &OutcomeWrite,
    ) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        if !records.contains_key(key) {
            tracing::warn!(%key, "no record found for outcome write, creating one");
        }
        let record = records
            .entry(key.clone())
            .or_insert_with(|| DispatchRecord::new(key.clone(), write.message_type.as_str(), write.now));

        record.status = write.status;
        record.message_type = write.message_type.clone();
        record.request_snapshot = write.request_snapshot.clone();
        record.trace_id = write.trace_id.clone();
        record.http_code = write.http_code.clone();
        record.error_code = write.error_code.clone();
        record.error_message = write.error_message.clone();
        if write.status == DispatchStatus::Success {
            record.last_success_at = Some(write.now);
        }
        Ok(())
    }

    async fn fetch(&self, key: &DedupKey) -> Result<Option<DispatchRecord>, StorageError> {
        let records = self.records.lock().await;
        Ok(records.get(key).cloned())
    }
}
