use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::policy::PolicyHandle;
use crate::storage::Storage;
use crate::types::{ClaimOutcome, DedupKey};

/// Grants or denies permission to attempt a send, atomically per dedup key.
///
/// The gatekeeper resolves the delay policy for the type and hands the
/// decision to the storage backend, which runs it under its isolation
/// primitive. Store failure here is fatal to the request: a send must never
/// proceed without a successful claim.
pub struct Gatekeeper {
    storage: Arc<dyn Storage>,
    policy: Arc<PolicyHandle>,
}

impl Gatekeeper {
    pub fn new(storage: Arc<dyn Storage>, policy: Arc<PolicyHandle>) -> Self {
        Self { storage, policy }
    }

    /// Run the claim protocol. Generates a fresh key when the caller
    /// supplied none; the granted key comes back in `Proceed`.
    pub async fn claim(
        &self,
        key: Option<DedupKey>,
        message_type: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StorageError> {
        let key = key.unwrap_or_else(|| {
            let generated = DedupKey::generate();
            tracing::debug!(key = %generated, "generated dedup key");
            generated
        });

        let policy = self.policy.snapshot().await;
        let rule = policy.rule(message_type);
        match rule {
            Some(rule) => tracing::debug!(
                %key,
                message_type,
                delay_millis = rule.delay_millis,
                max_retries = rule.max_retries,
                "claim on delayed path"
            ),
            None => tracing::debug!(%key, message_type, "claim on undelayed path"),
        }

        let outcome = self.storage.claim(&key, message_type, now, rule).await?;
        match &outcome {
            ClaimOutcome::Proceed { retry_count, .. } => {
                tracing::debug!(%key, retry_count, "claim granted");
            }
            ClaimOutcome::AlreadySent => {
                tracing::debug!(%key, "claim denied, already sent");
            }
            ClaimOutcome::DelayActive => {
                tracing::debug!(%key, message_type, "claim denied, delay window still open");
            }
            ClaimOutcome::Exhausted { attempts } => {
                tracing::debug!(%key, attempts, "claim denied, retry ceiling reached");
            }
        }
        Ok(outcome)
    }
}
