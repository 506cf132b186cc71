use std::sync::Arc;

use chrono::Utc;

use crate::error::{DispatchError, StorageError};
use crate::gatekeeper::Gatekeeper;
use crate::policy::{DelayPolicy, PolicyHandle, DEFAULT_MAX_RETRIES};
use crate::recorder::OutcomeRecorder;
use crate::storage::Storage;
use crate::transport::MailTransport;
use crate::types::{
    ClaimOutcome, DedupKey, DispatchOutcome, DispatchRecord, MailRequest, SkipReason, TraceId,
};
use crate::validator;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Initial delay-policy table, `type1,type2:millis;type3:millis`.
    /// `None` starts with every type undelayed.
    pub delay_table: Option<String>,

    /// Retry ceiling applied to every throttled type.
    pub default_max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            delay_table: None,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Orchestrates one dispatch: claim, validate, send, record.
pub struct Dispatcher {
    config: DispatcherConfig,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn MailTransport>,
    policy: Arc<PolicyHandle>,
    gatekeeper: Gatekeeper,
    recorder: OutcomeRecorder,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        let initial = match config.delay_table.as_deref() {
            Some(table) => DelayPolicy::parse(table, config.default_max_retries),
            None => DelayPolicy::empty(),
        };
        let policy = Arc::new(PolicyHandle::new(initial));
        let gatekeeper = Gatekeeper::new(storage.clone(), policy.clone());
        let recorder = OutcomeRecorder::new(storage.clone());

        Self {
            config,
            storage,
            transport,
            policy,
            gatekeeper,
            recorder,
        }
    }

    /// Replace the delay-policy table wholesale. Hot reload surface; claims
    /// in flight keep the snapshot they already took.
    pub async fn reload_delay_policy(&self, table: &str) {
        let policy = DelayPolicy::parse(table, self.config.default_max_retries);
        tracing::info!(entries = policy.len(), "delay policy reloaded");
        self.policy.replace(policy).await;
    }

    /// Dispatch one request.
    ///
    /// A denied claim returns `Skipped` with no transport call and no outcome
    /// write. Validation failure records a FAILED outcome and raises
    /// `Validation`. Transport failure records the classified outcome and
    /// raises `Transport`. Store failure during the claim raises `Storage`
    /// and nothing is sent.
    pub async fn dispatch(&self, request: MailRequest) -> Result<DispatchOutcome, DispatchError> {
        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(|| TraceId::generate().0);
        let key = request
            .dedup_key
            .clone()
            .map(DedupKey)
            .unwrap_or_else(DedupKey::generate);
        let now = Utc::now();

        tracing::info!(
            %key,
            %trace_id,
            message_type = %request.message_type,
            receiver = %request.receiver,
            "starting dispatch"
        );

        let retry_count =
            match self.gatekeeper.claim(Some(key.clone()), &request.message_type, now).await? {
                ClaimOutcome::Proceed { retry_count, .. } => {
                    metric_inc("mail.claim.proceed");
                    retry_count
                }
                ClaimOutcome::AlreadySent => {
                    metric_inc("mail.claim.already_sent");
                    return Ok(DispatchOutcome::Skipped {
                        key,
                        reason: SkipReason::AlreadySent,
                    });
                }
                ClaimOutcome::DelayActive => {
                    metric_inc("mail.claim.delay_active");
                    return Ok(DispatchOutcome::Skipped {
                        key,
                        reason: SkipReason::DelayActive {
                            message_type: request.message_type.clone(),
                        },
                    });
                }
                ClaimOutcome::Exhausted { attempts } => {
                    metric_inc("mail.claim.exhausted");
                    return Ok(DispatchOutcome::Skipped {
                        key,
                        reason: SkipReason::Exhausted { attempts },
                    });
                }
            };

        let canonical = match validator::validate(&request) {
            Ok(canonical) => canonical,
            Err(errors) => {
                let joined = errors.join(", ");
                tracing::error!(%key, errors = %joined, "request validation failed");
                self.recorder
                    .record_failure(&key, &request, Some(&trace_id), "400", "VALIDATION_ERROR", &joined)
                    .await;
                metric_inc("mail.dispatch.validation_failed");
                return Err(DispatchError::Validation { errors });
            }
        };

        match self.transport.send(&canonical).await {
            Ok(()) => {
                self.recorder
                    .record_success(&key, &canonical, Some(&trace_id))
                    .await;
                metric_inc("mail.dispatch.sent");
                tracing::info!(%key, retry_count, receiver = %canonical.receiver, "mail sent");
                let receiver = canonical.receiver;
                Ok(DispatchOutcome::Sent { key, receiver })
            }
            Err(err) => {
                tracing::error!(%key, error = %err, "transport send failed");
                self.recorder
                    .record_transport_failure(&key, &canonical, Some(&trace_id), &err)
                    .await;
                metric_inc("mail.dispatch.transport_failed");
                Err(DispatchError::Transport(err))
            }
        }
    }

    /// Audit lookup for a key's dispatch record.
    pub async fn record(&self, key: &DedupKey) -> Result<Option<DispatchRecord>, StorageError> {
        self.storage.fetch(key).await
    }
}
