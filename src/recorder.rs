//! Terminal-state persistence: success/failure classification and error-text
//! truncation.
//!
//! Everything here is best-effort. A lost audit write must never lose a
//! successfully-sent message's success response, so persistence failures are
//! logged and swallowed instead of propagated.

use std::sync::Arc;

use chrono::Utc;

use crate::storage::{OutcomeWrite, Storage};
use crate::transport::{TransportError, TransportErrorKind};
use crate::types::{DedupKey, DispatchStatus, MailRequest};

const MAX_ERROR_LENGTH: usize = 500;
const HEAD_LENGTH: usize = 300;
const TRUNCATION_MARKER: &str = "... [truncated] ...";
const CAUSE_MARKER: &str = "Caused by:";
const CAUSE_MIN_DISTANCE_FROM_END: usize = 100;
const CAUSE_TAIL_LENGTH: usize = 200;

/// Substrings marking a timeout/connectivity failure, matched
/// case-insensitively against the error message and every cause.
const TIMEOUT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "no route to host",
];

pub struct OutcomeRecorder {
    storage: Arc<dyn Storage>,
}

impl OutcomeRecorder {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Mark the key's record SUCCESS with the snapshot and trace id.
    pub async fn record_success(
        &self,
        key: &DedupKey,
        request: &MailRequest,
        trace_id: Option<&str>,
    ) {
        let write = OutcomeWrite {
            message_type: request.message_type.clone(),
            status: DispatchStatus::Success,
            request_snapshot: snapshot(request),
            trace_id: trace_id.map(str::to_string),
            http_code: None,
            error_code: None,
            error_message: None,
            now: Utc::now(),
        };
        self.persist(key, &write).await;
    }

    /// Record a failure from pre-rendered error text.
    ///
    /// Classified TIMEOUT when the text carries a timeout/connectivity
    /// signature, FAILED otherwise. The text is truncated before storage.
    pub async fn record_failure(
        &self,
        key: &DedupKey,
        request: &MailRequest,
        trace_id: Option<&str>,
        http_code: &str,
        error_code: &str,
        raw_message: &str,
    ) {
        let status = if matches_timeout_signature(raw_message) {
            DispatchStatus::Timeout
        } else {
            DispatchStatus::Failed
        };
        self.persist_failure(key, request, trace_id, http_code, error_code, raw_message, status)
            .await;
    }

    /// Record a transport failure, classifying from the live error chain:
    /// a `Timeout` kind or a signature match anywhere in the chain means
    /// TIMEOUT.
    pub async fn record_transport_failure(
        &self,
        key: &DedupKey,
        request: &MailRequest,
        trace_id: Option<&str>,
        error: &TransportError,
    ) {
        let status = if is_timeout_error(error) {
            DispatchStatus::Timeout
        } else {
            DispatchStatus::Failed
        };
        let message = full_message(error);
        self.persist_failure(key, request, trace_id, "500", "SEND_ERROR", &message, status)
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_failure(
        &self,
        key: &DedupKey,
        request: &MailRequest,
        trace_id: Option<&str>,
        http_code: &str,
        error_code: &str,
        raw_message: &str,
        status: DispatchStatus,
    ) {
        let write = OutcomeWrite {
            message_type: request.message_type.clone(),
            status,
            request_snapshot: snapshot(request),
            trace_id: trace_id.map(str::to_string),
            http_code: Some(http_code.to_string()),
            error_code: Some(error_code.to_string()),
            error_message: Some(truncate_error_message(raw_message)),
            now: Utc::now(),
        };
        self.persist(key, &write).await;
    }

    async fn persist(&self, key: &DedupKey, write: &OutcomeWrite) {
        if let Err(err) = self.storage.record_outcome(key, write).await {
            tracing::error!(%key, status = %write.status, error = %err, "failed to persist outcome");
        }
    }
}

/// Does the text carry a timeout/connectivity signature?
pub fn matches_timeout_signature(message: &str) -> bool {
    let lower = message.to_lowercase();
    TIMEOUT_SIGNATURES
        .iter()
        .any(|signature| lower.contains(signature))
}

/// Walk the transport error and its cause chain for a timeout signal.
pub fn is_timeout_error(error: &TransportError) -> bool {
    if error.kind == TransportErrorKind::Timeout {
        return true;
    }
    if matches_timeout_signature(&error.message) {
        return true;
    }
    let mut cause = std::error::Error::source(error);
    while let Some(err) = cause {
        if matches_timeout_signature(&err.to_string()) {
            return true;
        }
        cause = err.source();
    }
    false
}

/// Render the error with its cause chain, one `Caused by:` segment per
/// cause, so the deepest cause survives truncation.
fn full_message(error: &TransportError) -> String {
    let mut message = error.to_string();
    let mut cause = std::error::Error::source(error);
    while let Some(err) = cause {
        message.push('\n');
        message.push_str(CAUSE_MARKER);
        message.push(' ');
        message.push_str(&err.to_string());
        cause = err.source();
    }
    message
}

/// Truncate error text for storage.
///
/// Text of 500 chars or fewer is stored as-is. Longer text keeps the first
/// 300 chars, a truncation marker, and — when one starts at least 100 chars
/// before the end — up to 200 chars of the last `Caused by:` segment.
pub fn truncate_error_message(message: &str) -> String {
    let chars: Vec<char> = message.chars().collect();
    if chars.len() <= MAX_ERROR_LENGTH {
        return message.to_string();
    }

    let head: String = chars[..HEAD_LENGTH].iter().collect();
    let tail: String = match last_cause_index(&chars) {
        Some(index) if index + CAUSE_MIN_DISTANCE_FROM_END < chars.len() => {
            let end = (index + CAUSE_TAIL_LENGTH).min(chars.len());
            chars[index..end].iter().collect()
        }
        _ => String::new(),
    };

    format!("{head}{TRUNCATION_MARKER}{tail}")
}

fn last_cause_index(chars: &[char]) -> Option<usize> {
    let marker: Vec<char> = CAUSE_MARKER.chars().collect();
    if chars.len() < marker.len() {
        return None;
    }
    (0..=chars.len() - marker.len())
        .rev()
        .find(|&i| chars[i..i + marker.len()] == marker[..])
}

fn snapshot(request: &MailRequest) -> Option<serde_json::Value> {
    match serde_json::to_value(request) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize request snapshot");
            None
        }
    }
}
