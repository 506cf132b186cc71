use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound send request.
///
/// The dispatcher treats `template_name` and `params` as opaque: rendering is
/// the transport collaborator's responsibility. Everything here lands in the
/// persisted request snapshot for audit and replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailRequest {
    /// Caller-supplied correlation id scoping the at-most-once guarantee.
    /// Generated when absent.
    pub dedup_key: Option<String>,

    /// Classification used to look up the delay policy.
    pub message_type: String,

    /// Sender address.
    pub sender: String,

    /// Recipient address, or a `;`-delimited list.
    pub receiver: String,

    /// Optional CC address or `;`-delimited list.
    pub cc: Option<String>,

    /// Optional BCC address or `;`-delimited list.
    pub bcc: Option<String>,

    /// Message subject.
    pub subject: String,

    /// Optional priority, 1 (highest) to 5.
    pub priority: Option<u8>,

    /// Template looked up by the rendering collaborator.
    pub template_name: Option<String>,

    /// Opaque parameter tree handed to the rendering collaborator.
    pub params: Option<serde_json::Value>,

    /// Propagated caller trace identifier. Generated when absent.
    pub trace_id: Option<String>,
}

impl MailRequest {
    /// Create a request with the required fields.
    pub fn new(
        message_type: impl Into<String>,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            dedup_key: None,
            message_type: message_type.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            cc: None,
            bcc: None,
            subject: subject.into(),
            priority: None,
            template_name: None,
            params: None,
            trace_id: None,
        }
    }

    /// Set the dedup key scoping the at-most-once guarantee.
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Set CC recipients.
    pub fn with_cc(mut self, cc: impl Into<String>) -> Self {
        self.cc = Some(cc.into());
        self
    }

    /// Set BCC recipients.
    pub fn with_bcc(mut self, bcc: impl Into<String>) -> Self {
        self.bcc = Some(bcc.into());
        self
    }

    /// Set the priority (1 highest, 5 lowest).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Name the template the rendering collaborator should use.
    pub fn with_template(mut self, template_name: impl Into<String>) -> Self {
        self.template_name = Some(template_name.into());
        self
    }

    /// Attach the opaque parameter tree for rendering.
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Propagate a caller trace identifier.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Correlation id scoping one logical send.
///
/// Strongly typed to avoid mixing with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey(pub String);

impl DedupKey {
    /// Generate a fresh unique key.
    pub fn generate() -> Self {
        Self(random_hex(32))
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller trace identifier carried into the audit record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a fresh trace id for callers that supplied none.
    pub fn generate() -> Self {
        Self(random_hex(32))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn random_hex(len: usize) -> String {
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        out.push(char::from_digit(fastrand::u32(0..16), 16).unwrap_or('0'));
    }
    out
}

/// Lifecycle status of a dispatch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatus {
    Pending,
    Success,
    Failed,
    Timeout,
}

impl DispatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Pending => "PENDING",
            DispatchStatus::Success => "SUCCESS",
            DispatchStatus::Failed => "FAILED",
            DispatchStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(DispatchStatus::Pending),
            "SUCCESS" => Some(DispatchStatus::Success),
            "FAILED" => Some(DispatchStatus::Failed),
            "TIMEOUT" => Some(DispatchStatus::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted audit/state entity tracking one dedup key's lifecycle.
///
/// Created on first claim, mutated by claims (PENDING) and by the outcome
/// recorder (terminal states). Never deleted by this subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub dedup_key: DedupKey,
    pub message_type: String,
    pub status: DispatchStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub request_snapshot: Option<serde_json::Value>,
    pub http_code: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub trace_id: Option<String>,
}

impl DispatchRecord {
    /// Fresh record as written by the first claim for a key.
    pub fn new(dedup_key: DedupKey, message_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            dedup_key,
            message_type: message_type.into(),
            status: DispatchStatus::Pending,
            retry_count: 0,
            created_at: now,
            last_attempt_at: None,
            last_success_at: None,
            request_snapshot: None,
            http_code: None,
            error_code: None,
            error_message: None,
            trace_id: None,
        }
    }
}

/// Decision of the atomic claim protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller holds the claim and may attempt the send.
    Proceed { key: DedupKey, retry_count: u32 },

    /// A send for this key already succeeded.
    AlreadySent,

    /// The delay window for this key's type is still open. Nothing was
    /// written.
    DelayActive,

    /// The retry ceiling was reached; the record is now FAILED.
    Exhausted { attempts: u32 },
}

/// Result of a dispatch as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The transport accepted the message and the success was recorded.
    Sent { key: DedupKey, receiver: String },

    /// The claim was denied; no transport call was made.
    Skipped { key: DedupKey, reason: SkipReason },
}

/// Why a dispatch was skipped without a transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySent,
    DelayActive { message_type: String },
    Exhausted { attempts: u32 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadySent => write!(f, "already delivered"),
            SkipReason::DelayActive { message_type } => {
                write!(f, "throttled, retry later ({message_type} delay is active)")
            }
            SkipReason::Exhausted { attempts } => {
                write!(f, "permanently failed after {attempts} attempts")
            }
        }
    }
}
