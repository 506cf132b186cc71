use async_trait::async_trait;
use thiserror::Error;

use crate::types::MailRequest;

/// External collaborator that renders and delivers a message.
///
/// The dispatcher never retries a transport call itself; the claim protocol
/// decides whether a later identical request may attempt again. The transport
/// is expected to carry its own connect/read timeouts — their expiry is what
/// the outcome recorder's timeout classifier detects.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, request: &MailRequest) -> Result<(), TransportError>;
}

/// Failure reported by the transport collaborator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connect/read timeout or connectivity failure.
    Timeout,
    /// Anything else the transport reports.
    Other,
}

impl TransportError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            message: message.into(),
            source: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Other,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause. The recorder walks this chain when
    /// classifying the failure.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}
