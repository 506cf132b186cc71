//! A store-backed email dispatch gatekeeper.
//!
//! This crate decides, atomically per dedup key, whether a send attempt may
//! proceed, and records what happened to it. It exists to make "at-most-once
//! effective delivery under concurrent and retried requests" true.
//!
//! ## Guarantees
//! - At-most-once effective delivery per dedup key
//! - Per-type minimum interval between attempts (delay window)
//! - Finite retry ceiling for throttled types
//! - Linearizable claim decisions, serialized by the backing store
//!
//! ## Non-Guarantees
//! - Message queueing or timer-based redelivery
//! - Distributed coordination beyond the store's transactions
//! - Delivery itself: the [`MailTransport`] collaborator owns rendering,
//!   SMTP and its timeouts
//!
//! Throttling and dedup denials are ordinary result variants
//! ([`DispatchOutcome::Skipped`]), never errors, so the decision space stays
//! exhaustively checkable.

mod dispatcher;
mod error;
mod gatekeeper;
mod policy;
mod recorder;
mod storage;
mod transport;
mod types;
mod validator;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{DispatchError, StorageError};
pub use gatekeeper::Gatekeeper;
pub use policy::{DelayPolicy, DelayRule, PolicyHandle, DEFAULT_MAX_RETRIES};
pub use recorder::{
    is_timeout_error, matches_timeout_signature, truncate_error_message, OutcomeRecorder,
};
pub use storage::{InMemoryStorage, OutcomeWrite, Storage};
pub use transport::{MailTransport, TransportError, TransportErrorKind};
pub use types::{
    ClaimOutcome, DedupKey, DispatchOutcome, DispatchRecord, DispatchStatus, MailRequest,
    SkipReason, TraceId,
};
pub use validator::{is_valid_address, validate};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
