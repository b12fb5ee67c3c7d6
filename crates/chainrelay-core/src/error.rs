//! Error taxonomy shared by every ChainRelay crate.
//!
//! | Type | Raised by | Propagation |
//! |---|---|---|
//! | [`TransportError`] | dial, redial, RPC and stream calls | returned, or reported on the error sink by background tasks |
//! | [`ValidationError`] | bundle assembly, id batching, config parsing | returned before any network call |
//! | [`AuthError`] | handshake and token renewal | handshake: returned (fatal); renewal: reported |
//! | [`RejectionError`] | bundle confirmation | returned |
//! | [`TimeoutError`] | bundle confirmation | returned |

use std::time::Duration;

use thiserror::Error;

use crate::request::JsonRpcError;
use crate::result::{ConfirmPhase, RejectionReason};

/// Errors that can occur while talking to the relay or the ledger.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, non-2xx status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON-RPC protocol-level error returned by the remote end.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Establishing (or re-establishing) a connection failed.
    #[error("failed to dial {target}: {reason}")]
    Dial { target: String, reason: String },

    /// The forward proxy refused or broke the tunnel.
    #[error("proxy tunnel error: {0}")]
    Proxy(String),

    /// The bundle result stream failed or ended.
    #[error("result stream error: {0}")]
    Stream(String),

    /// The connection or the task serving a call is gone.
    #[error("connection closed")]
    Closed,

    /// The channel is in `TRANSIENT_FAILURE`; calls fail fast until it recovers.
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The owning client scope was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The transport cannot perform this call (e.g. streaming over HTTP).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if this error is transient and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Dial { .. }
                | Self::Proxy(_)
                | Self::Stream(_)
                | Self::Closed
                | Self::Unavailable(_)
                | Self::Timeout { .. }
        )
    }

    /// Returns `true` if this is a remote-side execution error (not retryable).
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

/// Errors decoding transactions and packets from their wire forms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("input truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("malformed compact-u16 length prefix")]
    InvalidLength,

    #[error("packet meta declares {declared} bytes but carries {actual}")]
    SizeMismatch { declared: u64, actual: usize },

    #[error("expected {expected} bytes, got {actual}")]
    WrongWidth { expected: usize, actual: usize },

    #[error("invalid base58: {0}")]
    Base58(String),

    #[error("invalid base64: {0}")]
    Base64(String),

    #[error("unknown encoding '{0}', expected base58 or base64")]
    UnknownEncoding(String),
}

/// Input rejected locally, before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("bundle must contain at least one transaction")]
    EmptyBundle,

    #[error("bundle has {count} transactions, at most {max} allowed")]
    TooManyTransactions { count: usize, max: usize },

    #[error("transaction {index} serializes to {size} bytes, at most {max} allowed")]
    TransactionTooLarge { index: usize, size: usize, max: usize },

    #[error("transaction {index} carries no signature")]
    MissingSignature { index: usize },

    #[error("{count} bundle ids requested, at most {max} per call; batch the request")]
    TooManyBundleIds { count: usize, max: usize },

    #[error("invalid proxy string, expected HOST:PORT:USERNAME:PASSWORD: {0}")]
    InvalidProxy(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// `GenerateAuthChallenge` failed.
    #[error("auth challenge request failed: {0}")]
    Challenge(#[source] TransportError),

    /// `GenerateAuthTokens` failed.
    #[error("auth token exchange failed: {0}")]
    TokenExchange(#[source] TransportError),

    /// `RefreshAccessToken` failed; the previous token is still served.
    #[error("access token refresh failed: {0}")]
    Refresh(#[source] TransportError),

    /// The key pair could not be parsed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// The relay classified a bundle as rejected.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("bundle {bundle_id} rejected: {reason}")]
pub struct RejectionError {
    pub bundle_id: String,
    pub reason: RejectionReason,
}

/// A confirmation phase did not complete within its bound.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bundle {bundle_id} still {phase} after {bound:?}")]
pub struct TimeoutError {
    pub bundle_id: String,
    pub phase: ConfirmPhase,
    pub bound: Duration,
}

/// Everything `confirm` can fail with.
#[derive(Debug, Error)]
pub enum ConfirmError {
    #[error(transparent)]
    Rejected(#[from] RejectionError),

    #[error(transparent)]
    TimedOut(#[from] TimeoutError),

    /// Receiving the relay's verdict kept failing after the bounded retries.
    #[error("failed to receive bundle result: {0}")]
    Result(#[source] TransportError),

    /// The ledger lookup failed; surfaced without retry.
    #[error("signature status lookup failed: {0}")]
    Ledger(#[source] TransportError),

    #[error("confirmation cancelled")]
    Cancelled,
}

impl ConfirmError {
    /// The structured rejection, if the relay rejected the bundle.
    pub fn rejection(&self) -> Option<&RejectionError> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }

    /// Returns `true` if the outcome is unknown rather than a definite failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

/// Umbrella error for APIs that span several concerns.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Confirm(#[from] ConfirmError),
}

impl From<CodecError> for RelayError {
    fn from(e: CodecError) -> Self {
        Self::Validation(ValidationError::Codec(e))
    }
}
