//! chainrelay-core: wire types, error taxonomy and service traits for ChainRelay.
//!
//! # Overview
//!
//! ChainRelay is a client for an auction-based transaction relay: callers
//! submit bundles of signed transactions, learn whether the relay accepted
//! or rejected them, and confirm landing on the ledger. The core crate defines:
//!
//! - [`Transaction`] / [`Packet`]: transaction wire codec and submission form
//! - [`Bundle`]: validated group of 1–5 transactions
//! - [`BundleResult`] / [`RejectionReason`]: the relay's verdicts
//! - [`AuthService`] / [`SearcherService`]: the relay's remote surface
//! - [`SignatureStatusLookup`]: read-only ledger collaborator
//! - [`RpcTransport`]: JSON-RPC transport used by the HTTP fallback
//! - [`error`] module: the error taxonomy
//! - [`events`] module: background error channel
//! - [`policy`] module: retry/backoff
//! - [`endpoints`] module: known relay regions
//! - [`ProxyConfig`]: `HOST:PORT:USERNAME:PASSWORD` forward-proxy credentials

pub mod bundle;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod ledger;
pub mod policy;
pub mod proxy;
pub mod relay;
pub mod request;
pub mod result;
pub mod transaction;
pub mod transport;

pub use bundle::{Bundle, SubmissionReceipt, MAX_BUNDLE_LEN};
pub use endpoints::{Region, REGIONS};
pub use error::{
    AuthError, CodecError, ConfirmError, RejectionError, RelayError, TimeoutError,
    TransportError, ValidationError,
};
pub use events::{BackgroundError, ErrorSink};
pub use ledger::{ConfirmationStatus, SignatureStatus, SignatureStatusLookup};
pub use proxy::ProxyConfig;
pub use relay::{
    AuthService, AuthTokens, BundleResultStream, CallCredentials, CallMetadata, Role,
    SearcherService, Token,
};
pub use request::{JsonRpcRequest, JsonRpcResponse, RpcId, RpcParam};
pub use result::{BundleOutcome, BundleResult, BundleResultSource, ConfirmPhase, RejectionReason};
pub use transaction::{Encoding, Packet, PacketMeta, Pubkey, Signature, Transaction, PACKET_DATA_SIZE};
pub use transport::RpcTransport;
