//! chainrelay-auth: challenge-response authentication for ChainRelay.
//!
//! - [`Keypair`]: Ed25519 identity that signs auth challenges
//! - [`SessionManager`]: handshake plus an unattended token-renewal task
//! - [`Session`]: the live bearer credential attached to outgoing calls

pub mod keypair;
pub mod session;

pub use keypair::Keypair;
pub use session::{renewal_delay, Session, SessionConfig, SessionManager};
