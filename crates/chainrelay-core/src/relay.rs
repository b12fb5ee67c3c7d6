//! The relay's remote services, as seen from the client.
//!
//! [`AuthService`] and [`SearcherService`] mirror the relay's RPC surface.
//! Implementations are supplied by the caller (a gRPC stub, the HTTP
//! fallback, or a test double); everything above them is transport-agnostic.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::result::BundleResult;
use crate::transaction::{Packet, Pubkey};

/// Role a key authenticates as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Relayer,
    #[default]
    Searcher,
    Validator,
    ShredstreamSubscriber,
}

/// An opaque bearer token with its UTC expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTokens {
    pub access: Token,
    pub refresh: Token,
}

/// Key/value pairs attached to every outgoing relay call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMetadata {
    entries: Vec<(String, String)>,
}

impl CallMetadata {
    pub const AUTHORIZATION: &'static str = "authorization";

    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata carrying `authorization: Bearer <token>`.
    pub fn bearer(token: &str) -> Self {
        let mut md = Self::new();
        md.insert(Self::AUTHORIZATION, format!("Bearer {token}"));
        md
    }

    /// Insert or replace `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source of the metadata for the next call. Implemented by the live
/// session (whose token changes underneath) and by fixed metadata.
pub trait CallCredentials: Send + Sync + 'static {
    fn metadata(&self) -> CallMetadata;
}

impl CallCredentials for CallMetadata {
    fn metadata(&self) -> CallMetadata {
        self.clone()
    }
}

/// Challenge-response authentication endpoints.
#[async_trait]
pub trait AuthService: Send + Sync + 'static {
    async fn generate_auth_challenge(
        &self,
        role: Role,
        pubkey: &Pubkey,
    ) -> Result<String, TransportError>;

    /// `challenge` is the signed message, `"{pubkey}-{challenge}"`.
    async fn generate_auth_tokens(
        &self,
        challenge: &str,
        signed_challenge: &[u8],
        pubkey: &Pubkey,
    ) -> Result<AuthTokens, TransportError>;

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<Token, TransportError>;
}

pub type BundleResultStream = BoxStream<'static, Result<BundleResult, TransportError>>;

/// Bundle submission and result subscription.
#[async_trait]
pub trait SearcherService: Send + Sync + 'static {
    /// Submit one bundle's packets; returns the relay-assigned bundle id.
    async fn send_bundle(
        &self,
        metadata: &CallMetadata,
        packets: Vec<Packet>,
    ) -> Result<String, TransportError>;

    /// Open the server stream of results for every bundle this identity sends.
    async fn subscribe_bundle_results(
        &self,
        metadata: &CallMetadata,
    ) -> Result<BundleResultStream, TransportError>;
}
