//! [`AuthService`] and [`SearcherService`] over a supervised [`Connection`].
//!
//! Every call is made on the channel the supervisor currently holds, so a
//! redial is picked up by the next call and a closed channel fails the calls
//! that were using it.

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use chainrelay_core::error::TransportError;
use chainrelay_core::relay::{
    AuthService, AuthTokens, BundleResultStream, CallMetadata, Role, SearcherService, Token,
};
use chainrelay_core::result::BundleResult;
use chainrelay_core::transaction::{Packet, Pubkey};

use crate::supervisor::Connection;
use crate::wire::{
    ChallengeReply, ChallengeRequest, RefreshReply, RefreshRequest, SendBundleReply,
    SendBundleRequest, TokensReply, TokensRequest, GENERATE_AUTH_CHALLENGE, GENERATE_AUTH_TOKENS,
    REFRESH_ACCESS_TOKEN, SEND_BUNDLE, SUBSCRIBE_BUNDLE_RESULTS,
};

/// Client stub for the relay's auth and searcher services.
#[derive(Clone)]
pub struct RelayStub {
    connection: Connection,
}

impl RelayStub {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    async fn unary<P, R>(
        &self,
        method: &str,
        metadata: &CallMetadata,
        params: &P,
    ) -> Result<R, TransportError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let channel = self.connection.channel();
        tracing::debug!(endpoint = %channel.target(), method, "relay call");
        let value = channel.call(method, metadata, params).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl AuthService for RelayStub {
    async fn generate_auth_challenge(
        &self,
        role: Role,
        pubkey: &Pubkey,
    ) -> Result<String, TransportError> {
        let request = ChallengeRequest {
            role,
            pubkey: pubkey.to_string(),
        };
        let reply: ChallengeReply = self
            .unary(GENERATE_AUTH_CHALLENGE, &CallMetadata::new(), &request)
            .await?;
        Ok(reply.challenge)
    }

    async fn generate_auth_tokens(
        &self,
        challenge: &str,
        signed_challenge: &[u8],
        pubkey: &Pubkey,
    ) -> Result<AuthTokens, TransportError> {
        let request = TokensRequest {
            challenge: challenge.to_string(),
            client_pubkey: pubkey.to_string(),
            signed_challenge: bs58::encode(signed_challenge).into_string(),
        };
        let reply: TokensReply = self
            .unary(GENERATE_AUTH_TOKENS, &CallMetadata::new(), &request)
            .await?;
        Ok(reply.into())
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<Token, TransportError> {
        let request = RefreshRequest {
            refresh_token: refresh_token.to_string(),
        };
        let reply: RefreshReply = self
            .unary(REFRESH_ACCESS_TOKEN, &CallMetadata::new(), &request)
            .await?;
        Ok(reply.access_token)
    }
}

#[async_trait]
impl SearcherService for RelayStub {
    async fn send_bundle(
        &self,
        metadata: &CallMetadata,
        packets: Vec<Packet>,
    ) -> Result<String, TransportError> {
        let reply: SendBundleReply = self
            .unary(SEND_BUNDLE, metadata, &SendBundleRequest { packets })
            .await?;
        Ok(reply.uuid)
    }

    async fn subscribe_bundle_results(
        &self,
        metadata: &CallMetadata,
    ) -> Result<BundleResultStream, TransportError> {
        let channel = self.connection.channel();
        tracing::debug!(endpoint = %channel.target(), "subscribing to bundle results");
        let frames = channel
            .open_stream(SUBSCRIBE_BUNDLE_RESULTS, metadata, serde_json::Value::Null)
            .await?;
        Ok(Box::pin(frames.map(|frame| {
            frame.and_then(|value| {
                serde_json::from_value::<BundleResult>(value).map_err(TransportError::from)
            })
        })))
    }
}
