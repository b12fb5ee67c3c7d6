//! Relay wire protocol: newline-delimited JSON frames over one connection.
//!
//! ```text
//! client -> relay   {"id":7,"method":"/searcher.SearcherService/SendBundle","metadata":{..},"params":{..}}
//! relay  -> client  {"id":7,"result":{..}}          unary reply
//!                   {"id":7,"item":{..}}            one server-stream message
//!                   {"id":7,"end":true}             server stream finished
//!                   {"id":7,"error":{"code":..,"message":..}}
//! ```
//!
//! Ids are assigned per connection, so many calls and streams share it.

use std::collections::BTreeMap;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainrelay_core::error::TransportError;
use chainrelay_core::relay::{AuthTokens, CallMetadata, Role, Token};
use chainrelay_core::request::JsonRpcError;
use chainrelay_core::transaction::Packet;

pub const GENERATE_AUTH_CHALLENGE: &str = "/auth.AuthService/GenerateAuthChallenge";
pub const GENERATE_AUTH_TOKENS: &str = "/auth.AuthService/GenerateAuthTokens";
pub const REFRESH_ACCESS_TOKEN: &str = "/auth.AuthService/RefreshAccessToken";
pub const SEND_BUNDLE: &str = "/searcher.SearcherService/SendBundle";
pub const SUBSCRIBE_BUNDLE_RESULTS: &str = "/searcher.SearcherService/SubscribeBundleResults";

/// Messages of one server stream, ending after the first error.
pub type FrameStream = BoxStream<'static, Result<Value, TransportError>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub params: Value,
}

impl RequestFrame {
    pub fn new(id: u64, method: &str, metadata: &CallMetadata, params: Value) -> Self {
        Self {
            id,
            method: method.to_string(),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            params,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,
}

/// What a reply frame means for the call it answers.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result(Value),
    Item(Value),
    Error(JsonRpcError),
    End,
}

impl ReplyFrame {
    /// Errors win over payloads; a frame with nothing in it ends the call.
    pub fn into_reply(self) -> Reply {
        if let Some(error) = self.error {
            Reply::Error(error)
        } else if let Some(item) = self.item {
            Reply::Item(item)
        } else if let Some(result) = self.result {
            Reply::Result(result)
        } else {
            Reply::End
        }
    }
}

// ─── Message bodies ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub role: Role,
    /// Base58 public key.
    pub pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeReply {
    pub challenge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokensRequest {
    pub challenge: String,
    pub client_pubkey: String,
    /// Base58 ed25519 signature over `challenge`.
    pub signed_challenge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokensReply {
    pub access_token: Token,
    pub refresh_token: Token,
}

impl From<TokensReply> for AuthTokens {
    fn from(reply: TokensReply) -> Self {
        Self {
            access: reply.access_token,
            refresh: reply.refresh_token,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshReply {
    pub access_token: Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendBundleRequest {
    pub packets: Vec<Packet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendBundleReply {
    pub uuid: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_omits_empty_metadata() {
        let frame = RequestFrame::new(3, SEND_BUNDLE, &CallMetadata::new(), json!({"packets": []}));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"id": 3, "method": SEND_BUNDLE, "params": {"packets": []}})
        );

        let frame = RequestFrame::new(4, SEND_BUNDLE, &CallMetadata::bearer("t"), Value::Null);
        assert_eq!(frame.metadata["authorization"], "Bearer t");
    }

    #[test]
    fn reply_classification() {
        let parse = |s: &str| serde_json::from_str::<ReplyFrame>(s).unwrap().into_reply();
        assert_eq!(parse(r#"{"id":1,"result":{"uuid":"b"}}"#), Reply::Result(json!({"uuid": "b"})));
        assert_eq!(parse(r#"{"id":1,"item":{"x":1}}"#), Reply::Item(json!({"x": 1})));
        assert_eq!(parse(r#"{"id":1,"end":true}"#), Reply::End);
        assert!(matches!(
            parse(r#"{"id":1,"result":{},"error":{"code":16,"message":"unauthenticated"}}"#),
            Reply::Error(e) if e.code == 16
        ));
    }
}
