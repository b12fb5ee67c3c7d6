//! A TCP [`Channel`] carrying the relay wire protocol, dialed directly or
//! through a [`ProxyTunnel`].
//!
//! Each channel runs one background task that connects, marks the channel
//! `Ready` and then multiplexes calls over the socket until the peer goes
//! away, when every call pending on it fails and the task reconnects with
//! exponential backoff. `reset_connect_backoff` wakes a pending backoff sleep.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;

use chainrelay_core::error::{TransportError, ValidationError};
use chainrelay_core::policy::{Backoff, RetryConfig, RetryPolicy};
use chainrelay_core::relay::CallMetadata;

use crate::proxy::{ProxyConfig, ProxyTunnel};
use crate::supervisor::{Channel, ConnectivityState, Connector};
use crate::wire::{FrameStream, ReplyFrame, Reply, RequestFrame};

/// Connect timing for [`TcpConnector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}
fn default_backoff_initial_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    120_000
}
fn default_backoff_multiplier() -> f64 {
    1.6
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl TcpConfig {
    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn backoff(&self) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: u32::MAX,
            backoff: Backoff::Exponential {
                initial_ms: self.backoff_initial_ms,
                max_ms: self.backoff_max_ms,
                multiplier: self.backoff_multiplier,
            },
        })
    }
}

/// Dials [`TcpChannel`]s. Clones share the proxy route.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
    proxy: Arc<RwLock<Option<ProxyTunnel>>>,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            proxy: Arc::default(),
        }
    }

    /// Route every connection through `proxy`.
    pub fn with_proxy(self, proxy: ProxyConfig) -> Self {
        self.install_proxy(proxy);
        self
    }

    fn install_proxy(&self, proxy: ProxyConfig) {
        tracing::info!(proxy = %proxy.address(), "proxy route set");
        *self.proxy.write().unwrap_or_else(PoisonError::into_inner) = Some(ProxyTunnel::new(proxy));
    }

    fn proxy(&self) -> Option<ProxyTunnel> {
        self.proxy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn dial(&self, target: &str) -> Result<Arc<dyn Channel>, TransportError> {
        validate_authority(target).map_err(|e| TransportError::Dial {
            target: target.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Arc::new(TcpChannel::spawn(
            target.to_string(),
            self.config.clone(),
            self.proxy(),
        )))
    }

    fn set_proxy(&self, proxy: ProxyConfig) -> Result<(), TransportError> {
        self.install_proxy(proxy);
        Ok(())
    }
}

/// Accepts `host:port`, with an optional `scheme://` prefix stripped.
fn validate_authority(target: &str) -> Result<(), ValidationError> {
    let authority = target.split_once("://").map_or(target, |(_, rest)| rest);
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| ValidationError::InvalidEndpoint(format!("'{target}' has no port")))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(ValidationError::InvalidEndpoint(format!(
            "'{target}' is not host:port"
        )));
    }
    Ok(())
}

type StreamSender = futures::channel::mpsc::UnboundedSender<Result<Value, TransportError>>;

/// The caller side of one call in flight.
enum Waiter {
    Unary(oneshot::Sender<Result<Value, TransportError>>),
    Stream(StreamSender),
}

impl Waiter {
    /// Route one reply. Returns the waiter while the call stays open.
    fn deliver(self, reply: Reply) -> Option<Self> {
        match (self, reply) {
            (Self::Stream(tx), Reply::Item(value)) => {
                if tx.unbounded_send(Ok(value)).is_ok() {
                    Some(Self::Stream(tx))
                } else {
                    None
                }
            }
            // Stream acknowledgement.
            (Self::Stream(tx), Reply::Result(_)) => Some(Self::Stream(tx)),
            (Self::Stream(tx), Reply::Error(e)) => {
                let _ = tx.unbounded_send(Err(TransportError::Rpc(e)));
                None
            }
            (Self::Stream(_), Reply::End) => None,
            (Self::Unary(tx), Reply::Result(value) | Reply::Item(value)) => {
                let _ = tx.send(Ok(value));
                None
            }
            (Self::Unary(tx), Reply::Error(e)) => {
                let _ = tx.send(Err(TransportError::Rpc(e)));
                None
            }
            (Self::Unary(tx), Reply::End) => {
                let _ = tx.send(Err(TransportError::Other(
                    "call ended without a reply".into(),
                )));
                None
            }
        }
    }

    /// The connection under the call is gone.
    fn disconnect(self, reason: &str) {
        match self {
            Self::Unary(tx) => {
                let _ = tx.send(Err(TransportError::Closed));
            }
            Self::Stream(tx) => {
                let _ = tx.unbounded_send(Err(TransportError::Stream(reason.to_string())));
            }
        }
    }
}

struct Command {
    method: String,
    metadata: CallMetadata,
    params: Value,
    waiter: Waiter,
}

struct Shared {
    target: String,
    state: watch::Sender<ConnectivityState>,
    reset: Notify,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
}

/// A supervised TCP connection.
pub struct TcpChannel {
    shared: Arc<Shared>,
}

impl TcpChannel {
    fn spawn(target: String, config: TcpConfig, proxy: Option<ProxyTunnel>) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Idle);
        let (commands, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            target,
            state,
            reset: Notify::new(),
            cancel: CancellationToken::new(),
            commands,
        });
        tokio::spawn(run(shared.clone(), config, proxy, queue));
        Self { shared }
    }

    async fn ready(&self) -> Result<(), TransportError> {
        let mut rx = self.shared.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectivityState::Ready => return Ok(()),
                ConnectivityState::TransientFailure => {
                    return Err(TransportError::Unavailable(format!(
                        "{} is {state}",
                        self.shared.target
                    )))
                }
                ConnectivityState::Shutdown => return Err(TransportError::Closed),
                ConnectivityState::Idle | ConnectivityState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    async fn enqueue(
        &self,
        method: &str,
        metadata: &CallMetadata,
        params: Value,
        waiter: Waiter,
    ) -> Result<(), TransportError> {
        self.ready().await?;
        self.shared
            .commands
            .send(Command {
                method: method.to_string(),
                metadata: metadata.clone(),
                params,
                waiter,
            })
            .map_err(|_| TransportError::Closed)
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn target(&self) -> &str {
        &self.shared.target
    }

    fn state(&self) -> ConnectivityState {
        *self.shared.state.borrow()
    }

    async fn wait_for_state_change(&self, last: ConnectivityState) {
        let mut rx = self.shared.state.subscribe();
        loop {
            if *rx.borrow_and_update() != last {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn reset_connect_backoff(&self) {
        self.shared.reset.notify_one();
    }

    fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.state.send_replace(ConnectivityState::Shutdown);
    }

    async fn call(
        &self,
        method: &str,
        metadata: &CallMetadata,
        params: Value,
    ) -> Result<Value, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(method, metadata, params, Waiter::Unary(tx))
            .await?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn open_stream(
        &self,
        method: &str,
        metadata: &CallMetadata,
        params: Value,
    ) -> Result<FrameStream, TransportError> {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        self.enqueue(method, metadata, params, Waiter::Stream(tx))
            .await?;
        Ok(Box::pin(rx))
    }
}

async fn run(
    shared: Arc<Shared>,
    config: TcpConfig,
    proxy: Option<ProxyTunnel>,
    mut queue: mpsc::UnboundedReceiver<Command>,
) {
    let backoff = config.backoff();
    let mut attempt: u32 = 0;

    loop {
        set_state(&shared, ConnectivityState::Connecting);
        let connected = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            r = tokio::time::timeout(config.connect_timeout(), open(&shared.target, proxy.as_ref())) => r,
        };
        let result = connected.unwrap_or(Err(TransportError::Timeout {
            ms: config.connect_timeout_ms,
        }));

        match result {
            Ok(stream) => {
                attempt = 0;
                set_state(&shared, ConnectivityState::Ready);
                tracing::info!(endpoint = %shared.target, "tcp channel ready");
                let Some(reason) = serve(&shared, stream, &mut queue).await else {
                    break;
                };
                tracing::warn!(endpoint = %shared.target, %reason, "connection lost");
                set_state(&shared, ConnectivityState::Idle);
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let delay = backoff.delay_for(attempt);
                tracing::warn!(endpoint = %shared.target, error = %e, ?delay, "connect failed");
                set_state(&shared, ConnectivityState::TransientFailure);
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.reset.notified() => {
                        tracing::debug!(endpoint = %shared.target, "connect backoff reset");
                        attempt = 0;
                    }
                }
            }
        }
    }

    queue.close();
    while let Ok(command) = queue.try_recv() {
        command.waiter.disconnect("channel closed");
    }
    shared.state.send_replace(ConnectivityState::Shutdown);
}

/// Multiplex calls over one connection. Returns why the connection was lost,
/// or `None` once the channel is cancelled. Calls still pending on the
/// connection fail either way.
async fn serve(
    shared: &Shared,
    stream: TcpStream,
    queue: &mut mpsc::UnboundedReceiver<Command>,
) -> Option<String> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut pending: HashMap<u64, Waiter> = HashMap::new();
    let mut next_id: u64 = 0;

    let lost = loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break None,
            command = queue.recv() => {
                // Shared owns the sender, so the queue outlives this loop.
                let Some(command) = command else { break None };
                next_id += 1;
                let frame = RequestFrame::new(next_id, &command.method, &command.metadata, command.params);
                let mut bytes = match serde_json::to_vec(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        command.waiter.disconnect(&e.to_string());
                        continue;
                    }
                };
                bytes.push(b'\n');
                if let Err(e) = writer.write_all(&bytes).await {
                    command.waiter.disconnect(&e.to_string());
                    break Some(format!("write failed: {e}"));
                }
                tracing::trace!(endpoint = %shared.target, id = next_id, method = %frame.method, "request sent");
                pending.insert(next_id, command.waiter);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => dispatch(&line, &mut pending),
                Ok(None) => break Some("peer closed connection".to_string()),
                Err(e) => break Some(format!("read failed: {e}")),
            },
        }
    };

    let reason = lost.as_deref().unwrap_or("channel closed");
    if !pending.is_empty() {
        tracing::debug!(endpoint = %shared.target, calls = pending.len(), reason, "failing pending calls");
    }
    for (_, waiter) in pending.drain() {
        waiter.disconnect(reason);
    }
    while let Ok(command) = queue.try_recv() {
        command.waiter.disconnect(reason);
    }
    lost
}

fn dispatch(line: &str, pending: &mut HashMap<u64, Waiter>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let frame: ReplyFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable frame from relay");
            return;
        }
    };
    let id = frame.id;
    match pending.remove(&id) {
        Some(waiter) => {
            if let Some(open) = waiter.deliver(frame.into_reply()) {
                pending.insert(id, open);
            }
        }
        None => tracing::debug!(id, "reply for unknown call"),
    }
}

fn set_state(shared: &Shared, next: ConnectivityState) {
    // Never leave Shutdown once closed.
    shared.state.send_if_modified(|s| {
        if *s == ConnectivityState::Shutdown || *s == next {
            return false;
        }
        *s = next;
        true
    });
}

async fn open(target: &str, proxy: Option<&ProxyTunnel>) -> Result<TcpStream, TransportError> {
    let authority = target.split_once("://").map_or(target, |(_, rest)| rest);
    match proxy {
        Some(tunnel) => tunnel.connect(authority).await,
        None => TcpStream::connect(authority)
            .await
            .map_err(|e| TransportError::Dial {
                target: target.to_string(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_validation() {
        assert!(validate_authority("127.0.0.1:8100").is_ok());
        assert!(validate_authority("https://ny.mainnet.block-engine.jito.wtf:443").is_ok());
        assert!(validate_authority("no-port").is_err());
        assert!(validate_authority(":443").is_err());
        assert!(validate_authority("host:99999").is_err());
    }

    #[test]
    fn stream_waiter_stays_open_until_end() {
        let (tx, mut rx) = futures::channel::mpsc::unbounded();
        let waiter = Waiter::Stream(tx)
            .deliver(Reply::Result(Value::Null))
            .and_then(|w| w.deliver(Reply::Item(serde_json::json!(1))))
            .expect("stream still open");
        assert!(waiter.deliver(Reply::End).is_none());

        assert_eq!(rx.try_next().unwrap().unwrap().unwrap(), serde_json::json!(1));
        // sender dropped: stream finished
        assert!(rx.try_next().unwrap().is_none());
    }

    #[tokio::test]
    async fn unary_waiter_maps_relay_error() {
        let (tx, rx) = oneshot::channel();
        let left = Waiter::Unary(tx).deliver(Reply::Error(chainrelay_core::request::JsonRpcError {
            code: 16,
            message: "unauthenticated".into(),
            data: None,
        }));
        assert!(left.is_none());
        assert!(matches!(rx.await.unwrap(), Err(TransportError::Rpc(e)) if e.code == 16));
    }

    #[tokio::test]
    async fn calls_on_a_closed_channel_fail() {
        let channel = TcpConnector::default().dial("127.0.0.1:9").await.unwrap();
        channel.close();
        let err = channel
            .call("/x", &CallMetadata::new(), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn dial_rejects_bad_target() {
        let err = TcpConnector::default().dial("nonsense").await.err().unwrap();
        assert!(matches!(err, TransportError::Dial { .. }));
    }
}
