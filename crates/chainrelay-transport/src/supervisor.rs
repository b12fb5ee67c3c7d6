//! Connection health supervision.
//!
//! [`TransportSupervisor::connect`] dials a [`Channel`] and spawns one
//! observer task per connection:
//!
//! ```text
//! Ready                          -> retries = 0
//! TransientFailure|Connecting|Idle
//!     retries < max             -> sleep(retries * step), reset connect backoff, retries += 1
//!     retries == max            -> close, redial, retries = 0
//! Shutdown                       -> redial immediately
//! ```
//!
//! After each step the observer waits for a state change, bounded by the
//! heartbeat interval. A redial failure is reported on the error sink and ends
//! the observer; cancellation closes the channel and ends it too.
//!
//! Relay calls go through [`Connection::channel`], so they always use the
//! channel the observer most recently installed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use chainrelay_core::error::TransportError;
use chainrelay_core::events::{BackgroundError, ErrorSink};
use chainrelay_core::policy::{RetryConfig, RetryPolicy};
use chainrelay_core::proxy::ProxyConfig;
use chainrelay_core::relay::CallMetadata;

use crate::wire::FrameStream;

const TASK: &str = "connectivity-observer";

/// gRPC-style connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Ready => "READY",
            Self::TransientFailure => "TRANSIENT_FAILURE",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// A transport handle whose state the supervisor can observe and nudge.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn target(&self) -> &str;

    fn state(&self) -> ConnectivityState;

    /// Resolves once the state differs from `last`.
    async fn wait_for_state_change(&self, last: ConnectivityState);

    /// Cut any pending reconnect backoff short and retry now.
    fn reset_connect_backoff(&self);

    /// Tear the channel down; its state becomes `Shutdown` and calls in
    /// flight on it fail.
    fn close(&self);

    /// Unary call. Waits while the channel is `Idle` or `Connecting`, fails
    /// fast in `TransientFailure` or `Shutdown`.
    async fn call(
        &self,
        method: &str,
        metadata: &CallMetadata,
        params: Value,
    ) -> Result<Value, TransportError>;

    /// Server-streaming call. The stream yields an error and ends if the
    /// connection under it goes away.
    async fn open_stream(
        &self,
        method: &str,
        metadata: &CallMetadata,
        params: Value,
    ) -> Result<FrameStream, TransportError>;
}

/// Creates channels. Dialing is non-blocking: a returned channel may still be
/// `Connecting`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn dial(&self, target: &str) -> Result<Arc<dyn Channel>, TransportError>;

    /// Route later dials through `proxy`. Channels already dialed keep the
    /// route they were opened with.
    fn set_proxy(&self, proxy: ProxyConfig) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(format!(
            "connector cannot route through proxy {}",
            proxy.address()
        )))
    }
}

/// Observer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Poll interval while `Ready`, and the upper bound on each state-change wait.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Backoff cycles before the channel is closed and redialed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff before cycle `r` is `r * backoff_step_ms`.
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
}

fn default_heartbeat_ms() -> u64 {
    1_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_step_ms() -> u64 {
    1_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            max_retries: default_max_retries(),
            backoff_step_ms: default_backoff_step_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(RetryConfig::linear(
            self.max_retries,
            Duration::from_millis(self.backoff_step_ms),
        ))
    }
}

/// The supervised connection. Cheap to clone; every clone sees redials.
#[derive(Clone)]
pub struct Connection {
    target: String,
    current: watch::Receiver<Arc<dyn Channel>>,
}

impl Connection {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The channel currently in use.
    pub fn channel(&self) -> Arc<dyn Channel> {
        self.current.borrow().clone()
    }

    pub fn state(&self) -> ConnectivityState {
        self.current.borrow().state()
    }

    /// Close the current channel. The observer sees `Shutdown` and redials
    /// without backoff.
    pub fn reconnect(&self) {
        let channel = self.channel();
        tracing::info!(endpoint = %self.target, "closing channel for reconnect");
        channel.close();
    }

    /// Resolves when the observer has swapped in a freshly dialed channel.
    /// Returns `false` once the observer has exited.
    pub async fn redialed(&mut self) -> bool {
        self.current.changed().await.is_ok()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

pub struct TransportSupervisor;

impl TransportSupervisor {
    /// Dial `target` and start observing it. The initial dial failing is
    /// returned; later redial failures go to `errors`.
    pub async fn connect(
        target: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: SupervisorConfig,
        cancel: CancellationToken,
        errors: ErrorSink,
    ) -> Result<Connection, TransportError> {
        let target = target.into();
        let channel = connector.dial(&target).await?;
        tracing::info!(endpoint = %target, state = %channel.state(), "connection dialed");

        let (tx, rx) = watch::channel(channel);
        let observer = Observer {
            target: target.clone(),
            connector,
            config,
            current: tx,
            cancel,
            errors,
        };
        tokio::spawn(observer.run());

        Ok(Connection {
            target,
            current: rx,
        })
    }
}

struct Observer {
    target: String,
    connector: Arc<dyn Connector>,
    config: SupervisorConfig,
    current: watch::Sender<Arc<dyn Channel>>,
    cancel: CancellationToken,
    errors: ErrorSink,
}

impl Observer {
    async fn run(self) {
        let policy = self.config.retry_policy();
        let heartbeat = self.config.heartbeat();
        let mut retries: u32 = 0;

        loop {
            let channel = self.current.borrow().clone();
            if self.cancel.is_cancelled() {
                channel.close();
                break;
            }

            let state = channel.state();
            match state {
                ConnectivityState::Ready => retries = 0,
                ConnectivityState::TransientFailure
                | ConnectivityState::Connecting
                | ConnectivityState::Idle => {
                    if retries >= self.config.max_retries {
                        tracing::warn!(
                            endpoint = %self.target,
                            retries,
                            "connection not recovering, closing and redialing"
                        );
                        channel.close();
                        if !self.redial().await {
                            return;
                        }
                        retries = 0;
                        continue;
                    }

                    let delay = policy.delay_for(retries);
                    tracing::debug!(endpoint = %self.target, %state, retries, ?delay, "backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => continue,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    channel.reset_connect_backoff();
                    retries += 1;
                }
                ConnectivityState::Shutdown => {
                    tracing::info!(endpoint = %self.target, "channel shut down, redialing");
                    if !self.redial().await {
                        return;
                    }
                    retries = 0;
                    continue;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = channel.wait_for_state_change(state) => {}
                _ = tokio::time::sleep(heartbeat) => {}
            }
        }

        tracing::info!(endpoint = %self.target, "connectivity observer stopped");
    }

    /// Dial a replacement channel. Returns `false` when the observer must stop.
    async fn redial(&self) -> bool {
        let dialed = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            r = self.connector.dial(&self.target) => r,
        };
        match dialed {
            Ok(channel) => {
                tracing::info!(endpoint = %self.target, "connection re-established");
                self.current.send_replace(channel);
                true
            }
            Err(e) => {
                tracing::error!(endpoint = %self.target, error = %e, "redial failed, observer exiting");
                self.errors.report(BackgroundError::Transport {
                    task: TASK,
                    source: e,
                });
                false
            }
        }
    }
}
