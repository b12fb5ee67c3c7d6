//! `RelayClient`: wires the supervisor, session, result feed and pipeline
//! together under one cancellation scope.
//!
//! Auth, submission and the result stream all run as calls on the supervised
//! connection, so a redial is picked up by the next call and a closed channel
//! fails the calls that were using it.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chainrelay_auth::{Keypair, Session, SessionConfig, SessionManager};
use chainrelay_core::error::{RelayError, TransportError};
use chainrelay_core::events::{BackgroundError, ErrorSink};
use chainrelay_core::ledger::SignatureStatusLookup;
use chainrelay_core::proxy::ProxyConfig;
use chainrelay_core::relay::{CallCredentials, CallMetadata, Role};
use chainrelay_transport::{
    Connection, Connector, RelayStub, SupervisorConfig, TransportSupervisor,
};

use crate::pipeline::{BundlePipeline, PipelineConfig};
use crate::results::{ResultFeed, ResultFeedConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay endpoint, `host:port`.
    pub target: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub results: ResultFeedConfig,
    #[serde(default = "default_error_capacity")]
    pub error_capacity: usize,
}

fn default_error_capacity() -> usize {
    64
}

impl ClientConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            role: Role::default(),
            supervisor: SupervisorConfig::default(),
            session: SessionConfig::default(),
            pipeline: PipelineConfig::default(),
            results: ResultFeedConfig::default(),
            error_capacity: default_error_capacity(),
        }
    }
}

/// The collaborators a client is built from.
pub struct RelayParts {
    pub connector: Arc<dyn Connector>,
    /// Identity to authenticate with. `None` for the relay's unauthenticated mode.
    pub keypair: Option<Arc<Keypair>>,
    pub ledger: Arc<dyn SignatureStatusLookup>,
}

pub struct RelayClient {
    connector: Arc<dyn Connector>,
    connection: Connection,
    session: Option<Session>,
    pipeline: BundlePipeline,
    cancel: CancellationToken,
    errors: Mutex<Option<mpsc::Receiver<BackgroundError>>>,
}

impl RelayClient {
    /// Dial, authenticate, subscribe to results and build the pipeline. If
    /// any step fails, everything already started is cancelled.
    pub async fn connect(config: ClientConfig, parts: RelayParts) -> Result<Self, RelayError> {
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let (errors, errors_rx) = ErrorSink::channel(config.error_capacity);

        let connection = TransportSupervisor::connect(
            config.target.clone(),
            parts.connector.clone(),
            config.supervisor,
            cancel.clone(),
            errors.clone(),
        )
        .await?;

        let stub = Arc::new(RelayStub::new(connection.clone()));

        let session = match parts.keypair {
            Some(keypair) => Some(
                SessionManager::new(stub.clone(), keypair, config.session)
                    .authenticate(config.role, cancel.clone(), errors.clone())
                    .await?,
            ),
            None => {
                tracing::info!("no key pair configured, using unauthenticated mode");
                None
            }
        };
        let credentials: Arc<dyn CallCredentials> = match &session {
            Some(session) => Arc::new(session.clone()),
            None => Arc::new(CallMetadata::new()),
        };

        let feed = ResultFeed::start(
            stub.clone(),
            credentials.clone(),
            config.results,
            cancel.clone(),
            errors,
        );
        let pipeline = BundlePipeline::new(
            stub,
            credentials,
            Arc::new(feed),
            parts.ledger,
            config.pipeline,
            cancel.clone(),
        );

        tracing::info!(endpoint = %config.target, "relay client ready");
        guard.disarm();
        Ok(Self {
            connector: parts.connector,
            connection,
            session,
            pipeline,
            cancel,
            errors: Mutex::new(Some(errors_rx)),
        })
    }

    pub fn pipeline(&self) -> &BundlePipeline {
        &self.pipeline
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Route the connection through `proxy` from now on: later dials use it
    /// and the current channel is closed so the supervisor redials at once.
    /// Calls in flight on the old channel fail with `Closed`.
    pub fn rotate_proxy(&self, proxy: ProxyConfig) -> Result<(), TransportError> {
        tracing::info!(endpoint = %self.connection.target(), proxy = %proxy.address(), "rotating proxy");
        self.connector.set_proxy(proxy)?;
        self.connection.reconnect();
        Ok(())
    }

    /// `None` in unauthenticated mode.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The receiver for background-task errors. Handed out once.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<BackgroundError>> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every background task and close the connection.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("relay client shutting down");
            self.cancel.cancel();
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
