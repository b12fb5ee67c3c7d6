//! Authenticated session and its token-renewal task.
//!
//! [`SessionManager::authenticate`] runs the challenge-response handshake
//! once, synchronously; failure there is returned to the caller. On success
//! a renewal task is spawned that, for the lifetime of the session:
//!
//! 1. sleeps until `access.expires_at - renewal_margin`;
//! 2. exchanges the refresh token for a new access token (or repeats the
//!    whole handshake if the refresh token itself has expired);
//! 3. swaps the call metadata under the session mutex.
//!
//! A failed renewal is reported on the error sink and retried, first
//! immediately and then with capped exponential backoff, while callers keep
//! using the last good token.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use chainrelay_core::error::AuthError;
use chainrelay_core::events::{BackgroundError, ErrorSink};
use chainrelay_core::policy::{Backoff, RetryConfig, RetryPolicy};
use chainrelay_core::relay::{AuthService, AuthTokens, CallCredentials, CallMetadata, Role, Token};
use chainrelay_core::transaction::Pubkey;

use crate::keypair::Keypair;

const TASK: &str = "token-renewal";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Renew this long before the access token expires.
    #[serde(default = "default_renewal_margin_ms")]
    pub renewal_margin_ms: u64,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_renewal_margin_ms() -> u64 {
    30_000
}
fn default_retry_initial_ms() -> u64 {
    500
}
fn default_retry_max_ms() -> u64 {
    30_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            renewal_margin_ms: default_renewal_margin_ms(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl SessionConfig {
    pub fn renewal_margin(&self) -> Duration {
        Duration::from_millis(self.renewal_margin_ms)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: u32::MAX,
            backoff: Backoff::Exponential {
                initial_ms: self.retry_initial_ms,
                max_ms: self.retry_max_ms,
                multiplier: 2.0,
            },
        })
    }
}

struct SessionState {
    access: Token,
    refresh: Token,
    metadata: CallMetadata,
}

/// The live credential. Clones share state; the renewal task mutates it in
/// place and readers always see a whole token.
#[derive(Clone)]
pub struct Session {
    pubkey: Pubkey,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    fn new(pubkey: Pubkey, tokens: AuthTokens) -> Self {
        let metadata = CallMetadata::bearer(&tokens.access.value);
        Self {
            pubkey,
            state: Arc::new(Mutex::new(SessionState {
                access: tokens.access,
                refresh: tokens.refresh,
                metadata,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    pub fn bearer_token(&self) -> String {
        self.lock().access.value.clone()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.lock().access.expires_at
    }

    fn refresh_token(&self) -> Token {
        self.lock().refresh.clone()
    }

    fn install_access(&self, access: Token) {
        let mut state = self.lock();
        state.metadata = CallMetadata::bearer(&access.value);
        state.access = access;
    }

    fn install_tokens(&self, tokens: AuthTokens) {
        let mut state = self.lock();
        state.metadata = CallMetadata::bearer(&tokens.access.value);
        state.access = tokens.access;
        state.refresh = tokens.refresh;
    }
}

impl CallCredentials for Session {
    fn metadata(&self) -> CallMetadata {
        self.lock().metadata.clone()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("pubkey", &self.pubkey)
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

/// How long to sleep before renewing a token that expires at `expires_at`.
/// Zero if that moment has already passed.
pub fn renewal_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>, margin: Duration) -> Duration {
    let margin = chrono::Duration::milliseconds(margin.as_millis() as i64);
    (expires_at - margin - now).to_std().unwrap_or(Duration::ZERO)
}

/// Authenticates a key against the relay and keeps the session fresh.
pub struct SessionManager {
    auth: Arc<dyn AuthService>,
    keypair: Arc<Keypair>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthService>, keypair: Arc<Keypair>, config: SessionConfig) -> Self {
        Self {
            auth,
            keypair,
            config,
        }
    }

    /// Handshake as `role` and start the renewal task. The task stops when
    /// `cancel` fires.
    pub async fn authenticate(
        &self,
        role: Role,
        cancel: CancellationToken,
        errors: ErrorSink,
    ) -> Result<Session, AuthError> {
        let tokens = handshake(self.auth.as_ref(), &self.keypair, role).await?;
        tracing::info!(
            pubkey = %self.keypair.pubkey(),
            ?role,
            expires_at = %tokens.access.expires_at,
            "authenticated"
        );
        let session = Session::new(self.keypair.pubkey(), tokens);

        let renewal = Renewal {
            auth: self.auth.clone(),
            keypair: self.keypair.clone(),
            role,
            session: session.clone(),
            config: self.config.clone(),
            cancel,
            errors,
        };
        tokio::spawn(renewal.run());

        Ok(session)
    }
}

async fn handshake(
    auth: &dyn AuthService,
    keypair: &Keypair,
    role: Role,
) -> Result<AuthTokens, AuthError> {
    let pubkey = keypair.pubkey();
    let challenge = auth
        .generate_auth_challenge(role, &pubkey)
        .await
        .map_err(AuthError::Challenge)?;
    let (message, signature) = keypair.answer_challenge(&challenge);
    auth.generate_auth_tokens(&message, &signature, &pubkey)
        .await
        .map_err(AuthError::TokenExchange)
}

struct Renewal {
    auth: Arc<dyn AuthService>,
    keypair: Arc<Keypair>,
    role: Role,
    session: Session,
    config: SessionConfig,
    cancel: CancellationToken,
    errors: ErrorSink,
}

impl Renewal {
    async fn run(self) {
        let policy = self.config.retry_policy();
        loop {
            // A token shorter-lived than the margin would otherwise renew back-to-back.
            let wait = renewal_delay(
                self.session.expires_at(),
                Utc::now(),
                self.config.renewal_margin(),
            )
            .max(Duration::from_millis(self.config.retry_initial_ms));
            tracing::debug!(?wait, "next token renewal scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let mut failures: u32 = 0;
            loop {
                let renewed = tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    r = self.renew_once() => Some(r),
                };
                let Some(renewed) = renewed else {
                    self.stopped();
                    return;
                };
                match renewed {
                    Ok(()) => break,
                    Err(e) => {
                        failures += 1;
                        // First retry is immediate.
                        let delay = match failures {
                            1 => Duration::ZERO,
                            n => policy.delay_for(n - 1),
                        };
                        tracing::warn!(error = %e, failures, ?delay, "token renewal failed, keeping previous token");
                        self.errors.report(BackgroundError::Auth {
                            task: TASK,
                            source: e,
                        });
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                self.stopped();
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
        self.stopped();
    }

    async fn renew_once(&self) -> Result<(), AuthError> {
        let refresh = self.session.refresh_token();
        if refresh.is_expired(Utc::now()) {
            tracing::info!("refresh token expired, repeating handshake");
            let tokens = handshake(self.auth.as_ref(), &self.keypair, self.role).await?;
            self.session.install_tokens(tokens);
        } else {
            let access = self
                .auth
                .refresh_access_token(&refresh.value)
                .await
                .map_err(AuthError::Refresh)?;
            self.session.install_access(access);
        }
        tracing::info!(expires_at = %self.session.expires_at(), "access token renewed");
        Ok(())
    }

    fn stopped(&self) {
        tracing::info!("token renewal stopped");
        self.errors.report(BackgroundError::Cancelled { task: TASK });
    }
}
