//! Streaming result feed.
//!
//! One background task per client keeps a `SubscribeBundleResults` stream
//! open and routes each result to whoever is waiting for that bundle id.
//! Results nobody is waiting for yet go into a bounded buffer that drops the
//! oldest entry when full. A stream failure fails every pending waiter (they
//! retry through the pipeline) and the task resubscribes with backoff.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use chainrelay_core::error::TransportError;
use chainrelay_core::events::{BackgroundError, ErrorSink};
use chainrelay_core::policy::{Backoff, RetryConfig, RetryPolicy};
use chainrelay_core::relay::{CallCredentials, SearcherService};
use chainrelay_core::result::{BundleResult, BundleResultSource};

const TASK: &str = "result-feed";

type Waiter = oneshot::Sender<Result<BundleResult, TransportError>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultFeedConfig {
    /// Unclaimed results kept before the oldest is dropped.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_resubscribe_initial_ms")]
    pub resubscribe_initial_ms: u64,
    #[serde(default = "default_resubscribe_max_ms")]
    pub resubscribe_max_ms: u64,
}

fn default_buffer_capacity() -> usize {
    256
}
fn default_resubscribe_initial_ms() -> u64 {
    500
}
fn default_resubscribe_max_ms() -> u64 {
    30_000
}

impl Default for ResultFeedConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            resubscribe_initial_ms: default_resubscribe_initial_ms(),
            resubscribe_max_ms: default_resubscribe_max_ms(),
        }
    }
}

#[derive(Default)]
struct Routing {
    waiters: HashMap<String, Vec<Waiter>>,
    unclaimed: VecDeque<BundleResult>,
    closed: bool,
}

struct Shared {
    routing: Mutex<Routing>,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Routing> {
        self.routing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, result: BundleResult) {
        let mut routing = self.lock();
        let mut delivered = false;
        if let Some(waiters) = routing.waiters.remove(&result.bundle_id) {
            for waiter in waiters {
                delivered |= waiter.send(Ok(result.clone())).is_ok();
            }
        }
        if delivered {
            return;
        }
        if routing.unclaimed.len() >= self.capacity {
            if let Some(dropped) = routing.unclaimed.pop_front() {
                tracing::warn!(bundle_id = %dropped.bundle_id, "result buffer full, dropping oldest result");
            }
        }
        routing.unclaimed.push_back(result);
    }

    fn fail_waiters(&self, reason: &str) {
        let waiters: Vec<Waiter> = self.lock().waiters.drain().flat_map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(TransportError::Stream(reason.to_string())));
        }
    }

    fn close(&self) {
        let waiters: Vec<Waiter> = {
            let mut routing = self.lock();
            routing.closed = true;
            routing.waiters.drain().flat_map(|(_, w)| w).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(TransportError::Cancelled));
        }
    }
}

/// Handle to the result feed. Cheap to clone.
#[derive(Clone)]
pub struct ResultFeed {
    shared: Arc<Shared>,
}

impl ResultFeed {
    /// Spawn the subscription task. It runs until `cancel` fires.
    pub fn start(
        searcher: Arc<dyn SearcherService>,
        credentials: Arc<dyn CallCredentials>,
        config: ResultFeedConfig,
        cancel: CancellationToken,
        errors: ErrorSink,
    ) -> Self {
        let shared = Arc::new(Shared {
            routing: Mutex::new(Routing::default()),
            capacity: config.buffer_capacity.max(1),
        });
        let task = FeedTask {
            searcher,
            credentials,
            config,
            shared: shared.clone(),
            cancel,
            errors,
        };
        tokio::spawn(task.run());
        Self { shared }
    }

    /// Results received that nobody has claimed yet.
    pub fn unclaimed(&self) -> usize {
        self.shared.lock().unclaimed.len()
    }
}

#[async_trait]
impl BundleResultSource for ResultFeed {
    async fn next_result(&self, bundle_id: &str) -> Result<BundleResult, TransportError> {
        let rx = {
            let mut routing = self.shared.lock();
            if let Some(pos) = routing
                .unclaimed
                .iter()
                .position(|r| r.bundle_id == bundle_id)
            {
                if let Some(result) = routing.unclaimed.remove(pos) {
                    return Ok(result);
                }
            }
            if routing.closed {
                return Err(TransportError::Cancelled);
            }
            let (tx, rx) = oneshot::channel();
            let waiters = routing.waiters.entry(bundle_id.to_string()).or_default();
            waiters.retain(|w| !w.is_closed());
            waiters.push(tx);
            rx
        };
        let mut wait = Wait {
            shared: &self.shared,
            bundle_id,
            rx,
        };
        (&mut wait.rx).await.map_err(|_| TransportError::Closed)?
    }
}

/// A registered waiter; unregisters itself when the caller stops waiting.
struct Wait<'a> {
    shared: &'a Shared,
    bundle_id: &'a str,
    rx: oneshot::Receiver<Result<BundleResult, TransportError>>,
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        self.rx.close();
        let mut routing = self.shared.lock();
        if let Some(waiters) = routing.waiters.get_mut(self.bundle_id) {
            waiters.retain(|w| !w.is_closed());
            if waiters.is_empty() {
                routing.waiters.remove(self.bundle_id);
            }
        }
    }
}

struct FeedTask {
    searcher: Arc<dyn SearcherService>,
    credentials: Arc<dyn CallCredentials>,
    config: ResultFeedConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    errors: ErrorSink,
}

impl FeedTask {
    async fn run(self) {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: u32::MAX,
            backoff: Backoff::Exponential {
                initial_ms: self.config.resubscribe_initial_ms,
                max_ms: self.config.resubscribe_max_ms,
                multiplier: 2.0,
            },
        });
        let mut failures: u32 = 0;

        'subscribe: loop {
            let metadata = self.credentials.metadata();
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => break 'subscribe,
                r = self.searcher.subscribe_bundle_results(&metadata) => r,
            };

            match subscribed {
                Ok(mut stream) => {
                    tracing::info!("subscribed to bundle results");
                    failures = 0;
                    loop {
                        let item = tokio::select! {
                            _ = self.cancel.cancelled() => break 'subscribe,
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(result)) => {
                                tracing::debug!(bundle_id = %result.bundle_id, "bundle result received");
                                self.shared.deliver(result);
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "bundle result stream failed");
                                self.shared.fail_waiters(&e.to_string());
                                self.errors.report(BackgroundError::Transport {
                                    task: TASK,
                                    source: e,
                                });
                                break;
                            }
                            None => {
                                tracing::warn!("bundle result stream ended");
                                self.shared.fail_waiters("stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bundle result subscription failed");
                    self.shared.fail_waiters(&e.to_string());
                    self.errors.report(BackgroundError::Transport {
                        task: TASK,
                        source: e,
                    });
                }
            }

            failures = failures.saturating_add(1);
            let delay = policy.delay_for(failures);
            tokio::select! {
                _ = self.cancel.cancelled() => break 'subscribe,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.shared.close();
        self.errors.report(BackgroundError::Cancelled { task: TASK });
        tracing::info!("result feed stopped");
    }
}
