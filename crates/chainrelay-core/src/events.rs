//! Error channel for background tasks.
//!
//! Renewal, connectivity-observer and result-feed tasks never return errors
//! to a caller; they push them here. The channel is bounded: when the
//! consumer falls behind, new errors are logged and dropped instead of
//! blocking the task that raised them.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::{AuthError, TransportError};

/// An error raised by a background task.
#[derive(Debug, Error)]
pub enum BackgroundError {
    #[error("{task}: {source}")]
    Auth {
        task: &'static str,
        #[source]
        source: AuthError,
    },

    #[error("{task}: {source}")]
    Transport {
        task: &'static str,
        #[source]
        source: TransportError,
    },

    /// The task observed cancellation and exited.
    #[error("{task}: stopped by cancellation")]
    Cancelled { task: &'static str },
}

impl BackgroundError {
    pub fn task(&self) -> &'static str {
        match self {
            Self::Auth { task, .. } | Self::Transport { task, .. } | Self::Cancelled { task } => {
                task
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Sending half of the background error channel.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<BackgroundError>,
}

impl ErrorSink {
    /// Create a sink and its receiver with room for `capacity` errors.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BackgroundError>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// A sink whose errors only reach the log.
    pub fn discard() -> Self {
        let (sink, _rx) = Self::channel(1);
        sink
    }

    pub fn report(&self, err: BackgroundError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(err)) => {
                tracing::warn!(task = err.task(), error = %err, "error channel full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(err)) => {
                tracing::debug!(task = err.task(), error = %err, "error channel closed");
            }
        }
    }
}
