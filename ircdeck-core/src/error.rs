//! Error types for the core.
//!
//! None of these are fatal: callers log them and degrade to "skip this
//! cycle" or "render empty".

use std::time::Duration;

use thiserror::Error;

use crate::notify::Notification;

/// Failure pushing fragments to a client transport.
#[derive(Debug, Error)]
pub enum PushError {
    /// The client went away; the stream should close.
    #[error("client stream closed")]
    Closed,
    /// The write did not complete within the transport's bound.
    #[error("push timed out after {0:?}")]
    TimedOut(Duration),
}

/// Failure enqueueing a notification. Carries the dropped notification so
/// the producer can count and log it.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("notification queue full for {timeout:?}, dropping")]
    TimedOut {
        notification: Notification,
        timeout: Duration,
    },
    #[error("notification queue closed")]
    Closed(Notification),
}

impl QueueError {
    pub fn into_notification(self) -> Notification {
        match self {
            QueueError::TimedOut { notification, .. } => notification,
            QueueError::Closed(notification) => notification,
        }
    }
}

/// Failure issuing a command through the backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown server: {0}")]
    UnknownServer(String),
    #[error("server {0} is not connected")]
    NotConnected(String),
    #[error("server {0} already exists")]
    DuplicateServer(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
