//! Out-of-band notifications (highlights, private messages).
//!
//! Many producers hold a [`NotificationSender`]; client stream loops take
//! turns as the single consumer of the [`NotificationQueue`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Highlight,
    PrivateMessage,
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub network: String,
    pub window: String,
    pub from: String,
    pub text: String,
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        network: impl Into<String>,
        window: impl Into<String>,
        from: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            window: window.into(),
            from: from.into(),
            text: text.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded FIFO of pending notifications.
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
    rx: Mutex<mpsc::Receiver<Notification>>,
    enqueue_timeout: Duration,
}

impl NotificationQueue {
    /// `capacity` is clamped to at least one.
    pub fn new(capacity: usize, enqueue_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            enqueue_timeout,
        }
    }

    pub fn sender(&self) -> NotificationSender {
        NotificationSender {
            tx: self.tx.clone(),
            timeout: self.enqueue_timeout,
        }
    }

    /// Whether anything is queued. Another consumer may win the race.
    pub fn has_pending(&self) -> bool {
        !self.rx.lock().is_empty()
    }

    /// Dequeue one notification without waiting.
    pub fn next(&self) -> Option<Notification> {
        self.rx.lock().try_recv().ok()
    }

    /// Dequeue everything currently queued.
    pub fn drain(&self) -> Vec<Notification> {
        let mut rx = self.rx.lock();
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }
}

/// Producer handle for a [`NotificationQueue`].
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<Notification>,
    timeout: Duration,
}

impl NotificationSender {
    /// Enqueue, waiting at most the queue's timeout for room.
    pub async fn enqueue(&self, notification: Notification) -> Result<(), QueueError> {
        match self.tx.send_timeout(notification, self.timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(notification)) => Err(QueueError::TimedOut {
                notification,
                timeout: self.timeout,
            }),
            Err(mpsc::error::SendTimeoutError::Closed(notification)) => {
                Err(QueueError::Closed(notification))
            }
        }
    }
}
