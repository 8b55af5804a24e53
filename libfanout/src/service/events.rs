//! Progress notifications for run observers
//!
//! The event log is the record of what happened; this bus is only a live
//! feed for UIs and notifiers. It is built on `tokio::sync::broadcast`:
//! emitting never blocks, and notifications are dropped when nobody is
//! subscribed or a subscriber lags.
//!
//! # Example
//!
//! ```no_run
//! use libfanout::service::events::{EventBus, Notification};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Ok(notification) = receiver.recv().await {
//!         if let Notification::DestinationFailed { account_id, error, .. } = notification {
//!             eprintln!("{} failed: {}", account_id, error);
//!         }
//!     }
//! });
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::RunState;

pub type NotificationReceiver = broadcast::Receiver<Notification>;

/// Broadcast bus for run progress
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Notification>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` notifications per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> NotificationReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        // Err only means nobody is listening
        let _ = self.sender.send(notification);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Live progress of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    RunStarted {
        run_id: String,
        submission_id: String,
        accounts: Vec<String>,
    },

    DestinationStarted {
        run_id: String,
        account_id: String,
    },

    DestinationCompleted {
        run_id: String,
        account_id: String,
    },

    /// A destination failed for a reason other than cancellation
    DestinationFailed {
        run_id: String,
        account_id: String,
        stage: String,
        error: String,
    },

    DestinationCancelled {
        run_id: String,
        account_id: String,
    },

    RunFinished {
        run_id: String,
        state: RunState,
    },
}
