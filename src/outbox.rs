//! Downstream fan-out over the shared store.
//!
//! Reconciliation and exit handling never talk to other workers directly;
//! they drop work items here. List queues carry `QueueMessage` JSON, the
//! accounting queue is a sorted set scored by ready-time, and notification
//! delivery consumes the profile-notifications queue elsewhere.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::domain::{NotificationCommand, Queue, QueueMessage};
use crate::error::Result;
use crate::store::KvStore;

#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn KvStore>,
}

impl Outbox {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Push a work item onto a list queue.
    pub async fn enqueue(&self, queue: Queue, message: &QueueMessage) -> Result<()> {
        debug!(queue = queue.as_str(), position_id = %message.position_id, "enqueue");
        self.store
            .queue_push(queue.as_str(), &serde_json::to_string(message)?)
            .await
    }

    /// Schedule an accounting settlement entry; the member is the position
    /// id, scored by when it becomes ready.
    pub async fn schedule_accounting(
        &self,
        position_id: &str,
        ready_at: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .zadd(
                Queue::Accounting.as_str(),
                position_id,
                ready_at.timestamp_millis() as f64,
            )
            .await
    }

    /// Hand a user-facing notification command to the delivery pipeline.
    pub async fn notify(&self, command: &NotificationCommand) -> Result<()> {
        self.store
            .queue_push(
                Queue::ProfileNotifications.as_str(),
                &serde_json::to_string(command)?,
            )
            .await
    }

    /// Propagate a lifecycle event to copy-trade followers.
    pub async fn signal(&self, message: &QueueMessage) -> Result<()> {
        self.store
            .queue_push(Queue::Signals.as_str(), &serde_json::to_string(message)?)
            .await
    }
}
