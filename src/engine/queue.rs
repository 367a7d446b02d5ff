use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::retry::with_retry;
use crate::models::dispatch::{QueueEntry, QueueStatus};
use crate::notify::{Notification, NotificationGateway};
use crate::observability::metrics::Metrics;
use crate::store::{QueueStore, StoreError, StoreResult};

/// Holding area for orders that found no eligible driver.
///
/// The queue table is optional; without it every operation degrades to a logged no-op.
pub struct QueueManager {
    store: Option<Arc<dyn QueueStore>>,
    notifier: Arc<dyn NotificationGateway>,
    metrics: Metrics,
    notify_limit: usize,
    retries: u32,
    backoff: Duration,
}

impl QueueManager {
    pub fn new(
        store: Option<Arc<dyn QueueStore>>,
        notifier: Arc<dyn NotificationGateway>,
        metrics: Metrics,
        notify_limit: usize,
    ) -> Self {
        if store.is_none() {
            warn!("queue table not available; unassignable orders will not be held");
        }

        Self {
            store,
            notifier,
            metrics,
            notify_limit,
            retries: 1,
            backoff: Duration::from_millis(100),
        }
    }

    pub fn with_retry_policy(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    /// Ensures a waiting entry exists for the order.
    ///
    /// Returns `true` when the queue holds the order afterwards, `false` when no queue exists.
    pub async fn enqueue(&self, order_id: Uuid) -> StoreResult<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };

        let existing = match self.call("queue_find", || store.find_entry(order_id)).await {
            Ok(existing) => existing,
            Err(StoreError::TableMissing(table)) => {
                warn!(%order_id, table, "queue table missing; skipping enqueue");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        match existing {
            Some(entry) if entry.status == QueueStatus::WaitingForDriver => return Ok(true),
            Some(_) => {
                // Reopened after an earlier assignment; put it back in line.
                if self
                    .call("queue_set_status", || {
                        store.set_entry_status(order_id, QueueStatus::WaitingForDriver)
                    })
                    .await?
                {
                    self.metrics.orders_in_queue.inc();
                }
                return Ok(true);
            }
            None => {}
        }

        let entry = QueueEntry {
            order_id,
            enqueued_at: Utc::now(),
            status: QueueStatus::WaitingForDriver,
        };

        match self.call("queue_insert", || store.insert_entry(entry.clone())).await {
            Ok(inserted) => {
                if inserted {
                    self.metrics.orders_in_queue.inc();
                    info!(%order_id, "order queued until a driver is available");
                }
                Ok(true)
            }
            Err(StoreError::TableMissing(table)) => {
                warn!(%order_id, table, "queue table missing; skipping enqueue");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Waiting entries, oldest first.
    pub async fn list_waiting(&self) -> StoreResult<Vec<QueueEntry>> {
        self.waiting(None).await
    }

    /// Flips the order's entry to `assigned`. No-op without an entry or without a queue.
    pub async fn mark_assigned(&self, order_id: Uuid) -> StoreResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let entry = match self.call("queue_find", || store.find_entry(order_id)).await {
            Ok(entry) => entry,
            Err(StoreError::TableMissing(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        if let Some(entry) = entry {
            if entry.status == QueueStatus::WaitingForDriver
                && self
                    .call("queue_set_status", || {
                        store.set_entry_status(order_id, QueueStatus::Assigned)
                    })
                    .await?
            {
                self.metrics.orders_in_queue.dec();
                info!(%order_id, "queued order taken by a driver");
            }
        }
        Ok(())
    }

    /// Tells a driver who just came online about the oldest waiting orders.
    ///
    /// The driver still has to accept through the guarded acceptance path.
    pub async fn notify_driver_of_queue_on_coming_online(&self, driver_id: Uuid) -> StoreResult<usize> {
        let waiting = self.waiting(Some(self.notify_limit)).await?;

        let mut notified = 0;
        for entry in &waiting {
            let notification = Notification::new(
                "Orders waiting for a driver",
                "An order near you is waiting to be picked up",
            )
            .with("kind", "queued_order_available")
            .with("order_id", entry.order_id)
            .with("enqueued_at", entry.enqueued_at.to_rfc3339());

            match self.notifier.notify(driver_id, notification).await {
                Ok(()) => {
                    notified += 1;
                    self.metrics.notifications_total.with_label_values(&["sent"]).inc();
                }
                Err(err) => {
                    self.metrics.notifications_total.with_label_values(&["failed"]).inc();
                    warn!(%driver_id, order_id = %entry.order_id, error = %err, "queue notification failed");
                }
            }
        }

        if notified > 0 {
            info!(%driver_id, notified, "driver notified of waiting orders");
        }
        Ok(notified)
    }

    async fn waiting(&self, limit: Option<usize>) -> StoreResult<Vec<QueueEntry>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };

        match self.call("queue_list", || store.list_waiting(limit)).await {
            Err(StoreError::TableMissing(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        with_retry(operation, self.retries, self.backoff, call).await
    }
}
