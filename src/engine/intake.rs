use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::orchestrator::DispatchOrchestrator;
use crate::models::dispatch::{DispatchOutcome, DispatchTrigger};
use crate::models::event::{ChangeEvent, ChangeRecord};
use crate::models::order::OrderStatus;
use crate::notify::{Notification, NotificationGateway};
use crate::store::{DriverStore, OrderStore};

/// Turns change-feed records into dispatch work.
///
/// Delivery is at-least-once, so every handler is safe to run twice for the same event.
pub struct OrderIntakeListener {
    orchestrator: Arc<DispatchOrchestrator>,
    orders: Arc<dyn OrderStore>,
    drivers: Arc<dyn DriverStore>,
    notifier: Arc<dyn NotificationGateway>,
}

impl OrderIntakeListener {
    pub fn new(
        orchestrator: Arc<DispatchOrchestrator>,
        orders: Arc<dyn OrderStore>,
        drivers: Arc<dyn DriverStore>,
        notifier: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self {
            orchestrator,
            orders,
            drivers,
            notifier,
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut changes: BroadcastStream<ChangeRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("order intake listener started");

        loop {
            tokio::select! {
                next = changes.next() => match next {
                    Some(Ok(record)) => self.spawn_handler(record),
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, "change feed lagged; sweeper will recover missed orders");
                    }
                    None => {
                        warn!("order intake listener stopped: change feed closed");
                        return;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("order intake listener stopped");
    }

    fn spawn_handler(self: &Arc<Self>, record: ChangeRecord) {
        match record.decode() {
            Ok(Some(event)) => {
                let listener = self.clone();
                tokio::spawn(async move {
                    listener.handle(event).await;
                });
            }
            Ok(None) => debug!(table = %record.table, "ignoring irrelevant change"),
            Err(err) => warn!(table = %record.table, error = %err, "dropping malformed change record"),
        }
    }

    /// Handles one decoded event, returning the dispatch outcome when dispatch ran.
    pub async fn handle(&self, event: ChangeEvent) -> Option<DispatchOutcome> {
        match event {
            ChangeEvent::OrderInserted { order_id } => Some(
                self.orchestrator
                    .dispatch(order_id, DispatchTrigger::Inserted)
                    .await,
            ),
            // Releases after a rejection are re-dispatched by the rejection handler itself.
            ChangeEvent::OrderStatusChanged {
                order_id,
                from,
                to: OrderStatus::Pending,
                ..
            } if from != OrderStatus::Pending && from != OrderStatus::Assigned => Some(
                self.orchestrator
                    .dispatch(order_id, DispatchTrigger::Reopened)
                    .await,
            ),
            ChangeEvent::OrderStatusChanged {
                order_id,
                to: OrderStatus::Accepted,
                driver_id: Some(driver_id),
                ..
            } => {
                self.on_accepted(order_id, driver_id).await;
                None
            }
            ChangeEvent::OrderStatusChanged {
                order_id,
                to: OrderStatus::Delivered | OrderStatus::Cancelled,
                driver_id: Some(driver_id),
                ..
            } => {
                if let Err(err) = self.drivers.set_busy(driver_id, false).await {
                    warn!(%order_id, %driver_id, error = %err, "failed to free driver");
                }
                None
            }
            ChangeEvent::OrderStatusChanged { .. } => None,
            ChangeEvent::DriverRejected { order_id, driver_id } => Some(
                self.orchestrator
                    .handle_rejection(order_id, driver_id)
                    .await,
            ),
            ChangeEvent::DriverCameOnline { driver_id } => {
                if let Err(err) = self
                    .orchestrator
                    .queue()
                    .notify_driver_of_queue_on_coming_online(driver_id)
                    .await
                {
                    warn!(%driver_id, error = %err, "failed to offer queued orders");
                }
                None
            }
        }
    }

    async fn on_accepted(&self, order_id: Uuid, driver_id: Uuid) {
        if let Err(err) = self.drivers.set_busy(driver_id, true).await {
            warn!(%order_id, %driver_id, error = %err, "failed to mark driver busy");
        }
        if let Err(err) = self.orchestrator.queue().mark_assigned(order_id).await {
            warn!(%order_id, error = %err, "failed to update queue entry");
        }

        let customer_id = match self.orders.get_order(order_id).await {
            Ok(Some(order)) => order.customer_id,
            Ok(None) => return,
            Err(err) => {
                warn!(%order_id, error = %err, "failed to load order for customer notice");
                return;
            }
        };

        let notice = Notification::new("Order accepted", "Your driver is on the way")
            .with("kind", "order_accepted")
            .with("order_id", order_id)
            .with("driver_id", driver_id);
        if let Err(err) = self.notifier.notify(customer_id, notice).await {
            warn!(%order_id, error = %err, "failed to notify customer of acceptance");
        }

        info!(%order_id, %driver_id, "acceptance processed");
    }
}
