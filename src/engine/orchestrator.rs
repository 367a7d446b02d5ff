use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::locator::DriverLocator;
use crate::engine::queue::QueueManager;
use crate::engine::retry::with_retry;
use crate::engine::scoring::rank_candidates;
use crate::models::dispatch::{
    AcceptOutcome, BroadcastReason, DispatchEvent, DispatchOutcome, DispatchTrigger,
    EscalationReason, Rejection, ScoredCandidate,
};
use crate::models::driver::DriverCandidate;
use crate::models::order::{Order, OrderGuard, OrderPatch, OrderStatus};
use crate::notify::{Alert, AlertChannel, Notification, NotificationGateway};
use crate::observability::metrics::Metrics;
use crate::store::{DriverStore, OrderStore, RejectionStore, StoreResult};

/// External services the orchestrator talks to.
pub struct Collaborators {
    pub orders: Arc<dyn OrderStore>,
    pub drivers: Arc<dyn DriverStore>,
    pub rejections: Arc<dyn RejectionStore>,
    pub queue: Arc<QueueManager>,
    pub notifier: Arc<dyn NotificationGateway>,
    pub alerts: Arc<dyn AlertChannel>,
}

/// Decides, per order, between auto-assignment, broadcast and escalation.
///
/// Every write that hands an order to a driver goes through `OrderStore::update_order_if`, so any
/// number of concurrent cycles for the same order yield at most one driver.
pub struct DispatchOrchestrator {
    orders: Arc<dyn OrderStore>,
    rejections: Arc<dyn RejectionStore>,
    locator: DriverLocator,
    queue: Arc<QueueManager>,
    notifier: Arc<dyn NotificationGateway>,
    alerts: Arc<dyn AlertChannel>,
    config: DispatchConfig,
    metrics: Metrics,
    events_tx: broadcast::Sender<DispatchEvent>,
    /// Rejections the store has not accepted yet, keyed by order.
    unconfirmed_rejections: DashMap<Uuid, Vec<Rejection>>,
}

impl DispatchOrchestrator {
    pub fn new(
        collaborators: Collaborators,
        config: DispatchConfig,
        metrics: Metrics,
        event_buffer_size: usize,
    ) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        Self {
            orders: collaborators.orders,
            rejections: collaborators.rejections,
            locator: DriverLocator::new(collaborators.drivers),
            queue: collaborators.queue,
            notifier: collaborators.notifier,
            alerts: collaborators.alerts,
            config,
            metrics,
            events_tx,
            unconfirmed_rejections: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events_tx.subscribe()
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    /// Runs one dispatch cycle for the order.
    pub async fn dispatch(&self, order_id: Uuid, trigger: DispatchTrigger) -> DispatchOutcome {
        let start = Instant::now();
        let outcome = self.run_cycle(order_id, trigger, &[]).await;
        self.finish(order_id, trigger, &outcome, start);
        outcome
    }

    /// Records a driver's decline and re-dispatches the order without that driver.
    pub async fn handle_rejection(&self, order_id: Uuid, driver_id: Uuid) -> DispatchOutcome {
        let start = Instant::now();

        let rejection = Rejection {
            order_id,
            driver_id,
            rejected_at: Utc::now(),
        };
        self.persist_rejection(rejection).await;

        let held_by_rejecter = OrderGuard::held_by(driver_id, OrderStatus::Assigned);
        match self
            .retrying("release_assignment", || {
                self.orders
                    .update_order_if(order_id, &held_by_rejecter, OrderPatch::release())
            })
            .await
        {
            Ok(true) => info!(%order_id, %driver_id, "assigned driver rejected; assignment released"),
            Ok(false) => {}
            Err(err) => {
                // The sweeper releases orders still held by a rejecter.
                self.collaborator_failed("release_assignment", order_id, &err);
                let outcome = DispatchOutcome::Skipped {
                    reason: "assignment release failed; left for the sweeper".to_string(),
                };
                self.finish(order_id, DispatchTrigger::Rejection, &outcome, start);
                return outcome;
            }
        }

        info!(%order_id, %driver_id, "driver rejected order; re-dispatching");
        let outcome = self
            .run_cycle(order_id, DispatchTrigger::Rejection, &[driver_id])
            .await;
        self.finish(order_id, DispatchTrigger::Rejection, &outcome, start);
        outcome
    }

    /// Lets a driver claim an order they were assigned or offered.
    ///
    /// Losing to another driver or to a cancellation is reported as `AlreadyTaken`.
    pub async fn accept(&self, order_id: Uuid, driver_id: Uuid) -> StoreResult<AcceptOutcome> {
        let rejections = self
            .retrying("rejections_for", || self.rejections.rejections_for(order_id))
            .await?;
        if rejections.iter().any(|r| r.driver_id == driver_id)
            || self.unconfirmed_rejecters(order_id).contains(&driver_id)
        {
            info!(%order_id, %driver_id, "acceptance declined: driver rejected this order");
            return Ok(AcceptOutcome::Declined);
        }

        let assigned_to_driver = OrderGuard::held_by(driver_id, OrderStatus::Assigned);
        let from_assignment = self
            .retrying("accept_assigned", || {
                self.orders
                    .update_order_if(order_id, &assigned_to_driver, OrderPatch::accept(driver_id))
            })
            .await?;

        let unclaimed = OrderGuard::unclaimed();
        let accepted = from_assignment
            || self
                .retrying("accept_offer", || {
                    self.orders
                        .update_order_if(order_id, &unclaimed, OrderPatch::accept(driver_id))
                })
                .await?;

        if accepted {
            info!(%order_id, %driver_id, "order accepted");
            Ok(AcceptOutcome::Accepted)
        } else {
            info!(%order_id, %driver_id, "late acceptance ignored; order no longer available");
            Ok(AcceptOutcome::AlreadyTaken)
        }
    }

    /// Retries rejections whose write failed earlier. Returns how many were stored.
    pub async fn flush_unconfirmed_rejections(&self) -> usize {
        let held: Vec<Rejection> = self
            .unconfirmed_rejections
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();

        let mut stored = 0;
        for rejection in held {
            if self.persist_rejection(rejection).await {
                stored += 1;
            }
        }
        stored
    }

    /// Releases and re-dispatches every order still assigned to a driver who rejected it.
    pub async fn reconcile_rejected_assignments(
        &self,
    ) -> StoreResult<Vec<(Uuid, DispatchOutcome)>> {
        let assigned = self
            .retrying("list_assigned", || self.orders.list_assigned())
            .await?;

        let mut outcomes = Vec::new();
        for order in assigned {
            let Some(driver_id) = order.driver_id else {
                continue;
            };
            if self.excluded_drivers(order.id, &[]).await.contains(&driver_id) {
                warn!(order_id = %order.id, %driver_id, "order still held by a driver who rejected it");
                outcomes.push((order.id, self.handle_rejection(order.id, driver_id).await));
            }
        }
        Ok(outcomes)
    }

    async fn run_cycle(
        &self,
        order_id: Uuid,
        trigger: DispatchTrigger,
        extra_excluded: &[Uuid],
    ) -> DispatchOutcome {
        let radius = match trigger {
            DispatchTrigger::Rejection => self.config.rejection_radius_miles,
            _ => self.config.search_radius_miles,
        };
        let unclaimed = OrderGuard::unclaimed();
        let mut races_lost = 0;

        loop {
            let fallback_excluded: HashSet<Uuid> = extra_excluded.iter().copied().collect();

            let order = match self.retrying("get_order", || self.orders.get_order(order_id)).await {
                Ok(Some(order)) => order,
                Ok(None) => {
                    return DispatchOutcome::Skipped {
                        reason: "order not found".to_string(),
                    };
                }
                Err(err) => {
                    // Nothing was read, so only a pending order may be escalated from here.
                    self.collaborator_failed("get_order", order_id, &err);
                    return self
                        .broadcast_to_online(
                            order_id,
                            OrderStatus::Pending,
                            &fallback_excluded,
                            BroadcastReason::CollaboratorFailure,
                        )
                        .await;
                }
            };

            if !order.is_unclaimed() {
                return DispatchOutcome::Skipped {
                    reason: format!("order is {}", order.status),
                };
            }

            // Escalated orders wait for a driver to accept from the queue; only a rejection
            // re-runs the search for them.
            if order.status == OrderStatus::NoDriversAvailable
                && trigger != DispatchTrigger::Rejection
            {
                return DispatchOutcome::Skipped {
                    reason: "order already escalated".to_string(),
                };
            }

            let excluded = self.excluded_drivers(order_id, extra_excluded).await;

            let Some(pickup) = order.pickup else {
                return self
                    .broadcast_to_online(order_id, order.status, &excluded, BroadcastReason::NoCoordinates)
                    .await;
            };

            let candidates = match self
                .retrying("find_candidates", || self.locator.find_candidates(&pickup, radius))
                .await
            {
                Ok(candidates) => candidates,
                Err(err) => {
                    self.collaborator_failed("find_candidates", order_id, &err);
                    return self
                        .broadcast_to_online(
                            order_id,
                            order.status,
                            &excluded,
                            BroadcastReason::CollaboratorFailure,
                        )
                        .await;
                }
            };

            let candidates: Vec<DriverCandidate> = candidates
                .into_iter()
                .filter(|c| !excluded.contains(&c.driver_id))
                .collect();

            if candidates.is_empty() {
                if trigger == DispatchTrigger::Rejection {
                    return self
                        .escalate(order_id, order.status, &excluded, EscalationReason::NoAlternativeDriver)
                        .await;
                }
                return self
                    .broadcast_to_online(order_id, order.status, &excluded, BroadcastReason::OutsideRadius)
                    .await;
            }

            let ranked = rank_candidates(&candidates, &order);
            let best = ranked[0].clone();

            if best.score <= self.config.auto_assign_threshold {
                return self.broadcast_ranked(order_id, ranked, BroadcastReason::BelowThreshold).await;
            }

            match self
                .retrying("assign_order", || {
                    self.orders
                        .update_order_if(order_id, &unclaimed, OrderPatch::assign(best.driver_id))
                })
                .await
            {
                Ok(true) => return self.on_assigned(&order, best).await,
                Ok(false) => {
                    races_lost += 1;
                    self.metrics.assignment_races_lost_total.inc();
                    info!(%order_id, driver_id = %best.driver_id, races_lost, "assignment race lost");
                    if races_lost >= self.config.max_assign_attempts {
                        return self
                            .broadcast_ranked(order_id, ranked, BroadcastReason::AssignRacesExhausted)
                            .await;
                    }
                }
                Err(err) => {
                    self.collaborator_failed("assign_order", order_id, &err);
                    return self
                        .broadcast_to_online(
                            order_id,
                            order.status,
                            &excluded,
                            BroadcastReason::CollaboratorFailure,
                        )
                        .await;
                }
            }
        }
    }

    async fn excluded_drivers(&self, order_id: Uuid, extra: &[Uuid]) -> HashSet<Uuid> {
        let mut excluded: HashSet<Uuid> = extra.iter().copied().collect();
        match self
            .retrying("rejections_for", || self.rejections.rejections_for(order_id))
            .await
        {
            Ok(rows) => excluded.extend(rows.into_iter().map(|r| r.driver_id)),
            Err(err) => self.collaborator_failed("rejections_for", order_id, &err),
        }
        excluded.extend(self.unconfirmed_rejecters(order_id));
        excluded
    }

    async fn on_assigned(&self, order: &Order, candidate: ScoredCandidate) -> DispatchOutcome {
        let driver_id = candidate.driver_id;
        info!(
            order_id = %order.id,
            %driver_id,
            score = candidate.score,
            "order auto-assigned"
        );

        let driver_notice = Notification::new(
            "New delivery assigned",
            format!("Pickup at {}", order.pickup_address),
        )
        .with("kind", "order_assigned")
        .with("order_id", order.id);
        let customer_notice = Notification::new(
            "Driver assigned",
            "A driver has been assigned to your order",
        )
        .with("kind", "driver_assigned")
        .with("order_id", order.id)
        .with("driver_id", driver_id);

        join_all([
            self.send(driver_id, driver_notice),
            self.send(order.customer_id, customer_notice),
        ])
        .await;

        if let Err(err) = self.queue.mark_assigned(order.id).await {
            warn!(order_id = %order.id, error = %err, "failed to update queue entry");
        }
        self.record_attempt(order.id).await;

        DispatchOutcome::AutoAssigned {
            driver_id,
            candidate,
        }
    }

    async fn broadcast_ranked(
        &self,
        order_id: Uuid,
        ranked: Vec<ScoredCandidate>,
        reason: BroadcastReason,
    ) -> DispatchOutcome {
        let recipients: Vec<Uuid> = ranked
            .into_iter()
            .take(self.config.broadcast_fanout)
            .map(|c| c.driver_id)
            .collect();
        self.broadcast(order_id, recipients, reason).await
    }

    /// Offers the order to every online driver, escalating when nobody is online at all.
    async fn broadcast_to_online(
        &self,
        order_id: Uuid,
        read_status: OrderStatus,
        excluded: &HashSet<Uuid>,
        reason: BroadcastReason,
    ) -> DispatchOutcome {
        match self.retrying("online_drivers", || self.locator.online_drivers()).await {
            Ok(drivers) => {
                let recipients: Vec<Uuid> = drivers
                    .into_iter()
                    .map(|d| d.driver_id)
                    .filter(|id| !excluded.contains(id))
                    .collect();
                if recipients.is_empty() {
                    return self
                        .escalate(order_id, read_status, excluded, EscalationReason::NoDriversAvailable)
                        .await;
                }
                self.broadcast(order_id, recipients, reason).await
            }
            Err(err) => {
                // Left pending without a recorded attempt so the next sweep picks it up.
                self.collaborator_failed("online_drivers", order_id, &err);
                DispatchOutcome::Broadcasted {
                    recipients: Vec::new(),
                    reason: BroadcastReason::CollaboratorFailure,
                }
            }
        }
    }

    async fn broadcast(
        &self,
        order_id: Uuid,
        recipients: Vec<Uuid>,
        reason: BroadcastReason,
    ) -> DispatchOutcome {
        let offer = Notification::new("New order available", "Accept it before someone else does")
            .with("kind", "order_available")
            .with("order_id", order_id);

        join_all(
            recipients
                .iter()
                .map(|driver_id| self.send(*driver_id, offer.clone())),
        )
        .await;
        self.record_attempt(order_id).await;

        info!(%order_id, recipients = recipients.len(), ?reason, "order broadcast to drivers");
        DispatchOutcome::Broadcasted { recipients, reason }
    }

    /// Parks the order as `no_drivers_available`, queues it, pages every approved driver and
    /// alerts an operator.
    ///
    /// The write is guarded on the status this cycle read, so of two cycles that both saw the
    /// order pending only the first escalates and alerts.
    async fn escalate(
        &self,
        order_id: Uuid,
        read_status: OrderStatus,
        excluded: &HashSet<Uuid>,
        reason: EscalationReason,
    ) -> DispatchOutcome {
        let unchanged_since_read = OrderGuard::unassigned_in(read_status);
        match self
            .retrying("mark_no_drivers", || {
                self.orders.update_order_if(
                    order_id,
                    &unchanged_since_read,
                    OrderPatch::unassigned(OrderStatus::NoDriversAvailable),
                )
            })
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return DispatchOutcome::Skipped {
                    reason: "order changed during escalation".to_string(),
                };
            }
            Err(err) => self.collaborator_failed("mark_no_drivers", order_id, &err),
        }

        let held = match self.queue.enqueue(order_id).await {
            Ok(held) => held,
            Err(err) => {
                self.collaborator_failed("enqueue", order_id, &err);
                false
            }
        };

        let approved = match self.retrying("approved_drivers", || self.locator.approved_drivers()).await {
            Ok(drivers) => drivers
                .into_iter()
                .map(|d| d.driver_id)
                .filter(|id| !excluded.contains(id))
                .collect(),
            Err(err) => {
                self.collaborator_failed("approved_drivers", order_id, &err);
                Vec::new()
            }
        };

        let page = Notification::new(
            "Order waiting for a driver",
            "No nearby driver is online. Go online to take this order",
        )
        .with("kind", "order_needs_driver")
        .with("order_id", order_id);
        join_all(approved.iter().map(|driver_id| self.send(*driver_id, page.clone()))).await;

        let mut metadata = BTreeMap::new();
        metadata.insert("order_id".to_string(), order_id.to_string());
        metadata.insert("queued".to_string(), held.to_string());
        let alert = Alert {
            title: reason.alert_title().to_string(),
            message: match reason {
                EscalationReason::NoDriversAvailable => {
                    format!("Order {order_id} found no eligible driver")
                }
                EscalationReason::NoAlternativeDriver => {
                    format!("Order {order_id} was rejected and no alternative driver is available")
                }
            },
            metadata,
        };
        if let Err(err) = self.alerts.alert(alert).await {
            error!(%order_id, error = %err, "failed to raise operator alert");
        }

        self.record_attempt(order_id).await;
        warn!(%order_id, ?reason, queued = held, "order escalated");

        if held {
            DispatchOutcome::Queued {
                reason,
                alerted_drivers: approved.len(),
            }
        } else {
            DispatchOutcome::Escalated {
                reason,
                alerted_drivers: approved.len(),
            }
        }
    }

    /// Stores the rejection, keeping it in memory until the store accepts it.
    async fn persist_rejection(&self, rejection: Rejection) -> bool {
        let order_id = rejection.order_id;
        let driver_id = rejection.driver_id;
        let result = self
            .retrying("record_rejection", || self.rejections.record_rejection(rejection.clone()))
            .await;

        match result {
            Ok(()) => {
                self.forget_unconfirmed(order_id, driver_id);
                true
            }
            Err(err) => {
                self.collaborator_failed("record_rejection", order_id, &err);
                let mut held = self.unconfirmed_rejections.entry(order_id).or_default();
                if !held.iter().any(|r| r.driver_id == driver_id) {
                    held.push(rejection);
                }
                false
            }
        }
    }

    fn forget_unconfirmed(&self, order_id: Uuid, driver_id: Uuid) {
        if let Some(mut held) = self.unconfirmed_rejections.get_mut(&order_id) {
            held.retain(|r| r.driver_id != driver_id);
        }
        self.unconfirmed_rejections
            .remove_if(&order_id, |_, held| held.is_empty());
    }

    fn unconfirmed_rejecters(&self, order_id: Uuid) -> Vec<Uuid> {
        self.unconfirmed_rejections
            .get(&order_id)
            .map(|held| held.iter().map(|r| r.driver_id).collect())
            .unwrap_or_default()
    }

    async fn send(&self, target: Uuid, notification: Notification) -> bool {
        let result = with_retry(
            "notify",
            self.config.collaborator_retries,
            self.config.retry_backoff,
            || self.notifier.notify(target, notification.clone()),
        )
        .await;

        match result {
            Ok(()) => {
                self.metrics.notifications_total.with_label_values(&["sent"]).inc();
                true
            }
            Err(err) => {
                self.metrics.notifications_total.with_label_values(&["failed"]).inc();
                warn!(target_id = %target, error = %err, "notification failed");
                false
            }
        }
    }

    async fn record_attempt(&self, order_id: Uuid) {
        if let Err(err) = self
            .retrying("record_attempt", || self.orders.record_dispatch_attempt(order_id, Utc::now()))
            .await
        {
            warn!(%order_id, error = %err, "failed to record dispatch attempt");
        }
    }

    async fn retrying<T, F, Fut>(&self, operation: &'static str, call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        with_retry(
            operation,
            self.config.collaborator_retries,
            self.config.retry_backoff,
            call,
        )
        .await
    }

    fn collaborator_failed(&self, operation: &str, order_id: Uuid, err: &dyn std::fmt::Display) {
        self.metrics
            .collaborator_failures_total
            .with_label_values(&[operation])
            .inc();
        error!(%order_id, operation, error = %err, "collaborator call failed; falling back");
    }

    fn finish(
        &self,
        order_id: Uuid,
        trigger: DispatchTrigger,
        outcome: &DispatchOutcome,
        start: Instant,
    ) {
        let label = outcome.label();
        self.metrics
            .dispatch_latency_seconds
            .with_label_values(&[label])
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .dispatch_outcomes_total
            .with_label_values(&[label])
            .inc();

        info!(%order_id, ?trigger, outcome = label, "dispatch cycle finished");

        let _ = self.events_tx.send(DispatchEvent {
            order_id,
            trigger,
            outcome: outcome.clone(),
            decided_at: Utc::now(),
        });
    }
}
