use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use order_dispatch::config::Config;
use order_dispatch::engine::orchestrator::{Collaborators, DispatchOrchestrator};
use order_dispatch::engine::sweeper::{BackgroundSweeper, MaintenanceHook};
use order_dispatch::geo::offset_north;
use order_dispatch::models::dispatch::{
    AcceptOutcome, BroadcastReason, DispatchOutcome, DispatchTrigger, EscalationReason,
};
use order_dispatch::models::driver::{Driver, GeoPoint};
use order_dispatch::models::event::ChangeEvent;
use order_dispatch::models::order::{Order, OrderGuard, OrderPatch, OrderStatus};
use order_dispatch::notify::{Notification, NotificationRecord};
use order_dispatch::state::AppState;
use order_dispatch::store::memory::{MemoryStore, StoreOp};
use order_dispatch::store::{DriverStore, OrderStore, RejectionStore, StoreResult};

const LOUISVILLE: GeoPoint = GeoPoint {
    lat: 38.2527,
    lng: -85.7585,
};

fn config() -> Config {
    let mut config = Config::default();
    config.dispatch.retry_backoff = Duration::ZERO;
    config
}

fn setup() -> AppState {
    AppState::new(&config())
}

async fn add_driver(
    state: &AppState,
    location: Option<GeoPoint>,
    online: bool,
    rating: Option<f64>,
) -> Driver {
    let driver = Driver {
        id: Uuid::new_v4(),
        name: "driver".to_string(),
        location,
        is_online: online,
        is_approved: true,
        onboarding_completed: true,
        rating,
        is_busy: false,
        updated_at: Utc::now(),
    };
    state.store.upsert_driver(driver).await.unwrap()
}

async fn add_driver_at(state: &AppState, miles: f64, rating: f64) -> Driver {
    add_driver(state, Some(offset_north(&LOUISVILLE, miles)), true, Some(rating)).await
}

async fn add_order(state: &AppState, pickup: Option<GeoPoint>) -> Order {
    let order = Order::new(
        Uuid::new_v4(),
        "101 W Main St",
        "500 S 4th St",
        pickup,
        None,
        31.5,
    );
    state.store.insert_order(order).await.unwrap()
}

async fn load(state: &AppState, id: Uuid) -> Order {
    state.store.get_order(id).await.unwrap().unwrap()
}

fn kinds_for(state: &AppState, target: Uuid) -> Vec<String> {
    state
        .notifier
        .delivered_to(target)
        .into_iter()
        .filter_map(|n| n.kind().map(str::to_string))
        .collect()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn nearby_top_rated_driver_is_auto_assigned() {
    let state = setup();
    let driver = add_driver_at(&state, 2.0, 4.8).await;
    let order = add_order(&state, Some(LOUISVILLE)).await;

    let outcome = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;

    let DispatchOutcome::AutoAssigned {
        driver_id,
        candidate,
    } = outcome
    else {
        panic!("expected auto-assignment, got {outcome:?}");
    };
    assert_eq!(driver_id, driver.id);
    assert!((candidate.breakdown.distance_score - 0.867).abs() < 0.01);
    assert!((candidate.breakdown.rating_score - 0.96).abs() < 1e-9);
    assert_eq!(candidate.breakdown.availability_score, 1.0);
    assert_eq!(candidate.breakdown.workload_score, 1.0);
    assert!(candidate.score > 0.7);

    let stored = load(&state, order.id).await;
    assert_eq!(stored.status, OrderStatus::Assigned);
    assert_eq!(stored.driver_id, Some(driver.id));
    assert!(stored.assigned_at.is_some());

    assert_eq!(kinds_for(&state, driver.id), vec!["order_assigned"]);
    assert_eq!(kinds_for(&state, order.customer_id), vec!["driver_assigned"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatches_assign_exactly_one_driver() {
    let state = Arc::new(setup());
    for miles in [1.0, 1.5, 2.0] {
        add_driver_at(&state, miles, 5.0).await;
    }
    let order_id = add_order(&state, Some(LOUISVILLE)).await.id;

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let orchestrator = state.orchestrator.clone();
            let trigger = if i % 2 == 0 {
                DispatchTrigger::Inserted
            } else {
                DispatchTrigger::Sweep
            };
            tokio::spawn(async move { orchestrator.dispatch(order_id, trigger).await })
        })
        .collect();

    let mut assigned = Vec::new();
    for handle in handles {
        if let DispatchOutcome::AutoAssigned { driver_id, .. } = handle.await.unwrap() {
            assigned.push(driver_id);
        }
    }

    assert_eq!(assigned.len(), 1);
    let stored = load(&state, order_id).await;
    assert_eq!(stored.driver_id, Some(assigned[0]));
    assert_eq!(stored.status, OrderStatus::Assigned);
}

#[tokio::test]
async fn weak_candidates_get_broadcast_to_top_five() {
    let state = setup();
    let mut drivers = Vec::new();
    for _ in 0..7 {
        drivers.push(add_driver_at(&state, 12.0, 3.0).await);
    }
    let order = add_order(&state, Some(LOUISVILLE)).await;

    let outcome = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;

    let DispatchOutcome::Broadcasted { recipients, reason } = outcome else {
        panic!("expected broadcast, got {outcome:?}");
    };
    assert_eq!(reason, BroadcastReason::BelowThreshold);
    assert_eq!(recipients.len(), 5);

    let stored = load(&state, order.id).await;
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(stored.driver_id, None);
    assert_eq!(stored.dispatch_attempts, 1);
    assert!(stored.last_dispatched_at.is_some());

    let first = state.orchestrator.accept(order.id, recipients[0]).await.unwrap();
    let second = state.orchestrator.accept(order.id, recipients[1]).await.unwrap();
    assert_eq!(first, AcceptOutcome::Accepted);
    assert_eq!(second, AcceptOutcome::AlreadyTaken);

    let stored = load(&state, order.id).await;
    assert_eq!(stored.status, OrderStatus::Accepted);
    assert_eq!(stored.driver_id, Some(recipients[0]));
}

#[tokio::test]
async fn order_without_coordinates_goes_to_all_online_drivers() {
    let state = setup();
    let a = add_driver_at(&state, 1.0, 4.9).await;
    let b = add_driver_at(&state, 40.0, 4.0).await;
    let c = add_driver(&state, None, true, None).await;
    let offline = add_driver(&state, Some(LOUISVILLE), false, Some(5.0)).await;
    let order = add_order(&state, None).await;

    let outcome = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;

    let DispatchOutcome::Broadcasted { recipients, reason } = outcome else {
        panic!("expected broadcast, got {outcome:?}");
    };
    assert_eq!(reason, BroadcastReason::NoCoordinates);
    let recipients: HashSet<Uuid> = recipients.into_iter().collect();
    assert_eq!(recipients, HashSet::from([a.id, b.id, c.id]));
    assert!(!recipients.contains(&offline.id));
}

#[tokio::test]
async fn online_drivers_outside_radius_still_hear_about_the_order() {
    let state = setup();
    let far = add_driver_at(&state, 30.0, 5.0).await;
    let order = add_order(&state, Some(LOUISVILLE)).await;

    let outcome = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;

    assert_eq!(
        outcome,
        DispatchOutcome::Broadcasted {
            recipients: vec![far.id],
            reason: BroadcastReason::OutsideRadius,
        }
    );
    assert_eq!(load(&state, order.id).await.status, OrderStatus::Pending);
}

#[tokio::test]
async fn no_online_drivers_escalates_once() {
    let state = setup();
    let offline = add_driver(&state, Some(LOUISVILLE), false, Some(4.5)).await;
    let order = add_order(&state, Some(LOUISVILLE)).await;

    let outcome = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;
    assert_eq!(
        outcome,
        DispatchOutcome::Queued {
            reason: EscalationReason::NoDriversAvailable,
            alerted_drivers: 1,
        }
    );

    // A duplicated insert event must not escalate again.
    let again = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;
    assert!(matches!(again, DispatchOutcome::Skipped { .. }));

    assert_eq!(
        load(&state, order.id).await.status,
        OrderStatus::NoDriversAvailable
    );
    let waiting = state.orchestrator.queue().list_waiting().await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].order_id, order.id);

    let alerts = state.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].title, "No drivers available");
    assert_eq!(kinds_for(&state, offline.id), vec!["order_needs_driver"]);
}

#[tokio::test]
async fn escalation_without_queue_table_still_marks_and_alerts() {
    let mut config = config();
    config.queue_table_enabled = false;
    let state = AppState::new(&config);
    let order = add_order(&state, Some(LOUISVILLE)).await;

    let outcome = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;

    assert_eq!(
        outcome,
        DispatchOutcome::Escalated {
            reason: EscalationReason::NoDriversAvailable,
            alerted_drivers: 0,
        }
    );
    assert_eq!(
        load(&state, order.id).await.status,
        OrderStatus::NoDriversAvailable
    );
    assert_eq!(state.alerts.alerts().len(), 1);
}

#[tokio::test]
async fn rejection_widens_radius_and_never_reoffers_the_rejecter() {
    let state = setup();
    let near = add_driver_at(&state, 2.0, 4.8).await;
    let wider = add_driver_at(&state, 17.0, 5.0).await;
    let order = add_order(&state, Some(LOUISVILLE)).await;

    let first = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;
    assert!(matches!(first, DispatchOutcome::AutoAssigned { driver_id, .. } if driver_id == near.id));

    let outcome = state.orchestrator.handle_rejection(order.id, near.id).await;
    assert_eq!(
        outcome,
        DispatchOutcome::Broadcasted {
            recipients: vec![wider.id],
            reason: BroadcastReason::BelowThreshold,
        }
    );

    let stored = load(&state, order.id).await;
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(stored.driver_id, None);

    // A later sweep of the same order still leaves the rejecter out.
    let sweep = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Sweep)
        .await;
    assert!(matches!(sweep, DispatchOutcome::Broadcasted { ref recipients, .. } if !recipients.contains(&near.id)));

    assert_eq!(
        state.orchestrator.accept(order.id, near.id).await.unwrap(),
        AcceptOutcome::Declined
    );
    assert_eq!(
        state.orchestrator.accept(order.id, wider.id).await.unwrap(),
        AcceptOutcome::Accepted
    );
}

#[tokio::test]
async fn rejection_with_no_alternative_escalates() {
    let state = setup();
    let only = add_driver_at(&state, 1.0, 4.9).await;
    let order = add_order(&state, Some(LOUISVILLE)).await;
    state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;

    let outcome = state.orchestrator.handle_rejection(order.id, only.id).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Queued {
            reason: EscalationReason::NoAlternativeDriver,
            alerted_drivers: 0,
        }
    );
    let stored = load(&state, order.id).await;
    assert_eq!(stored.status, OrderStatus::NoDriversAvailable);
    assert_eq!(stored.driver_id, None);

    let alerts = state.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].title, "No alternative driver");
}

/// Order store whose reads stall after taking their snapshot, so overlapping cycles act on the
/// same row.
struct StallingReads {
    inner: Arc<MemoryStore>,
    stall: Duration,
}

#[async_trait]
impl OrderStore for StallingReads {
    async fn insert_order(&self, order: Order) -> StoreResult<Order> {
        self.inner.insert_order(order).await
    }

    async fn get_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        let order = self.inner.get_order(order_id).await;
        tokio::time::sleep(self.stall).await;
        order
    }

    async fn update_order_if(
        &self,
        order_id: Uuid,
        guard: &OrderGuard,
        patch: OrderPatch,
    ) -> StoreResult<bool> {
        self.inner.update_order_if(order_id, guard, patch).await
    }

    async fn record_dispatch_attempt(&self, order_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.record_dispatch_attempt(order_id, at).await
    }

    async fn list_stale_pending(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Order>> {
        self.inner.list_stale_pending(cutoff).await
    }

    async fn list_assigned(&self) -> StoreResult<Vec<Order>> {
        self.inner.list_assigned().await
    }
}

#[tokio::test]
async fn overlapping_escalations_alert_once() {
    let state = setup();
    let order = add_order(&state, Some(LOUISVILLE)).await;
    let orchestrator = DispatchOrchestrator::new(
        Collaborators {
            orders: Arc::new(StallingReads {
                inner: state.store.clone(),
                stall: Duration::from_millis(20),
            }),
            drivers: state.store.clone(),
            rejections: state.store.clone(),
            queue: state.orchestrator.queue().clone(),
            notifier: state.notifier.clone(),
            alerts: state.alerts.clone(),
        },
        config().dispatch,
        state.metrics.clone(),
        64,
    );

    let (inserted, swept) = tokio::join!(
        orchestrator.dispatch(order.id, DispatchTrigger::Inserted),
        orchestrator.dispatch(order.id, DispatchTrigger::Sweep),
    );

    let outcomes = [inserted, swept];
    let queued = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Queued { .. }))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Skipped { .. }))
        .count();
    assert_eq!(queued, 1);
    assert_eq!(skipped, 1);

    assert_eq!(state.alerts.alerts().len(), 1);
    assert_eq!(state.orchestrator.queue().list_waiting().await.unwrap().len(), 1);
    assert_eq!(
        load(&state, order.id).await.status,
        OrderStatus::NoDriversAvailable
    );
}

#[tokio::test]
async fn failed_release_is_finished_by_the_next_sweep() {
    let state = setup();
    let rejecter = add_driver_at(&state, 1.0, 4.9).await;
    let order = add_order(&state, Some(LOUISVILLE)).await;
    let first = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;
    assert!(matches!(first, DispatchOutcome::AutoAssigned { driver_id, .. } if driver_id == rejecter.id));
    let backup = add_driver_at(&state, 2.0, 4.8).await;

    state.store.fail_next(StoreOp::UpdateOrder, 2);
    let outcome = state.orchestrator.handle_rejection(order.id, rejecter.id).await;

    assert!(matches!(outcome, DispatchOutcome::Skipped { .. }));
    let stuck = load(&state, order.id).await;
    assert_eq!(stuck.status, OrderStatus::Assigned);
    assert_eq!(stuck.driver_id, Some(rejecter.id));

    let report = state.sweeper.sweep_once(Utc::now()).await.unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].0, order.id);
    assert!(matches!(report.outcomes[0].1, DispatchOutcome::AutoAssigned { driver_id, .. } if driver_id == backup.id));
    let stored = load(&state, order.id).await;
    assert_eq!(stored.status, OrderStatus::Assigned);
    assert_eq!(stored.driver_id, Some(backup.id));
}

#[tokio::test]
async fn unstored_rejection_still_excludes_the_rejecter() {
    let state = setup();
    let rejecter = add_driver(&state, Some(LOUISVILLE), true, Some(4.9)).await;
    let other = add_driver(&state, Some(LOUISVILLE), true, Some(4.2)).await;
    let order = add_order(&state, None).await;
    state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;

    state.store.fail_next(StoreOp::Rejections, 2);
    let outcome = state.orchestrator.handle_rejection(order.id, rejecter.id).await;
    assert_eq!(
        outcome,
        DispatchOutcome::Broadcasted {
            recipients: vec![other.id],
            reason: BroadcastReason::NoCoordinates,
        }
    );
    assert!(state.store.rejections_for(order.id).await.unwrap().is_empty());

    let sweep = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Sweep)
        .await;
    assert_eq!(
        sweep,
        DispatchOutcome::Broadcasted {
            recipients: vec![other.id],
            reason: BroadcastReason::NoCoordinates,
        }
    );
    assert_eq!(
        state.orchestrator.accept(order.id, rejecter.id).await.unwrap(),
        AcceptOutcome::Declined
    );

    // The next sweep gets the rejection into the store.
    let report = state.sweeper.sweep_once(Utc::now()).await.unwrap();
    assert!(report.outcomes.is_empty());
    let stored: Vec<Uuid> = state
        .store
        .rejections_for(order.id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.driver_id)
        .collect();
    assert_eq!(stored, vec![rejecter.id]);
    assert_eq!(
        state.orchestrator.accept(order.id, rejecter.id).await.unwrap(),
        AcceptOutcome::Declined
    );
}

#[tokio::test]
async fn transient_locator_failure_is_retried_once() {
    let state = setup();
    let driver = add_driver_at(&state, 1.0, 4.9).await;
    let order = add_order(&state, Some(LOUISVILLE)).await;
    state.store.fail_next(StoreOp::FindDrivers, 1);

    let outcome = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;

    assert!(matches!(outcome, DispatchOutcome::AutoAssigned { driver_id, .. } if driver_id == driver.id));
}

#[tokio::test]
async fn persistent_locator_failure_falls_back_to_online_broadcast() {
    let state = setup();
    let driver = add_driver_at(&state, 1.0, 4.9).await;
    let order = add_order(&state, Some(LOUISVILLE)).await;
    state.store.fail_next(StoreOp::FindDrivers, 2);

    let outcome = state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;

    assert_eq!(
        outcome,
        DispatchOutcome::Broadcasted {
            recipients: vec![driver.id],
            reason: BroadcastReason::CollaboratorFailure,
        }
    );
    assert_eq!(load(&state, order.id).await.status, OrderStatus::Pending);
}

#[tokio::test]
async fn late_acceptance_after_cancellation_is_a_noop() {
    let state = setup();
    let driver = add_driver_at(&state, 12.0, 3.0).await;
    let order = add_order(&state, Some(LOUISVILLE)).await;
    state
        .orchestrator
        .dispatch(order.id, DispatchTrigger::Inserted)
        .await;

    let cancelled = state
        .store
        .update_order_if(
            order.id,
            &OrderGuard::status_in(&OrderStatus::CANCELLABLE),
            OrderPatch::unassigned(OrderStatus::Cancelled),
        )
        .await
        .unwrap();
    assert!(cancelled);

    let outcome = state.orchestrator.accept(order.id, driver.id).await.unwrap();
    assert_eq!(outcome, AcceptOutcome::AlreadyTaken);
    assert_eq!(load(&state, order.id).await.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn sweep_recovers_order_that_missed_its_event() {
    let state = setup();
    let driver = add_driver_at(&state, 2.0, 4.8).await;
    let mut order = Order::new(Uuid::new_v4(), "a", "b", Some(LOUISVILLE), None, 10.0);
    order.created_at = Utc::now() - chrono::Duration::minutes(6);
    let order = state.store.insert_order(order).await.unwrap();
    let fresh = add_order(&state, Some(LOUISVILLE)).await;

    let report = state.sweeper.sweep_once(Utc::now()).await.unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].0, order.id);
    assert!(matches!(report.outcomes[0].1, DispatchOutcome::AutoAssigned { driver_id, .. } if driver_id == driver.id));
    assert_eq!(load(&state, fresh.id).await.status, OrderStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn sweeper_loop_dispatches_stale_order_within_one_interval() {
    let state = setup();
    let driver = add_driver_at(&state, 2.0, 4.8).await;
    let mut order = Order::new(Uuid::new_v4(), "a", "b", Some(LOUISVILLE), None, 10.0);
    order.created_at = Utc::now() - chrono::Duration::minutes(6);
    let order = state.store.insert_order(order).await.unwrap();

    let sweeper = Arc::new(BackgroundSweeper::new(
        state.orchestrator.clone(),
        state.store.clone(),
        state.notifier.clone(),
        config().sweeper,
        state.metrics.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(sweeper.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(30)).await;

    let stored = load(&state, order.id).await;
    assert_eq!(stored.status, OrderStatus::Assigned);
    assert_eq!(stored.driver_id, Some(driver.id));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[derive(Default)]
struct CountingHook {
    ticks: AtomicU32,
}

#[async_trait]
impl MaintenanceHook for CountingHook {
    async fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn sweeper_runs_maintenance_and_purges_history() {
    let state = setup();
    let target = Uuid::new_v4();
    state.notifier.insert_record(NotificationRecord {
        id: Uuid::new_v4(),
        target,
        notification: Notification::new("stale", "stale"),
        delivered: true,
        sent_at: Utc::now() - chrono::Duration::days(8),
    });

    let hook = Arc::new(CountingHook::default());
    let sweeper = Arc::new(
        BackgroundSweeper::new(
            state.orchestrator.clone(),
            state.store.clone(),
            state.notifier.clone(),
            config().sweeper,
            state.metrics.clone(),
        )
        .with_maintenance(hook.clone()),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(sweeper.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert!(hook.ticks.load(Ordering::SeqCst) >= 2);
    assert!(state.notifier.records().is_empty());

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn reopened_order_is_dispatched_again() {
    let state = setup();
    let driver = add_driver_at(&state, 1.0, 4.9).await;
    let order = add_order(&state, Some(LOUISVILLE)).await;

    let outcome = state
        .listener
        .handle(ChangeEvent::OrderStatusChanged {
            order_id: order.id,
            from: OrderStatus::Cancelled,
            to: OrderStatus::Pending,
            driver_id: None,
        })
        .await;

    assert!(matches!(outcome, Some(DispatchOutcome::AutoAssigned { driver_id, .. }) if driver_id == driver.id));
}

#[tokio::test]
async fn change_feed_drives_order_from_insert_to_acceptance() {
    let owned = setup();
    let state = &owned;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = state.spawn_workers(shutdown_rx);

    let driver_id = add_driver_at(state, 2.0, 4.8).await.id;
    let order = add_order(state, Some(LOUISVILLE)).await;
    let (order_id, customer_id) = (order.id, order.customer_id);

    eventually(move || async move { load(state, order_id).await.status == OrderStatus::Assigned })
        .await;

    let outcome = state.orchestrator.accept(order_id, driver_id).await.unwrap();
    assert_eq!(outcome, AcceptOutcome::Accepted);

    eventually(move || async move {
        state
            .store
            .get_driver(driver_id)
            .await
            .unwrap()
            .is_some_and(|d| d.is_busy)
    })
    .await;
    eventually(move || async move {
        kinds_for(state, customer_id).contains(&"order_accepted".to_string())
    })
    .await;

    shutdown_tx.send(true).unwrap();
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test]
async fn driver_coming_online_is_offered_queued_orders() {
    let owned = setup();
    let state = &owned;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = state.spawn_workers(shutdown_rx);

    let driver_id = add_driver(state, Some(LOUISVILLE), false, Some(4.5)).await.id;
    let order_id = add_order(state, Some(LOUISVILLE)).await.id;

    eventually(move || async move {
        load(state, order_id).await.status == OrderStatus::NoDriversAvailable
    })
    .await;

    state.store.set_online(driver_id, true).await.unwrap();

    eventually(move || async move {
        kinds_for(state, driver_id).contains(&"queued_order_available".to_string())
    })
    .await;
    assert_eq!(load(state, order_id).await.status, OrderStatus::NoDriversAvailable);

    assert_eq!(
        state.orchestrator.accept(order_id, driver_id).await.unwrap(),
        AcceptOutcome::Accepted
    );
    eventually(move || async move {
        state
            .orchestrator
            .queue()
            .list_waiting()
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    shutdown_tx.send(true).unwrap();
    for worker in workers {
        worker.await.unwrap();
    }
}
