use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use uuid::Uuid;

use crate::models::dispatch::{QueueEntry, QueueStatus, Rejection};
use crate::models::driver::{Driver, DriverCandidate, DriverFilter, GeoPoint};
use crate::models::event::{
    ChangeKind, ChangeRecord, DRIVERS_TABLE, ORDERS_TABLE, REJECTION_SIGNALS_TABLE,
};
use crate::models::order::{Order, OrderGuard, OrderPatch, OrderStatus};
use crate::store::{
    ChangeFeed, DriverStore, OrderStore, QueueStore, RejectionStore, StoreError, StoreResult,
};

const QUEUE_TABLE: &str = "order_queue";

/// Store operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetOrder,
    UpdateOrder,
    RecordAttempt,
    FindDrivers,
    Rejections,
    Queue,
}

/// In-process store backing the reference binary and the tests.
///
/// Conditional updates run while holding the row's shard lock, which gives the same
/// single-round-trip guarantee as a `UPDATE ... WHERE` against a database.
pub struct MemoryStore {
    orders: DashMap<Uuid, Order>,
    drivers: DashMap<Uuid, Driver>,
    rejections: DashMap<Uuid, Vec<Rejection>>,
    queue: Option<DashMap<Uuid, QueueEntry>>,
    changes_tx: broadcast::Sender<ChangeRecord>,
    faults: DashMap<StoreOp, u32>,
}

impl MemoryStore {
    pub fn new(event_buffer_size: usize, queue_table_enabled: bool) -> Self {
        let (changes_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        Self {
            orders: DashMap::new(),
            drivers: DashMap::new(),
            rejections: DashMap::new(),
            queue: queue_table_enabled.then(DashMap::new),
            changes_tx,
            faults: DashMap::new(),
        }
    }

    /// The queue capability, probed once when the engine is wired.
    pub fn queue_store(self: &Arc<Self>) -> Option<Arc<dyn QueueStore>> {
        if self.queue.is_some() {
            Some(self.clone() as Arc<dyn QueueStore>)
        } else {
            None
        }
    }

    /// Makes the next `times` calls of `op` fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, op: StoreOp, times: u32) {
        self.faults.insert(op, times);
    }

    /// Publishes a driver's decline of an order on the change feed.
    pub fn signal_rejection(&self, order_id: Uuid, driver_id: Uuid) {
        self.publish(ChangeRecord {
            table: REJECTION_SIGNALS_TABLE.to_string(),
            kind: ChangeKind::Insert,
            record: serde_json::json!({ "order_id": order_id, "driver_id": driver_id }),
            old_record: None,
        });
    }

    pub fn list_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.iter().map(|e| e.value().clone()).collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    pub fn list_drivers(&self) -> Vec<Driver> {
        self.drivers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    fn maybe_fail(&self, op: StoreOp) -> StoreResult<()> {
        if let Some(mut remaining) = self.faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Unavailable(format!("injected failure in {op:?}")));
            }
        }
        Ok(())
    }

    fn queue_table(&self) -> StoreResult<&DashMap<Uuid, QueueEntry>> {
        self.queue.as_ref().ok_or(StoreError::TableMissing(QUEUE_TABLE))
    }

    fn publish(&self, record: ChangeRecord) {
        if self.changes_tx.send(record).is_err() {
            debug!("change feed has no subscribers");
        }
    }

    fn open_orders_by_driver(&self) -> HashMap<Uuid, u32> {
        let mut counts = HashMap::new();
        for entry in self.orders.iter() {
            let order = entry.value();
            if let (Some(driver_id), true) = (order.driver_id, order.status.counts_as_open_work()) {
                *counts.entry(driver_id).or_insert(0) += 1;
            }
        }
        counts
    }

    fn update_driver<F>(&self, driver_id: Uuid, apply: F) -> StoreResult<Driver>
    where
        F: FnOnce(&mut Driver),
    {
        let (old, new) = {
            let mut driver = self
                .drivers
                .get_mut(&driver_id)
                .ok_or_else(|| StoreError::NotFound(format!("driver {driver_id} not found")))?;
            let old = driver.clone();
            apply(&mut driver);
            driver.updated_at = Utc::now();
            (old, driver.clone())
        };

        self.publish(ChangeRecord {
            table: DRIVERS_TABLE.to_string(),
            kind: ChangeKind::Update,
            record: to_row(&new),
            old_record: Some(to_row(&old)),
        });
        Ok(new)
    }
}

fn to_row<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: Order) -> StoreResult<Order> {
        self.orders.insert(order.id, order.clone());
        self.publish(ChangeRecord {
            table: ORDERS_TABLE.to_string(),
            kind: ChangeKind::Insert,
            record: to_row(&order),
            old_record: None,
        });
        Ok(order)
    }

    async fn get_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        self.maybe_fail(StoreOp::GetOrder)?;
        Ok(self.orders.get(&order_id).map(|entry| entry.value().clone()))
    }

    async fn update_order_if(
        &self,
        order_id: Uuid,
        guard: &OrderGuard,
        patch: OrderPatch,
    ) -> StoreResult<bool> {
        self.maybe_fail(StoreOp::UpdateOrder)?;

        let change = {
            let Some(mut order) = self.orders.get_mut(&order_id) else {
                return Ok(false);
            };
            if !guard.matches(&order) {
                return Ok(false);
            }

            let old = order.clone();
            let now = Utc::now();
            order.status = patch.status;
            order.driver_id = patch.driver_id;
            order.assigned_at = match patch.driver_id {
                Some(_) if old.driver_id == patch.driver_id => old.assigned_at,
                Some(_) => Some(now),
                None => None,
            };
            order.updated_at = now;
            (old, order.clone())
        };

        let (old, new) = change;
        if old.status != new.status {
            self.publish(ChangeRecord {
                table: ORDERS_TABLE.to_string(),
                kind: ChangeKind::Update,
                record: to_row(&new),
                old_record: Some(to_row(&old)),
            });
        }
        Ok(true)
    }

    async fn record_dispatch_attempt(&self, order_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.maybe_fail(StoreOp::RecordAttempt)?;
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {order_id} not found")))?;
        order.last_dispatched_at = Some(at);
        order.dispatch_attempts = order.dispatch_attempts.saturating_add(1);
        Ok(())
    }

    async fn list_stale_pending(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Order>> {
        let mut stale: Vec<Order> = self
            .orders
            .iter()
            .filter(|e| e.status == OrderStatus::Pending && e.last_activity() < cutoff)
            .map(|e| e.value().clone())
            .collect();
        stale.sort_by_key(|o| o.created_at);
        Ok(stale)
    }

    async fn list_assigned(&self) -> StoreResult<Vec<Order>> {
        Ok(self
            .orders
            .iter()
            .filter(|e| e.status == OrderStatus::Assigned)
            .map(|e| e.value().clone())
            .collect())
    }
}

#[async_trait]
impl DriverStore for MemoryStore {
    async fn find_drivers(&self, filter: DriverFilter) -> StoreResult<Vec<DriverCandidate>> {
        self.maybe_fail(StoreOp::FindDrivers)?;

        let open_orders = self.open_orders_by_driver();
        let candidates = self
            .drivers
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| {
                let driver = e.value();
                DriverCandidate::from_driver(driver, open_orders.get(&driver.id).copied().unwrap_or(0))
            })
            .collect();
        Ok(candidates)
    }

    async fn get_driver(&self, driver_id: Uuid) -> StoreResult<Option<Driver>> {
        Ok(self.drivers.get(&driver_id).map(|e| e.value().clone()))
    }

    async fn upsert_driver(&self, driver: Driver) -> StoreResult<Driver> {
        self.drivers.insert(driver.id, driver.clone());
        Ok(driver)
    }

    async fn set_online(&self, driver_id: Uuid, online: bool) -> StoreResult<Driver> {
        self.update_driver(driver_id, |driver| driver.is_online = online)
    }

    async fn set_location(&self, driver_id: Uuid, location: GeoPoint) -> StoreResult<Driver> {
        self.update_driver(driver_id, |driver| driver.location = Some(location))
    }

    async fn set_busy(&self, driver_id: Uuid, busy: bool) -> StoreResult<()> {
        self.update_driver(driver_id, |driver| driver.is_busy = busy)
            .map(|_| ())
    }
}

#[async_trait]
impl RejectionStore for MemoryStore {
    async fn record_rejection(&self, rejection: Rejection) -> StoreResult<()> {
        self.maybe_fail(StoreOp::Rejections)?;
        let mut rows = self.rejections.entry(rejection.order_id).or_default();
        if !rows.iter().any(|r| r.driver_id == rejection.driver_id) {
            rows.push(rejection);
        }
        Ok(())
    }

    async fn rejections_for(&self, order_id: Uuid) -> StoreResult<Vec<Rejection>> {
        self.maybe_fail(StoreOp::Rejections)?;
        Ok(self
            .rejections
            .get(&order_id)
            .map(|rows| rows.value().clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn find_entry(&self, order_id: Uuid) -> StoreResult<Option<QueueEntry>> {
        self.maybe_fail(StoreOp::Queue)?;
        Ok(self.queue_table()?.get(&order_id).map(|e| e.value().clone()))
    }

    async fn insert_entry(&self, entry: QueueEntry) -> StoreResult<bool> {
        self.maybe_fail(StoreOp::Queue)?;
        match self.queue_table()?.entry(entry.order_id) {
            dashmap::Entry::Occupied(_) => Ok(false),
            dashmap::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(true)
            }
        }
    }

    async fn list_waiting(&self, limit: Option<usize>) -> StoreResult<Vec<QueueEntry>> {
        self.maybe_fail(StoreOp::Queue)?;
        let mut waiting: Vec<QueueEntry> = self
            .queue_table()?
            .iter()
            .filter(|e| e.status == QueueStatus::WaitingForDriver)
            .map(|e| e.value().clone())
            .collect();
        waiting.sort_by_key(|e| e.enqueued_at);
        if let Some(limit) = limit {
            waiting.truncate(limit);
        }
        Ok(waiting)
    }

    async fn set_entry_status(&self, order_id: Uuid, status: QueueStatus) -> StoreResult<bool> {
        self.maybe_fail(StoreOp::Queue)?;
        match self.queue_table()?.get_mut(&order_id) {
            Some(mut entry) => {
                entry.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl ChangeFeed for MemoryStore {
    fn subscribe(&self) -> BroadcastStream<ChangeRecord> {
        BroadcastStream::new(self.changes_tx.subscribe())
    }
}
