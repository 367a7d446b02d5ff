//! Collaborator interfaces for the order, driver, rejection and queue records.
//!
//! The engine only talks to these traits. `memory::MemoryStore` implements all of them for the
//! reference binary and the tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::models::dispatch::{QueueEntry, QueueStatus, Rejection};
use crate::models::driver::{Driver, DriverCandidate, DriverFilter, GeoPoint};
use crate::models::event::ChangeRecord;
use crate::models::order::{Order, OrderGuard, OrderPatch};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("table {0} does not exist")]
    TableMissing(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: Order) -> StoreResult<Order>;

    async fn get_order(&self, order_id: Uuid) -> StoreResult<Option<Order>>;

    /// Applies `patch` only if the current row matches `guard`, as one atomic operation.
    ///
    /// Returns `Ok(false)` when the guard did not match (or the order does not exist).
    async fn update_order_if(
        &self,
        order_id: Uuid,
        guard: &OrderGuard,
        patch: OrderPatch,
    ) -> StoreResult<bool>;

    async fn record_dispatch_attempt(&self, order_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    /// Pending orders whose last activity happened before `cutoff`, oldest first.
    async fn list_stale_pending(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Order>>;

    /// Orders currently in `assigned`, whatever their age.
    async fn list_assigned(&self) -> StoreResult<Vec<Order>>;
}

#[async_trait]
pub trait DriverStore: Send + Sync {
    async fn find_drivers(&self, filter: DriverFilter) -> StoreResult<Vec<DriverCandidate>>;

    async fn get_driver(&self, driver_id: Uuid) -> StoreResult<Option<Driver>>;

    async fn upsert_driver(&self, driver: Driver) -> StoreResult<Driver>;

    async fn set_online(&self, driver_id: Uuid, online: bool) -> StoreResult<Driver>;

    async fn set_location(&self, driver_id: Uuid, location: GeoPoint) -> StoreResult<Driver>;

    async fn set_busy(&self, driver_id: Uuid, busy: bool) -> StoreResult<()>;
}

#[async_trait]
pub trait RejectionStore: Send + Sync {
    async fn record_rejection(&self, rejection: Rejection) -> StoreResult<()>;

    async fn rejections_for(&self, order_id: Uuid) -> StoreResult<Vec<Rejection>>;
}

/// The optional holding table for orders nobody could take.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn find_entry(&self, order_id: Uuid) -> StoreResult<Option<QueueEntry>>;

    /// Inserts unless an entry for the order already exists. Returns whether a row was written.
    async fn insert_entry(&self, entry: QueueEntry) -> StoreResult<bool>;

    /// Waiting entries, oldest first.
    async fn list_waiting(&self, limit: Option<usize>) -> StoreResult<Vec<QueueEntry>>;

    /// Returns `false` when no entry exists for the order.
    async fn set_entry_status(&self, order_id: Uuid, status: QueueStatus) -> StoreResult<bool>;
}

pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self) -> BroadcastStream<ChangeRecord>;
}
