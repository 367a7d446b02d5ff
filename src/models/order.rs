use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Assigned,
    NoDriversAvailable,
    Accepted,
    PickedUp,
    InTransit,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    /// Statuses from which an unclaimed order may still be dispatched or accepted.
    pub const OPEN: [OrderStatus; 2] = [OrderStatus::Pending, OrderStatus::NoDriversAvailable];

    /// Statuses a customer may still cancel from.
    pub const CANCELLABLE: [OrderStatus; 4] = [
        OrderStatus::Pending,
        OrderStatus::NoDriversAvailable,
        OrderStatus::Assigned,
        OrderStatus::Accepted,
    ];

    pub fn is_open(self) -> bool {
        Self::OPEN.contains(&self)
    }

    /// Whether an order in this status carries a driver.
    pub fn holds_driver(self) -> bool {
        matches!(
            self,
            OrderStatus::Assigned
                | OrderStatus::Accepted
                | OrderStatus::PickedUp
                | OrderStatus::InTransit
                | OrderStatus::Delivered
        )
    }

    /// Whether the order still counts against its driver's workload.
    pub fn counts_as_open_work(self) -> bool {
        self.holds_driver() && self != OrderStatus::Delivered
    }

    /// The status a driver may advance to from this one.
    pub fn next_in_delivery(self) -> Option<OrderStatus> {
        match self {
            OrderStatus::Accepted => Some(OrderStatus::PickedUp),
            OrderStatus::PickedUp => Some(OrderStatus::InTransit),
            OrderStatus::InTransit => Some(OrderStatus::Delivered),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Assigned => "assigned",
            OrderStatus::NoDriversAvailable => "no_drivers_available",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PickedUp => "picked_up",
            OrderStatus::InTransit => "in_transit",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub pickup_address: String,
    pub delivery_address: String,
    pub pickup: Option<GeoPoint>,
    pub delivery: Option<GeoPoint>,
    pub total: f64,
    pub status: OrderStatus,
    pub driver_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispatch_attempts: u32,
}

impl Order {
    pub fn new(
        customer_id: Uuid,
        pickup_address: impl Into<String>,
        delivery_address: impl Into<String>,
        pickup: Option<GeoPoint>,
        delivery: Option<GeoPoint>,
        total: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id,
            pickup_address: pickup_address.into(),
            delivery_address: delivery_address.into(),
            pickup,
            delivery,
            total,
            status: OrderStatus::Pending,
            driver_id: None,
            created_at: now,
            assigned_at: None,
            updated_at: now,
            last_dispatched_at: None,
            dispatch_attempts: 0,
        }
    }

    pub fn is_unclaimed(&self) -> bool {
        self.driver_id.is_none() && self.status.is_open()
    }

    /// Most recent moment the engine touched the order, used for staleness.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_dispatched_at.unwrap_or(self.created_at)
    }
}

/// Which driver an order must currently carry for a guarded write to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMatch {
    Any,
    Unassigned,
    Is(Uuid),
}

/// Row-match predicate of a conditional order update.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderGuard {
    pub statuses: Vec<OrderStatus>,
    pub driver: DriverMatch,
}

impl OrderGuard {
    /// `driver_id IS NULL AND status IN (pending, no_drivers_available)`.
    pub fn unclaimed() -> Self {
        Self {
            statuses: OrderStatus::OPEN.to_vec(),
            driver: DriverMatch::Unassigned,
        }
    }

    /// `driver_id IS NULL AND status = status`.
    pub fn unassigned_in(status: OrderStatus) -> Self {
        Self {
            statuses: vec![status],
            driver: DriverMatch::Unassigned,
        }
    }

    pub fn held_by(driver_id: Uuid, status: OrderStatus) -> Self {
        Self {
            statuses: vec![status],
            driver: DriverMatch::Is(driver_id),
        }
    }

    pub fn status_in(statuses: &[OrderStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            driver: DriverMatch::Any,
        }
    }

    pub fn matches(&self, order: &Order) -> bool {
        let driver_ok = match self.driver {
            DriverMatch::Any => true,
            DriverMatch::Unassigned => order.driver_id.is_none(),
            DriverMatch::Is(id) => order.driver_id == Some(id),
        };
        driver_ok && self.statuses.contains(&order.status)
    }
}

/// New values written when a guard matches. `driver_id` is written as given, `None` clears it.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPatch {
    pub status: OrderStatus,
    pub driver_id: Option<Uuid>,
}

impl OrderPatch {
    pub fn assign(driver_id: Uuid) -> Self {
        Self {
            status: OrderStatus::Assigned,
            driver_id: Some(driver_id),
        }
    }

    pub fn accept(driver_id: Uuid) -> Self {
        Self {
            status: OrderStatus::Accepted,
            driver_id: Some(driver_id),
        }
    }

    pub fn release() -> Self {
        Self {
            status: OrderStatus::Pending,
            driver_id: None,
        }
    }

    pub fn unassigned(status: OrderStatus) -> Self {
        Self {
            status,
            driver_id: None,
        }
    }
}
