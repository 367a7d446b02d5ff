use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rating assumed for drivers without any recorded rating.
pub const DEFAULT_RATING: f64 = 4.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub location: Option<GeoPoint>,
    pub is_online: bool,
    pub is_approved: bool,
    pub onboarding_completed: bool,
    pub rating: Option<f64>,
    pub is_busy: bool,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    pub fn is_qualified(&self) -> bool {
        self.is_approved && self.onboarding_completed
    }
}

/// Read-only view of a driver as seen by the dispatch engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverCandidate {
    pub driver_id: Uuid,
    pub location: Option<GeoPoint>,
    pub is_online: bool,
    pub is_approved: bool,
    pub onboarding_completed: bool,
    pub open_orders: u32,
    pub rating: Option<f64>,
}

impl DriverCandidate {
    pub fn from_driver(driver: &Driver, open_orders: u32) -> Self {
        Self {
            driver_id: driver.id,
            location: driver.location,
            is_online: driver.is_online,
            is_approved: driver.is_approved,
            onboarding_completed: driver.onboarding_completed,
            open_orders,
            rating: driver.rating,
        }
    }

    pub fn effective_rating(&self) -> f64 {
        self.rating.unwrap_or(DEFAULT_RATING)
    }
}

/// Predicate pushed down to the driver store.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriverFilter {
    pub online_only: bool,
    pub qualified_only: bool,
    pub with_location: bool,
}

impl DriverFilter {
    pub fn online_qualified() -> Self {
        Self {
            online_only: true,
            qualified_only: true,
            with_location: false,
        }
    }

    pub fn locatable() -> Self {
        Self {
            with_location: true,
            ..Self::online_qualified()
        }
    }

    pub fn qualified() -> Self {
        Self {
            qualified_only: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, driver: &Driver) -> bool {
        (!self.online_only || driver.is_online)
            && (!self.qualified_only || driver.is_qualified())
            && (!self.with_location || driver.location.is_some())
    }
}
