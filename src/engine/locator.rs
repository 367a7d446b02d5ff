use std::sync::Arc;

use crate::geo::haversine_miles;
use crate::models::driver::{DriverCandidate, DriverFilter, GeoPoint};
use crate::store::{DriverStore, StoreResult};

pub struct DriverLocator {
    drivers: Arc<dyn DriverStore>,
}

impl DriverLocator {
    pub fn new(drivers: Arc<dyn DriverStore>) -> Self {
        Self { drivers }
    }

    /// Online, approved drivers with a known position within `radius_miles` of `point`.
    ///
    /// An empty result is a normal outcome.
    pub async fn find_candidates(
        &self,
        point: &GeoPoint,
        radius_miles: f64,
    ) -> StoreResult<Vec<DriverCandidate>> {
        let drivers = self.drivers.find_drivers(DriverFilter::locatable()).await?;

        Ok(drivers
            .into_iter()
            .filter(|driver| {
                driver
                    .location
                    .as_ref()
                    .is_some_and(|location| haversine_miles(location, point) <= radius_miles)
            })
            .collect())
    }

    /// Every online, approved driver regardless of position.
    pub async fn online_drivers(&self) -> StoreResult<Vec<DriverCandidate>> {
        self.drivers.find_drivers(DriverFilter::online_qualified()).await
    }

    /// Every approved driver, online or not.
    pub async fn approved_drivers(&self) -> StoreResult<Vec<DriverCandidate>> {
        self.drivers.find_drivers(DriverFilter::qualified()).await
    }
}
