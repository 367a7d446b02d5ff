use crate::geo::haversine_miles;
use crate::models::dispatch::{ScoreBreakdown, ScoredCandidate};
use crate::models::driver::DriverCandidate;
use crate::models::order::Order;

const DISTANCE_WEIGHT: f64 = 0.40;
const RATING_WEIGHT: f64 = 0.30;
const AVAILABILITY_WEIGHT: f64 = 0.20;
const WORKLOAD_WEIGHT: f64 = 0.10;

/// Distance at which the distance component reaches zero.
const DISTANCE_CUTOFF_MILES: f64 = 15.0;
/// Open orders at which the workload component reaches zero.
const WORKLOAD_CUTOFF_ORDERS: f64 = 3.0;

pub fn compute_score(driver: &DriverCandidate, order: &Order) -> ScoredCandidate {
    let distance_miles = match (&driver.location, &order.pickup) {
        (Some(location), Some(pickup)) => Some(haversine_miles(location, pickup)),
        _ => None,
    };

    let breakdown = ScoreBreakdown {
        distance_score: distance_miles.map_or(0.0, distance_score),
        rating_score: rating_score(driver.effective_rating()),
        availability_score: availability_score(driver.is_online),
        workload_score: workload_score(driver.open_orders),
    };

    ScoredCandidate {
        driver_id: driver.driver_id,
        score: weighted_score(&breakdown),
        distance_miles,
        breakdown,
    }
}

pub fn weighted_score(breakdown: &ScoreBreakdown) -> f64 {
    (breakdown.distance_score * DISTANCE_WEIGHT)
        + (breakdown.rating_score * RATING_WEIGHT)
        + (breakdown.availability_score * AVAILABILITY_WEIGHT)
        + (breakdown.workload_score * WORKLOAD_WEIGHT)
}

/// Scores every candidate and sorts them best first. Ties keep candidate order.
pub fn rank_candidates(candidates: &[DriverCandidate], order: &Order) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .iter()
        .map(|driver| compute_score(driver, order))
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}

fn distance_score(distance_miles: f64) -> f64 {
    (1.0 - distance_miles.max(0.0) / DISTANCE_CUTOFF_MILES).max(0.0)
}

fn rating_score(rating: f64) -> f64 {
    (rating / 5.0).clamp(0.0, 1.0)
}

fn availability_score(is_online: bool) -> f64 {
    if is_online { 1.0 } else { 0.5 }
}

fn workload_score(open_orders: u32) -> f64 {
    (1.0 - open_orders as f64 / WORKLOAD_CUTOFF_ORDERS).max(0.0)
}
