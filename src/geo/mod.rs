use crate::models::driver::GeoPoint;

pub const EARTH_RADIUS_MILES: f64 = 3_959.0;

/// Great-circle distance shared by candidate location and scoring.
pub fn haversine_miles(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_MILES * central_angle
}

/// Point `miles` due north of `origin`, handy for placing drivers at a known distance.
pub fn offset_north(origin: &GeoPoint, miles: f64) -> GeoPoint {
    GeoPoint {
        lat: origin.lat + (miles / EARTH_RADIUS_MILES).to_degrees(),
        lng: origin.lng,
    }
}
