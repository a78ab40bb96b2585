//! Geodesic primitives on a spherical earth

use crate::Position;

/// Mean earth radius used by every computation in this crate
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance in meters
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Initial great-circle bearing from point 1 to point 2, in radians
/// clockwise from north
pub fn bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let y = delta_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * delta_lambda.cos();

    y.atan2(x)
}

/// Project a point from `(lat, lon)` along `bearing` (radians) by
/// `angular_distance` (radians of arc, i.e. meters / [`EARTH_RADIUS_M`])
pub fn destination(lat: f64, lon: f64, bearing: f64, angular_distance: f64) -> Position {
    let phi1 = lat.to_radians();
    let lambda1 = lon.to_radians();

    let phi2 = (phi1.sin() * angular_distance.cos()
        + phi1.cos() * angular_distance.sin() * bearing.cos())
    .asin();
    let lambda2 = lambda1
        + (bearing.sin() * angular_distance.sin() * phi1.cos())
            .atan2(angular_distance.cos() - phi1.sin() * phi2.sin());

    Position::new(phi2.to_degrees(), lambda2.to_degrees())
}

/// Project a point by a distance in meters
pub fn offset(from: Position, bearing: f64, meters: f64) -> Position {
    destination(from.lat, from.lon, bearing, meters / EARTH_RADIUS_M)
}
