use crate::model::stop_model::Coordinates;

/// Mean Earth radius (IUGG), meters
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Great-circle distance between two points in meters, using the haversine formula
/// on a spherical Earth.
pub fn haversine_meters(a: Coordinates, b: Coordinates) -> f64 {
    // abs() keeps the result bit-for-bit symmetric in its arguments
    let d_lat = (b.latitude - a.latitude).abs().to_radians();
    let d_lon = (b.longitude - a.longitude).abs().to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}
