use mast_proto::GeoPoint;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

// Local equirectangular projection around `origin`: (east, north) in meters.
// Only meant for short hops.
pub fn to_xy(p: GeoPoint, origin: GeoPoint) -> (f64, f64) {
    let x = (p.lon - origin.lon).to_radians() * EARTH_RADIUS_M * origin.lat.to_radians().cos();
    let y = (p.lat - origin.lat).to_radians() * EARTH_RADIUS_M;
    (x, y)
}

pub fn from_xy(origin: GeoPoint, x: f64, y: f64) -> GeoPoint {
    let lat = origin.lat + (y / EARTH_RADIUS_M).to_degrees();
    let lon = origin.lon + (x / (EARTH_RADIUS_M * origin.lat.to_radians().cos())).to_degrees();
    GeoPoint { lat, lon }
}

/// Move from `from` towards `to` by at most `step_m`; lands exactly on `to` when closer than that.
pub fn step_towards(from: GeoPoint, to: GeoPoint, step_m: f64) -> GeoPoint {
    let (x, y) = to_xy(to, from);
    let d = (x * x + y * y).sqrt();
    if d <= step_m || d == 0.0 {
        return to;
    }
    let k = step_m / d;
    from_xy(from, x * k, y * k)
}
