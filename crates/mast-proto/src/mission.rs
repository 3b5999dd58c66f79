use serde::{Deserialize, Serialize};

/// WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite() && self.lat.abs() <= 90.0 && self.lon.abs() <= 180.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub relative_alt_m: f32,
    pub speed_m_s: f32,
    pub acceptance_radius_m: f32,
}

impl Waypoint {
    pub fn at(point: GeoPoint, relative_alt_m: f32, speed_m_s: f32, acceptance_radius_m: f32) -> Self {
        Self { lat: point.lat, lon: point.lon, relative_alt_m, speed_m_s, acceptance_radius_m }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionPlan {
    pub items: Vec<Waypoint>,
}

impl MissionPlan {
    pub fn single(wp: Waypoint) -> Self {
        Self { items: vec![wp] }
    }

    pub fn last(&self) -> Option<&Waypoint> {
        self.items.last()
    }
}
