pub mod mission;
pub mod telemetry;

pub use mission::{GeoPoint, MissionPlan, Waypoint};
pub use telemetry::{DistanceSample, Health, Position, Telemetry};
