use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub global_position_ok: bool,
    pub home_position_ok: bool,
}

impl Health {
    pub fn ready_to_fly(&self) -> bool {
        self.global_position_ok && self.home_position_ok
    }
}

/// Range finder reading, centimeters (MAVLink DISTANCE_SENSOR units).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceSample {
    pub current_cm: u16,
    pub min_cm: u16,
    pub max_cm: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    // meters above home
    pub relative_alt_m: f32,
}

/// One sample from the flight link's telemetry fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Telemetry {
    Connection { connected: bool },
    Health(Health),
    Distance(DistanceSample),
    Position(Position),
    InAir(bool),
    MissionProgress { current: u16, total: u16 },
}

impl Telemetry {
    /// `current == total` is how the autopilot reports the last item reached.
    pub fn mission_finished(&self) -> Option<bool> {
        match self {
            Telemetry::MissionProgress { current, total } => Some(*total > 0 && current >= total),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mission_finished_only_for_progress() {
        assert_eq!(Telemetry::InAir(true).mission_finished(), None);
        assert_eq!(Telemetry::MissionProgress { current: 0, total: 2 }.mission_finished(), Some(false));
        assert_eq!(Telemetry::MissionProgress { current: 2, total: 2 }.mission_finished(), Some(true));
        assert_eq!(Telemetry::MissionProgress { current: 0, total: 0 }.mission_finished(), Some(false));
    }

    #[test]
    fn test_health_ready() {
        let h = Health { global_position_ok: true, home_position_ok: false };
        assert!(!h.ready_to_fly());
        let h = Health { home_position_ok: true, ..h };
        assert!(h.ready_to_fly());
    }
}
