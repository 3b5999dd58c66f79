use anyhow::Result;

use crate::{MissionConfig, MonitorConfig};

pub fn check_mission(cfg: &MissionConfig) -> Result<()> {
    anyhow::ensure!(cfg.mast_height_m > 0.0 && cfg.mast_height_m <= 120.0, "mission.mast_height_m out of range (0, 120]");
    anyhow::ensure!(cfg.altitude_tolerance_m >= 0.0 && cfg.altitude_tolerance_m < cfg.mast_height_m, "mission.altitude_tolerance_m must be below mast height");
    anyhow::ensure!(cfg.speed_m_s > 0.0, "mission.speed_m_s must be > 0");
    anyhow::ensure!(cfg.acceptance_radius_m > 0.0, "mission.acceptance_radius_m must be > 0");
    anyhow::ensure!(cfg.max_attempts >= 1, "mission.max_attempts must be >= 1");
    anyhow::ensure!(cfg.poll_interval_ms >= 100, "mission.poll_interval_ms too small");
    if let Some(t) = cfg.attempt_timeout_s {
        anyhow::ensure!(t > 0, "mission.attempt_timeout_s must be > 0");
    }
    Ok(())
}

pub fn check_monitors(cfg: &MonitorConfig) -> Result<()> {
    anyhow::ensure!(cfg.distance_threshold_cm > 0, "monitors.distance_threshold_cm must be > 0");
    anyhow::ensure!(cfg.recognition_period_ms >= 100, "monitors.recognition_period_ms too small");
    anyhow::ensure!(!cfg.target_label.trim().is_empty(), "monitors.target_label is empty");
    anyhow::ensure!((0.0..=1.0).contains(&cfg.min_confidence), "monitors.min_confidence must be within [0, 1]");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_pass() {
        assert!(check_mission(&MissionConfig::default()).is_ok());
        assert!(check_monitors(&MonitorConfig::default()).is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(check_mission(&MissionConfig { max_attempts: 0, ..Default::default() }).is_err());
        assert!(check_mission(&MissionConfig { altitude_tolerance_m: 30.0, ..Default::default() }).is_err());
        assert!(check_mission(&MissionConfig { attempt_timeout_s: Some(0), ..Default::default() }).is_err());
        assert!(check_monitors(&MonitorConfig { min_confidence: 1.5, ..Default::default() }).is_err());
        assert!(check_monitors(&MonitorConfig { target_label: " ".into(), ..Default::default() }).is_err());
    }
}
