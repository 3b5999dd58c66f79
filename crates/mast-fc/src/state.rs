use std::time::{Duration, Instant};

/// Link-side view of the autopilot, updated by the MAVLink reader thread.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub connected: bool,
    pub address: Option<String>,
    pub last_heartbeat: Option<Instant>,
    pub armed: bool,
    pub in_air: bool,
    pub gps_ok: bool,
    pub home_seen: bool,

    /// Items in the mission currently on the autopilot (as uploaded by us).
    pub mission_count: u16,
    pub reached_seq: Option<u16>,
}

impl LinkStatus {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    pub fn mission_finished(&self) -> bool {
        self.mission_count > 0 && self.reached_seq == Some(self.mission_count - 1)
    }

    pub fn reset_mission(&mut self, count: u16) {
        self.mission_count = count;
        self.reached_seq = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mission_finished_on_last_item() {
        let mut st = LinkStatus::default();
        assert!(!st.mission_finished());

        st.reset_mission(2);
        assert!(!st.mission_finished());
        st.reached_seq = Some(0);
        assert!(!st.mission_finished());
        st.reached_seq = Some(1);
        assert!(st.mission_finished());

        st.reset_mission(0);
        assert!(!st.mission_finished());
    }

    #[test]
    fn test_hb_age() {
        let mut st = LinkStatus::default();
        assert!(st.hb_age().is_none());
        st.last_heartbeat = Some(Instant::now());
        assert!(st.hb_age().unwrap() < Duration::from_secs(5));
    }
}
