use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Drops repeats of the same high-level command inside `min_interval`.
#[derive(Debug)]
pub struct CommandRateLimit {
    last: HashMap<&'static str, Instant>,
    min_interval: Duration,
}

impl CommandRateLimit {
    pub fn new(min_interval: Duration) -> Self {
        Self { last: HashMap::new(), min_interval }
    }

    pub fn allow(&mut self, command: &'static str) -> bool {
        self.allow_at(command, Instant::now())
    }

    fn allow_at(&mut self, command: &'static str, now: Instant) -> bool {
        if let Some(t) = self.last.get(command) {
            if now.duration_since(*t) < self.min_interval { return false; }
        }
        self.last.insert(command, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_per_command() {
        let mut lim = CommandRateLimit::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(lim.allow_at("rtl", t0));
        assert!(!lim.allow_at("rtl", t0 + Duration::from_millis(500)));
        assert!(lim.allow_at("arm", t0 + Duration::from_millis(500)));
        assert!(lim.allow_at("rtl", t0 + Duration::from_secs(2)));
    }
}
