//! Satellite registry.
//!
//! A satellite is an addressable worker or manager; its identity is the
//! routing key itself. The registry has set semantics: re-registration is
//! idempotent and treated as a heartbeat. There is no expiry in the base
//! design; last-seen instants are recorded so an operator can opt into a
//! staleness sweep.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    Heartbeat,
}

#[derive(Default)]
pub struct SatelliteRegistry {
    seen: HashMap<String, Instant>,
}

impl SatelliteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: &str) -> Registration {
        match self.seen.insert(key.to_string(), Instant::now()) {
            None => {
                info!(satellite = key, "satellite registered");
                Registration::Registered
            }
            Some(_) => {
                debug!(satellite = key, "satellite heartbeat");
                Registration::Heartbeat
            }
        }
    }

    /// Gates every outbound directive/command: never address a key that has
    /// not registered.
    pub fn is_registered(&self, key: &str) -> bool {
        self.seen.contains_key(key)
    }

    /// Drop satellites not heard from within `ttl`, returning their keys.
    pub fn mark_stale(&mut self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .seen
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            self.seen.remove(key);
            info!(satellite = key, "satellite marked stale");
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregistration_is_heartbeat_not_duplicate() {
        let mut reg = SatelliteRegistry::new();
        assert_eq!(reg.register("workers.h1.p1"), Registration::Registered);
        assert!(reg.is_registered("workers.h1.p1"));
        assert_eq!(reg.register("workers.h1.p1"), Registration::Heartbeat);
        assert!(reg.is_registered("workers.h1.p1"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unknown_key_is_not_registered() {
        let reg = SatelliteRegistry::new();
        assert!(!reg.is_registered("managers.h9"));
    }

    #[test]
    fn stale_sweep_removes_quiet_satellites() {
        let mut reg = SatelliteRegistry::new();
        reg.register("managers.h1");
        // Zero TTL: everything already seen is stale.
        std::thread::sleep(Duration::from_millis(2));
        let stale = reg.mark_stale(Duration::from_secs(0));
        assert_eq!(stale, vec!["managers.h1".to_string()]);
        assert!(!reg.is_registered("managers.h1"));
    }
}
