//! Runtime configuration loaded from environment variables

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::room::policy::{AutoStart, HostTriggered, StartPolicy};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RaceConfig {
    pub bind_addr: SocketAddr,
    /// Outbound frames buffered per socket before it is evicted as too slow
    pub send_queue_capacity: usize,
    /// Commands buffered per race room
    pub room_queue_capacity: usize,
    /// How long a room with no bound sockets survives before the reaper may remove it
    pub idle_grace: Duration,
    pub reap_interval: Duration,
    /// Slack past `startTime` after which a stuck countdown is forced live
    pub countdown_ceiling: Duration,
    pub max_countdown_seconds: u32,
    /// (min racers, countdown seconds); None = host-triggered starts only
    pub auto_start: Option<(usize, u32)>,
    pub races_file: Option<PathBuf>,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            send_queue_capacity: 64,
            room_queue_capacity: 256,
            idle_grace: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            countdown_ceiling: Duration::from_secs(10),
            max_countdown_seconds: 60,
            auto_start: None,
            races_file: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

impl RaceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let auto_start = match (
            env_parse::<usize>("AUTO_START_MIN_RACERS"),
            env_parse::<u32>("AUTO_START_COUNTDOWN_SECS"),
        ) {
            (Some(min), secs) if min > 0 => Some((min, secs.unwrap_or(5))),
            _ => None,
        };

        let config = Self {
            bind_addr: env_parse("BIND_ADDR").unwrap_or(defaults.bind_addr),
            send_queue_capacity: env_parse("SEND_QUEUE_CAPACITY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.send_queue_capacity),
            room_queue_capacity: env_parse("ROOM_QUEUE_CAPACITY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.room_queue_capacity),
            idle_grace: env_parse("IDLE_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_grace),
            reap_interval: env_parse("REAP_INTERVAL_SECS")
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reap_interval),
            countdown_ceiling: env_parse("COUNTDOWN_CEILING_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.countdown_ceiling),
            max_countdown_seconds: env_parse("MAX_COUNTDOWN_SECS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.max_countdown_seconds),
            auto_start,
            races_file: std::env::var("RACES_FILE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        };

        tracing::info!(
            bind_addr = %config.bind_addr,
            send_queue_capacity = config.send_queue_capacity,
            idle_grace_secs = config.idle_grace.as_secs(),
            auto_start = ?config.auto_start,
            "Race config loaded"
        );

        config
    }

    pub fn start_policy(&self) -> Arc<dyn StartPolicy> {
        match self.auto_start {
            Some((min_racers, countdown_seconds)) => Arc::new(AutoStart {
                min_racers,
                countdown_seconds,
            }),
            None => Arc::new(HostTriggered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "BIND_ADDR",
        "SEND_QUEUE_CAPACITY",
        "IDLE_GRACE_SECS",
        "AUTO_START_MIN_RACERS",
        "AUTO_START_COUNTDOWN_SECS",
        "RACES_FILE",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_env();
        let config = RaceConfig::from_env();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.send_queue_capacity, 64);
        assert_eq!(config.idle_grace, Duration::from_secs(300));
        assert!(config.auto_start.is_none());
        assert!(config.races_file.is_none());
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        clear_env();
        std::env::set_var("BIND_ADDR", "127.0.0.1:9000");
        std::env::set_var("SEND_QUEUE_CAPACITY", "8");
        std::env::set_var("AUTO_START_MIN_RACERS", "2");
        std::env::set_var("RACES_FILE", "/tmp/races.json");

        let config = RaceConfig::from_env();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.send_queue_capacity, 8);
        assert_eq!(config.auto_start, Some((2, 5)));
        assert_eq!(config.races_file, Some(PathBuf::from("/tmp/races.json")));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_garbage_values_fall_back() {
        clear_env();
        std::env::set_var("SEND_QUEUE_CAPACITY", "lots");
        std::env::set_var("AUTO_START_MIN_RACERS", "0");

        let config = RaceConfig::from_env();
        assert_eq!(config.send_queue_capacity, 64);
        assert!(config.auto_start.is_none());
        clear_env();
    }
}
