use std::path::PathBuf;
use std::time::Duration;

/// Knobs the engine receives explicitly instead of reading global settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a notified waitlist party may redeem its token.
    pub reservation_window_minutes: i64,
    /// Reservation links are `{reservation_base_url}/reserve/{token}`.
    pub reservation_base_url: String,
    /// Live waitlist entries allowed per slot. The product rule is 1.
    pub waitlist_depth: usize,
    pub sweep_interval: Duration,
    pub compact_interval: Duration,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_window_minutes: 30,
            reservation_base_url: "http://localhost:3000".into(),
            waitlist_depth: 1,
            sweep_interval: Duration::from_secs(5),
            compact_interval: Duration::from_secs(30),
            compact_threshold: 1000,
        }
    }
}

impl EngineConfig {
    pub fn reservation_window_ms(&self) -> i64 {
        self.reservation_window_minutes * 60_000
    }

    /// Read `COURTSIDE_*` overrides, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reservation_window_minutes: env_parse("COURTSIDE_RESERVATION_MINUTES")
                .filter(|m: &i64| *m > 0)
                .unwrap_or(defaults.reservation_window_minutes),
            reservation_base_url: std::env::var("COURTSIDE_BASE_URL")
                .unwrap_or(defaults.reservation_base_url),
            waitlist_depth: env_parse("COURTSIDE_WAITLIST_DEPTH")
                .filter(|d: &usize| *d > 0)
                .unwrap_or(defaults.waitlist_depth),
            sweep_interval: env_parse("COURTSIDE_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            compact_interval: env_parse("COURTSIDE_COMPACT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.compact_interval),
            compact_threshold: env_parse("COURTSIDE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
        }
    }
}

/// Process-level settings for a host embedding the engine.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(
                std::env::var("COURTSIDE_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            metrics_port: env_parse("COURTSIDE_METRICS_PORT"),
            engine: EngineConfig::from_env(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
