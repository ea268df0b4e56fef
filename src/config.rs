use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::gateway::GatewayConfig;
use crate::schedule::DailySchedule;

/// Process configuration, read from `SLOTBOOK_*` environment variables.
/// Unset or unparseable values fall back to defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub store_timeout: Duration,
    pub max_timeout: Duration,
    pub cas_retries: u32,
    pub schedule: DailySchedule,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            bind: lookup("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "SLOTBOOK_PORT", 7878),
            data_dir: PathBuf::from(lookup("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parse_or(&lookup, "SLOTBOOK_MAX_CONNECTIONS", 256),
            compact_threshold: parse_or(&lookup, "SLOTBOOK_COMPACT_THRESHOLD", 1000),
            metrics_port: lookup("SLOTBOOK_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            store_timeout: Duration::from_millis(parse_or(&lookup, "SLOTBOOK_STORE_TIMEOUT_MS", 2000)),
            max_timeout: Duration::from_millis(parse_or(&lookup, "SLOTBOOK_MAX_TIMEOUT_MS", 30_000)),
            cas_retries: parse_or(&lookup, "SLOTBOOK_CAS_RETRIES", 8),
            schedule: DailySchedule {
                open_minute: parse_or::<u32>(&lookup, "SLOTBOOK_OPEN_HOUR", 10).saturating_mul(60),
                close_minute: parse_or::<u32>(&lookup, "SLOTBOOK_CLOSE_HOUR", 22).saturating_mul(60),
                slot_minutes: parse_or(&lookup, "SLOTBOOK_SLOT_MINUTES", 60),
                capacity: parse_or(&lookup, "SLOTBOOK_SLOT_CAPACITY", 2),
                label: lookup("SLOTBOOK_SLOT_LABEL").filter(|s| !s.is_empty()),
            },
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            store_timeout: self.store_timeout,
            max_cas_attempts: self.cas_retries.max(1),
            ..EngineConfig::default()
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            default_timeout: self.store_timeout,
            max_timeout: self.max_timeout.max(self.store_timeout),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
