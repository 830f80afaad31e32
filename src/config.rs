use std::path::PathBuf;
use std::str::FromStr;

/// Runtime settings, read from `CLASSBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends since the last compaction before compacting again.
    pub compact_threshold: u64,
    pub lock_timeout_ms: u64,
    pub lead_time_minutes: i64,
    pub min_session_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            lock_timeout_ms: 5000,
            lead_time_minutes: 30,
            min_session_minutes: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparsable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }
        let defaults = Self::default();
        Self {
            data_dir: lookup("CLASSBOOK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            metrics_port: parse(&lookup, "CLASSBOOK_METRICS_PORT"),
            compact_threshold: parse(&lookup, "CLASSBOOK_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            lock_timeout_ms: parse(&lookup, "CLASSBOOK_LOCK_TIMEOUT_MS").unwrap_or(defaults.lock_timeout_ms),
            lead_time_minutes: parse(&lookup, "CLASSBOOK_LEAD_TIME_MINUTES")
                .filter(|m: &i64| *m >= 0)
                .unwrap_or(defaults.lead_time_minutes),
            min_session_minutes: parse(&lookup, "CLASSBOOK_MIN_SESSION_MINUTES")
                .filter(|m: &i64| *m > 0)
                .unwrap_or(defaults.min_session_minutes),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("classbook.wal")
    }
}
