//! Pipeline configuration.
//!
//! Paths follow the convention the session lifecycle manager writes to:
//! one transcript per instance at `{log_dir}/{namespace}/{instance_id}.log`,
//! and one persisted conversation document per instance at
//! `{data_dir}/{namespace}/{instance_id}.json`.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the transcript directory.
pub const ENV_LOG_DIR: &str = "AGENT_CONSOLE_LOG_DIR";
/// Environment variable overriding the conversation data directory.
pub const ENV_DATA_DIR: &str = "AGENT_CONSOLE_DATA_DIR";

/// Tunables for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often each instance's poll loop reads the transcript.
    pub poll_interval: Duration,
    /// Root of the transcript tree written by the lifecycle manager.
    pub log_dir: PathBuf,
    /// Root of the persisted conversation tree.
    pub data_dir: PathBuf,
    /// FIFO cap on each instance's persisted log.
    pub max_records_per_instance: usize,
    /// Capacity of the cross-instance recent-history ring.
    pub recent_history_capacity: usize,
    /// Re-emissions within this window of an identical message are dropped.
    pub dedup_epsilon: Duration,
    /// Capacity of each per-instance broadcast channel. A subscriber that
    /// falls further behind than this loses events rather than stalling
    /// ingestion.
    pub channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            // The console UI renders "typing" feedback; 200ms keeps it live
            // without hammering the filesystem.
            poll_interval: Duration::from_millis(200),
            log_dir: base.join("logs"),
            data_dir: base.join("conversations"),
            max_records_per_instance: 500,
            recent_history_capacity: 200,
            dedup_epsilon: Duration::from_secs(1),
            channel_capacity: 256,
        }
    }
}

impl MonitorConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(ENV_LOG_DIR) {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        config
    }

    /// The transcript path for one instance.
    pub fn source_path(&self, instance_id: &str, namespace: &str) -> PathBuf {
        self.log_dir
            .join(namespace)
            .join(format!("{instance_id}.log"))
    }
}

fn default_base_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".agent-console"),
        // Headless environments without a home directory still get a
        // working pipeline; durability is best-effort there anyway.
        None => std::env::temp_dir().join("agent-console"),
    }
}
