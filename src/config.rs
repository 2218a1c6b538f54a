//! Node Configuration
//!
//! Deserialized from a TOML file when `--config <path>` is given, defaults
//! otherwise. Every option is range-checked by `validate()` before the node
//! starts.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

pub const MAX_SECTION_SIZE_LIMIT: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationType {
    Sync,
    Async,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Per-section payload cap in bytes, 1..=10 MiB.
    pub max_section_size: usize,
    /// Number of replica slots, 0..=3. 0 disables replication entirely.
    pub replication_factor: u8,
    /// Steady-state delay between replication retry attempts.
    pub replication_retry_delay_ms: u64,
    pub enable_concurrency_check_for_sections: bool,
    pub replication_type: ReplicationType,
    /// In sync mode, propagate a failed replication to the caller instead
    /// of degrading to the retry timer.
    pub ensure_synchronized: bool,
    /// Idle window after which an actor instance deactivates, unless the
    /// session expiration extends it further.
    pub idle_deactivation_secs: u64,
    /// Opaque connection string handed to the existence-store collaborator.
    pub store_connection_string: Option<String>,
    /// When set, deletion batches are POSTed here fire-and-forget.
    pub invalidation_callback_url: Option<String>,
    /// External policy host polled into the local authorization cache.
    pub policy_agent_host: Option<String>,
    pub policy_refresh_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_section_size: 1024 * 1024,
            replication_factor: 2,
            replication_retry_delay_ms: 5_000,
            enable_concurrency_check_for_sections: true,
            replication_type: ReplicationType::Async,
            ensure_synchronized: false,
            idle_deactivation_secs: 300,
            store_connection_string: None,
            invalidation_callback_url: None,
            policy_agent_host: None,
            policy_refresh_delay_ms: 30_000,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path))?;
        let config: Self = toml::from_str(&raw).context("parsing config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_section_size == 0 || self.max_section_size > MAX_SECTION_SIZE_LIMIT {
            bail!(
                "max_section_size must be in 1..={}, got {}",
                MAX_SECTION_SIZE_LIMIT,
                self.max_section_size
            );
        }
        if self.replication_factor > 3 {
            bail!(
                "replication_factor must be in 0..=3, got {}",
                self.replication_factor
            );
        }
        if self.replication_retry_delay_ms == 0 {
            bail!("replication_retry_delay_ms must be positive");
        }
        if self.idle_deactivation_secs == 0 {
            bail!("idle_deactivation_secs must be positive");
        }
        Ok(())
    }

    pub fn replication_retry_delay(&self) -> Duration {
        Duration::from_millis(self.replication_retry_delay_ms)
    }

    pub fn idle_deactivation(&self) -> Duration {
        Duration::from_secs(self.idle_deactivation_secs)
    }

    pub fn policy_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.policy_refresh_delay_ms)
    }

    pub fn replication_enabled(&self) -> bool {
        self.replication_factor > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = ServerConfig::default();
        config.max_section_size = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.max_section_size = MAX_SECTION_SIZE_LIMIT + 1;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.replication_factor = 4;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.replication_retry_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_overrides() {
        let config: ServerConfig = toml::from_str(
            r#"
            max_section_size = 4096
            replication_factor = 1
            replication_type = "sync"
            ensure_synchronized = true
            invalidation_callback_url = "http://127.0.0.1:9000/invalidated"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_section_size, 4096);
        assert_eq!(config.replication_factor, 1);
        assert_eq!(config.replication_type, ReplicationType::Sync);
        assert!(config.ensure_synchronized);
        assert_eq!(
            config.invalidation_callback_url.as_deref(),
            Some("http://127.0.0.1:9000/invalidated")
        );
        // Untouched fields keep their defaults.
        assert!(config.enable_concurrency_check_for_sections);
        config.validate().unwrap();
    }
}
