//! Monitor configuration.
//!
//! All tunables live in a single immutable value plumbed at construction, so
//! tests can instantiate many monitors in one process without touching any
//! process-global state.

use std::time::Duration;

use thiserror::Error;

/// Error raised when a configuration value fails validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field held a value outside its valid range.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Tunables recognized by the monitor core.
///
/// Defaults mirror the production values; tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Restrict the seed peer map to these names at first boot. Empty means
    /// no restriction.
    pub initial_members: Vec<String>,

    /// Per-requester trim deadline on the sync leader.
    pub sync_trim_timeout: Duration,
    /// Per-chunk deadline on both sides of the chunk stream.
    pub sync_timeout: Duration,
    /// Requester aborts after this long without a heartbeat reply.
    pub sync_heartbeat_timeout: Duration,
    /// Interval between requester heartbeats to the sync leader.
    pub sync_heartbeat_interval: Duration,
    /// Back-off after the leader answered a sync start with RETRY.
    pub sync_backoff_timeout: Duration,
    /// Give up re-picking providers after this many chunk timeouts.
    pub sync_max_retries: u32,
    /// Upper bound on a single sync chunk's payload.
    pub sync_max_chunk_size: usize,
    /// Emit a CRC every this many chunks (and always on the last).
    pub sync_chunk_crc_interval: u32,
    /// Delay before re-enabling log trimming after the last requester left.
    pub trim_reenable_delay: Duration,

    /// Probe replies must arrive within this window.
    pub probe_timeout: Duration,
    /// Period of the monitor-wide tick.
    pub tick_interval: Duration,
    /// Out-of-quorum tolerance for client sessions and waitlisted messages.
    pub lease: Duration,
    /// Maximum committed-version gap a joiner may close through elections
    /// alone; beyond it, a full store sync is required.
    pub max_join_drift: u64,
    /// Client session expiry granted on subscribe.
    pub subscribe_interval: Duration,

    /// Debug override: assume this monitor is the sync leader.
    pub sync_debug_leader: Option<String>,
    /// Debug override: fetch chunks from this monitor instead of the leader.
    pub sync_debug_provider: Option<String>,
    /// Debug override: provider to fall back to on chunk timeout.
    pub sync_debug_provider_fallback: Option<String>,

    /// Fault injection: panic at this numbered sync-leader checkpoint.
    pub sync_leader_kill_at: u32,
    /// Fault injection: panic at this numbered provider checkpoint.
    pub sync_provider_kill_at: u32,
    /// Fault injection: panic at this numbered requester checkpoint.
    pub sync_requester_kill_at: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_members: Vec::new(),
            sync_trim_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(30),
            sync_heartbeat_timeout: Duration::from_secs(30),
            sync_heartbeat_interval: Duration::from_secs(5),
            sync_backoff_timeout: Duration::from_secs(30),
            sync_max_retries: 5,
            sync_max_chunk_size: 1024 * 1024,
            sync_chunk_crc_interval: 8,
            trim_reenable_delay: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            tick_interval: Duration::from_secs(5),
            lease: Duration::from_secs(5),
            max_join_drift: 10,
            subscribe_interval: Duration::from_secs(300),
            sync_debug_leader: None,
            sync_debug_provider: None,
            sync_debug_provider_fallback: None,
            sync_leader_kill_at: 0,
            sync_provider_kill_at: 0,
            sync_requester_kill_at: 0,
        }
    }
}

impl MonitorConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_max_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sync_max_chunk_size",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.sync_chunk_crc_interval == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sync_chunk_crc_interval",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.sync_heartbeat_interval >= self.sync_heartbeat_timeout {
            return Err(ConfigError::InvalidValue {
                key: "sync_heartbeat_interval",
                reason: format!(
                    "must be shorter than sync_heartbeat_timeout ({:?})",
                    self.sync_heartbeat_timeout
                ),
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "tick_interval",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MonitorConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let config = MonitorConfig {
            sync_max_chunk_size: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sync_max_chunk_size"));
    }

    #[test]
    fn heartbeat_interval_must_undercut_timeout() {
        let config = MonitorConfig {
            sync_heartbeat_interval: Duration::from_secs(60),
            sync_heartbeat_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_tick_interval_rejected() {
        let config = MonitorConfig {
            tick_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
