//! # config
//!
//! why: one validated place for every knob a replica reads
//! relations: consumed by ReplicaNode, Overlay and SeatedMembership
//! what: ReplicaConfig, ReplicaConfigBuilder

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a replica node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Number of rendezvous candidates that hold consensus seats.
    pub quorum_size: usize,

    /// Key used to rank candidates; every node must agree on it.
    pub selection_key: String,

    /// Forced overlay wakeup in milliseconds, guards against missed broadcasts.
    pub tick_interval_ms: u64,

    /// Upper bound on a leader-side apply in milliseconds.
    pub apply_timeout_ms: u64,

    /// Upper bound on each peer status poll during reconciliation.
    pub reconcile_timeout_ms: u64,

    /// Upper bound on leaving the group during shutdown.
    pub leave_timeout_ms: u64,

    /// Messages kept for replay to new watchers.
    pub history_capacity: usize,

    /// Messages queued per watcher before new ones are dropped for it.
    pub observer_buffer: usize,

    /// Concurrent uploads accepted by the service.
    pub max_uploads: usize,

    /// Where credential material from the replicated log is written, if anywhere.
    pub authority_dir: Option<PathBuf>,

    /// Shared bearer token required on every rpc when set.
    pub token: Option<String>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            quorum_size: 3,
            selection_key: "bw.consensus".to_string(),
            tick_interval_ms: 1_000,
            apply_timeout_ms: 5_000,
            reconcile_timeout_ms: 3_000,
            leave_timeout_ms: 5_000,
            history_capacity: 256,
            observer_buffer: 128,
            max_uploads: 4,
            authority_dir: None,
            token: None,
        }
    }
}

impl ReplicaConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ReplicaConfigBuilder {
        ReplicaConfigBuilder::default()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }

    /// The rendezvous key as bytes.
    pub fn key(&self) -> &[u8] {
        self.selection_key.as_bytes()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.quorum_size == 0 {
            return Err("quorum_size must be > 0".to_string());
        }

        if self.selection_key.is_empty() {
            return Err("selection_key is required".to_string());
        }

        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be > 0".to_string());
        }

        if self.history_capacity == 0 || self.observer_buffer == 0 {
            return Err("history_capacity and observer_buffer must be > 0".to_string());
        }

        if self.max_uploads == 0 {
            return Err("max_uploads must be > 0".to_string());
        }

        Ok(())
    }
}

/// Builder for ReplicaConfig.
#[derive(Debug, Default)]
pub struct ReplicaConfigBuilder {
    config: ReplicaConfig,
}

impl ReplicaConfigBuilder {
    pub fn quorum_size(mut self, n: usize) -> Self {
        self.config.quorum_size = n;
        self
    }

    pub fn selection_key(mut self, key: impl Into<String>) -> Self {
        self.config.selection_key = key.into();
        self
    }

    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.config.tick_interval_ms = ms;
        self
    }

    pub fn apply_timeout_ms(mut self, ms: u64) -> Self {
        self.config.apply_timeout_ms = ms;
        self
    }

    pub fn reconcile_timeout_ms(mut self, ms: u64) -> Self {
        self.config.reconcile_timeout_ms = ms;
        self
    }

    pub fn leave_timeout_ms(mut self, ms: u64) -> Self {
        self.config.leave_timeout_ms = ms;
        self
    }

    pub fn history_capacity(mut self, n: usize) -> Self {
        self.config.history_capacity = n;
        self
    }

    pub fn observer_buffer(mut self, n: usize) -> Self {
        self.config.observer_buffer = n;
        self
    }

    pub fn max_uploads(mut self, n: usize) -> Self {
        self.config.max_uploads = n;
        self
    }

    pub fn authority_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.authority_dir = Some(dir.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<ReplicaConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}
