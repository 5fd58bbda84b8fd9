//! Driver configuration.
//!
//! Everything a session needs to start: contact points, pool sizing,
//! scheduler limits and named execution profiles. All durations are plain milliseconds so the JSON form stays
//! readable.
//!
//! # Example
//!
//! ```
//! use tessera_common::config::DriverConfig;
//!
//! let config = DriverConfig::from_json(r#"{
//!     "contact_points": [{ "address": "127.0.0.1:9042", "datacenter": "dc1" }],
//!     "local_datacenter": "dc1",
//!     "pool": { "local_size": 2 },
//!     "profiles": { "analytics": { "request_timeout_ms": 60000 } }
//! }"#).unwrap();
//!
//! assert_eq!(config.pool.local_size, 2);
//! assert_eq!(config.pool.remote_size, 1);
//! assert_eq!(config.profile("analytics").unwrap().request_timeout_ms, 60000);
//! assert!(config.profile("default").is_some());
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthConfig;

/// Name of the profile used when a request names none.
pub const DEFAULT_PROFILE: &str = "default";

/// Highest stream capacity a channel can have (non-negative `i16` ids).
pub const MAX_STREAMS_LIMIT: usize = 32768;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One initial node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPoint {
    pub address: SocketAddr,
    #[serde(default)]
    pub datacenter: Option<String>,
    /// Ring tokens owned by the node; empty disables token-aware routing to it.
    #[serde(default)]
    pub tokens: Vec<i64>,
}

impl ContactPoint {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            datacenter: None,
            tokens: Vec::new(),
        }
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn with_tokens(mut self, tokens: Vec<i64>) -> Self {
        self.tokens = tokens;
        self
    }
}

/// Connection pool and channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Channels per node in the local datacenter
    pub local_size: usize,
    /// Channels per node elsewhere
    pub remote_size: usize,
    /// Concurrent stream ids per channel
    pub max_streams_per_connection: usize,
    pub connect_timeout_ms: u64,
    /// Read idleness after which a heartbeat is sent
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Orphaned stream ids tolerated before the channel is replaced
    pub max_orphan_requests: usize,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Bound on draining in-flight requests during a graceful channel close
    pub close_drain_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            local_size: 1,
            remote_size: 1,
            max_streams_per_connection: 1024,
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: 30000,
            heartbeat_timeout_ms: 5000,
            max_orphan_requests: 256,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60000,
            close_drain_timeout_ms: 2000,
        }
    }
}

/// Worker pool and shutdown settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Callbacks and request tasks allowed to run concurrently
    pub worker_pool_size: usize,
    pub shutdown_quiet_period_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 1024,
            shutdown_quiet_period_ms: 2000,
            shutdown_timeout_ms: 15000,
        }
    }
}

impl SchedulerSettings {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_quiet_period_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// A named bundle of timeouts and policy parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Overall deadline of a request across all attempts
    pub request_timeout_ms: u64,
    /// Per-attempt timeout; defaults to the overall deadline
    pub attempt_timeout_ms: Option<u64>,
    pub page_size: Option<u32>,
    /// Default idempotence of statements that do not say
    pub idempotent: bool,
    pub max_same_node_retries: u32,
    /// Retries the default retry policy grants per error kind
    pub retry_max_retries: u32,
    pub ignore_write_timeout_for_non_idempotent: bool,
    /// Delay before each speculative execution; `None` disables them
    pub speculative_delay_ms: Option<u64>,
    /// Concurrent executions allowed, the first one included
    pub speculative_max_executions: usize,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 12000,
            attempt_timeout_ms: None,
            page_size: None,
            idempotent: false,
            max_same_node_retries: 1,
            retry_max_retries: 1,
            ignore_write_timeout_for_non_idempotent: false,
            speculative_delay_ms: None,
            speculative_max_executions: 1,
        }
    }
}

impl ProfileSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms.unwrap_or(self.request_timeout_ms))
    }

    pub fn speculative_delay(&self) -> Option<Duration> {
        self.speculative_delay_ms.map(Duration::from_millis)
    }
}

/// Top-level driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub contact_points: Vec<ContactPoint>,
    /// Nodes in this datacenter are local; all nodes are local when unset.
    pub local_datacenter: Option<String>,
    /// When false, nodes outside the local datacenter are never queried.
    pub allow_remote_datacenters: bool,
    pub pool: PoolSettings,
    pub scheduler: SchedulerSettings,
    /// Replicas per token for token-aware routing (SimpleStrategy).
    pub replication_factor: usize,
    pub profiles: HashMap<String, ProfileSettings>,
    pub auth: AuthConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            contact_points: Vec::new(),
            local_datacenter: None,
            allow_remote_datacenters: true,
            pool: PoolSettings::default(),
            scheduler: SchedulerSettings::default(),
            replication_factor: 1,
            profiles: HashMap::new(),
            auth: AuthConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn new(contact_points: Vec<ContactPoint>) -> Self {
        Self {
            contact_points,
            ..Default::default()
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: DriverConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Looks up a profile by name. The default profile always exists.
    pub fn profile(&self, name: &str) -> Option<ProfileSettings> {
        match self.profiles.get(name) {
            Some(profile) => Some(profile.clone()),
            None if name == DEFAULT_PROFILE => Some(ProfileSettings::default()),
            None => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.contact_points.is_empty() {
            return Err(ConfigError::Invalid("at least one contact point is required".into()));
        }

        let pool = &self.pool;
        if pool.local_size == 0 || pool.remote_size == 0 {
            return Err(ConfigError::Invalid("pool sizes must be at least 1".into()));
        }
        if pool.max_streams_per_connection == 0 || pool.max_streams_per_connection > MAX_STREAMS_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_streams_per_connection must be in 1..={}",
                MAX_STREAMS_LIMIT
            )));
        }
        if pool.max_orphan_requests >= pool.max_streams_per_connection {
            return Err(ConfigError::Invalid(format!(
                "max_orphan_requests ({}) must be below max_streams_per_connection ({})",
                pool.max_orphan_requests, pool.max_streams_per_connection
            )));
        }
        if pool.reconnect_base_delay_ms > pool.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect_base_delay_ms exceeds reconnect_max_delay_ms".into(),
            ));
        }
        if pool.heartbeat_interval_ms == 0 || pool.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat interval and timeout must be non-zero".into()));
        }

        if self.scheduler.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("worker_pool_size must be at least 1".into()));
        }
        if self.replication_factor == 0 {
            return Err(ConfigError::Invalid("replication_factor must be at least 1".into()));
        }

        for (name, profile) in &self.profiles {
            if profile.request_timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "profile '{}': request_timeout_ms must be non-zero",
                    name
                )));
            }
            if profile.speculative_max_executions == 0 {
                return Err(ConfigError::Invalid(format!(
                    "profile '{}': speculative_max_executions must be at least 1",
                    name
                )));
            }
        }

        Ok(())
    }
}
