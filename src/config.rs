//! Engine configuration
//!
//! Static settings are plain structs with validated defaults. Behaviors
//! that operators tune at runtime (rate limits, per-domain allowlists,
//! retention) are dynamic properties: pure functions injected by the host,
//! so the core never reads a global.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::execution::DomainId;

/// Fixed-at-startup engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of shards the keyspace is partitioned into
    pub shard_count: i32,
    /// Byte budget for the execution cache
    pub execution_cache_max_bytes: usize,
    /// Replication queue read batch size
    pub replication_batch_size: usize,
    /// Budget for one public engine operation, including lock acquisition
    pub operation_timeout_ms: u64,
    /// This cluster's name in replication topology
    pub cluster_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: 16384,
            execution_cache_max_bytes: 128 << 20,
            replication_batch_size: 100,
            operation_timeout_ms: 10_000,
            cluster_name: "active".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.shard_count <= 0 {
            return Err(EngineError::BadRequest(
                "shard_count must be positive".into(),
            ));
        }
        if self.execution_cache_max_bytes == 0 {
            return Err(EngineError::BadRequest(
                "execution_cache_max_bytes must be positive".into(),
            ));
        }
        if self.cluster_name.is_empty() {
            return Err(EngineError::BadRequest("cluster_name is required".into()));
        }
        Ok(())
    }
}

/// `() -> i64` property, re-read on every use
pub type IntProperty = Arc<dyn Fn() -> i64 + Send + Sync>;
/// `(domain) -> bool` property
pub type DomainBoolProperty = Arc<dyn Fn(&DomainId) -> bool + Send + Sync>;
/// `(domain) -> duration` property
pub type DomainDurationProperty = Arc<dyn Fn(&DomainId) -> Duration + Send + Sync>;

/// Runtime-tunable knobs, injected by the host
#[derive(Clone)]
pub struct DynamicConfig {
    /// Scavenger persistence operations per second
    pub scavenger_rps: IntProperty,
    /// History retention per domain
    pub domain_max_retention: DomainDurationProperty,
    /// Gate deciding whether the fixer touches a domain's entities
    pub fixer_domain_allowlist: DomainBoolProperty,
}

impl DynamicConfig {
    /// Constant-valued property
    pub fn fixed_int(value: i64) -> IntProperty {
        Arc::new(move || value)
    }

    /// Property that ignores the domain
    pub fn fixed_retention(duration: Duration) -> DomainDurationProperty {
        Arc::new(move |_| duration)
    }

    /// Allow every domain
    pub fn allow_all() -> DomainBoolProperty {
        Arc::new(|_| true)
    }
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            scavenger_rps: Self::fixed_int(100),
            domain_max_retention: Self::fixed_retention(Duration::days(7)),
            fixer_domain_allowlist: Self::allow_all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_shards() {
        let config = EngineConfig {
            shard_count: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dynamic_properties_are_reread() {
        use std::sync::atomic::{AtomicI64, Ordering};
        let value = Arc::new(AtomicI64::new(50));
        let reader = Arc::clone(&value);
        let property: IntProperty = Arc::new(move || reader.load(Ordering::Relaxed));
        assert_eq!(property(), 50);
        value.store(75, Ordering::Relaxed);
        assert_eq!(property(), 75);
    }
}
