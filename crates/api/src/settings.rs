//! Operator settings read from `KEEL_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use keel_apply::RetryConfig;
use keel_persist::{MemoryCache, SignatureCache, SqliteCache};
use keel_store::StatusPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSettings {
    /// Namespace to watch; all namespaces when unset.
    pub namespace: Option<String>,
    pub resync_secs: u64,
    pub status_interval_secs: u64,
    pub failure_threshold: u32,
    pub grace_secs: u64,
    pub apply_max_attempts: u32,
    pub queue_cap: usize,
    pub db_path: Option<String>,
    pub disable_persist: bool,
    pub metrics_addr: Option<String>,
    /// Mixed into every generated product secret.
    #[serde(skip_serializing)]
    pub credential_seed: Option<String>,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_secs: 300,
            status_interval_secs: 15,
            failure_threshold: 3,
            grace_secs: 120,
            apply_max_attempts: 4,
            queue_cap: 2048,
            db_path: None,
            disable_persist: false,
            metrics_addr: None,
            credential_seed: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> { std::env::var(name).ok().and_then(|s| s.parse().ok()) }

impl OperatorSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            namespace: std::env::var("KEEL_NAMESPACE").ok().filter(|s| !s.is_empty()),
            resync_secs: env_parse("KEEL_RESYNC_SECS").unwrap_or(d.resync_secs),
            status_interval_secs: env_parse("KEEL_STATUS_INTERVAL_SECS").unwrap_or(d.status_interval_secs),
            failure_threshold: env_parse("KEEL_FAILURE_THRESHOLD").unwrap_or(d.failure_threshold),
            grace_secs: env_parse("KEEL_GRACE_SECS").unwrap_or(d.grace_secs),
            apply_max_attempts: env_parse("KEEL_APPLY_MAX_ATTEMPTS").unwrap_or(d.apply_max_attempts),
            queue_cap: env_parse("KEEL_QUEUE_CAP").unwrap_or(d.queue_cap),
            db_path: std::env::var("KEEL_DB_PATH").ok().filter(|s| !s.is_empty()),
            disable_persist: std::env::var("KEEL_DISABLE_PERSIST")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            metrics_addr: std::env::var("KEEL_METRICS_ADDR").ok().filter(|s| !s.is_empty()),
            credential_seed: std::env::var("KEEL_CREDENTIAL_SEED").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn resync(&self) -> Duration { Duration::from_secs(self.resync_secs.max(1)) }
    pub fn status_interval(&self) -> Duration { Duration::from_secs(self.status_interval_secs.max(1)) }

    pub fn status_policy(&self) -> StatusPolicy {
        StatusPolicy { failure_threshold: self.failure_threshold.max(1), grace: Duration::from_secs(self.grace_secs) }
    }

    pub fn retry(&self) -> RetryConfig { RetryConfig::with_max_attempts(self.apply_max_attempts) }

    /// Signature cache for one instance loop. Falls back to memory if SQLite cannot be opened.
    pub fn open_cache(&self) -> Box<dyn SignatureCache> {
        if self.disable_persist {
            return Box::new(MemoryCache::new());
        }
        let opened = match &self.db_path {
            Some(path) => SqliteCache::open(path),
            None => SqliteCache::open_default(),
        };
        match opened {
            Ok(c) => Box::new(c),
            Err(e) => {
                warn!(error = %e, "signature store unavailable; using memory");
                Box::new(MemoryCache::new())
            }
        }
    }
}
