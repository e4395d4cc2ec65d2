//! Reconciler configuration, read from environment variables.

use std::str::FromStr;
use std::time::Duration;

use fleetmdm_db::RetryPolicy;

use crate::dispatcher::DispatcherConfig;
use crate::scheduler::SchedulerConfig;

/// Configuration of the reconciler process.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Database connection URL.
    pub database_url: String,

    pub database_max_connections: u32,

    /// Seconds between reconciliation passes.
    pub reconcile_interval_secs: u64,

    /// Hosts dispatched concurrently within a pass.
    pub dispatch_concurrency: usize,

    /// Retries of a transaction that hit a transient conflict.
    pub store_max_retries: u32,

    pub store_retry_base_delay_ms: u64,

    /// Wait after a decryptability check before its verdict applies.
    pub disk_encryption_grace_secs: u64,

    pub schedule_lock_ttl_secs: u64,

    /// Lease owner name. Defaults to a random UUID per process.
    pub instance_id: String,

    /// Push gateway base URL. No pushes are sent when unset.
    pub push_gateway_url: Option<String>,

    /// Queue status rows from hooks instead of waiting for the next pass.
    pub eager_pending: bool,
}

impl ReconcilerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// Tests supply variables this way without touching the process
    /// environment.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let database_url =
            reader("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL".into()))?;

        let reconcile_interval_secs = parse_or(&reader, "MDM_RECONCILE_INTERVAL_SECS", 60)?;
        if reconcile_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "MDM_RECONCILE_INTERVAL_SECS".into(),
                "must be greater than zero".into(),
            ));
        }

        let dispatch_concurrency = parse_or(&reader, "MDM_DISPATCH_CONCURRENCY", 4)?;
        if dispatch_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "MDM_DISPATCH_CONCURRENCY".into(),
                "must be greater than zero".into(),
            ));
        }

        let instance_id = reader("MDM_INSTANCE_ID")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let push_gateway_url = reader("MDM_PUSH_GATEWAY_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let eager_pending = reader("MDM_EAGER_PENDING")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        Ok(Self {
            database_url,
            database_max_connections: parse_or(&reader, "DATABASE_MAX_CONNECTIONS", 10)?,
            reconcile_interval_secs,
            dispatch_concurrency,
            store_max_retries: parse_or(&reader, "MDM_STORE_MAX_RETRIES", 3)?,
            store_retry_base_delay_ms: parse_or(&reader, "MDM_STORE_RETRY_BASE_DELAY_MS", 50)?,
            disk_encryption_grace_secs: parse_or(&reader, "MDM_DISK_ENCRYPTION_GRACE_SECS", 60)?,
            schedule_lock_ttl_secs: parse_or(&reader, "MDM_SCHEDULE_LOCK_TTL_SECS", 300)?,
            instance_id,
            push_gateway_url,
            eager_pending,
        })
    }

    #[must_use]
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.reconcile_interval_secs),
            lock_ttl: Duration::from_secs(self.schedule_lock_ttl_secs),
            instance_id: self.instance_id.clone(),
        }
    }

    #[must_use]
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            concurrency: self.dispatch_concurrency,
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.store_max_retries,
            initial_backoff_ms: self.store_retry_base_delay_ms,
            ..RetryPolicy::default()
        }
    }

    #[must_use]
    pub fn disk_encryption_grace(&self) -> Duration {
        Duration::from_secs(self.disk_encryption_grace_secs)
    }
}

fn parse_or<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.into(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
