//! Named leases that keep one scheduler pass running at a time across
//! server processes.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetmdm_db::models::CronLock;
use fleetmdm_db::DbPool;

use crate::error::StoreError;

/// Distributed lease used by the scheduler.
#[async_trait]
pub trait ScheduleLock: Send + Sync {
    /// Take or extend the lease `name` for `owner`. Returns `false` when
    /// another owner holds an unexpired lease.
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Release the lease if `owner` holds it.
    async fn release(&self, name: &str, owner: &str) -> Result<(), StoreError>;
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

/// In-process lease table for tests and single-instance deployments.
#[derive(Debug, Default)]
pub struct InMemoryScheduleLock {
    leases: RwLock<HashMap<String, (String, DateTime<Utc>)>>,
}

impl InMemoryScheduleLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a lease, if unexpired.
    pub fn holder(&self, name: &str) -> Option<String> {
        self.leases
            .read()
            .expect("lock poisoned")
            .get(name)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(owner, _)| owner.clone())
    }
}

#[async_trait]
impl ScheduleLock for InMemoryScheduleLock {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.write().expect("lock poisoned");
        let now = Utc::now();
        let free = leases
            .get(name)
            .map_or(true, |(holder, expires_at)| holder == owner || *expires_at <= now);
        if free {
            leases.insert(name.to_string(), (owner.to_string(), expiry(ttl)));
        }
        Ok(free)
    }

    async fn release(&self, name: &str, owner: &str) -> Result<(), StoreError> {
        let mut leases = self.leases.write().expect("lock poisoned");
        if leases.get(name).is_some_and(|(holder, _)| holder == owner) {
            leases.remove(name);
        }
        Ok(())
    }
}

/// Lease stored in the `cron_locks` table.
#[derive(Debug, Clone)]
pub struct PgScheduleLock {
    pool: DbPool,
}

impl PgScheduleLock {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleLock for PgScheduleLock {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(CronLock::try_acquire(self.pool.inner(), name, owner, expiry(ttl)).await?)
    }

    async fn release(&self, name: &str, owner: &str) -> Result<(), StoreError> {
        CronLock::release(self.pool.inner(), name, owner).await?;
        Ok(())
    }
}
