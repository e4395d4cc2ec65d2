//! Transactional unit of work with bounded retry.
//!
//! Every multi-statement write in this crate runs through [`with_retry_tx`]:
//! the closure is executed inside a fresh transaction, committed on success,
//! rolled back on error, and re-run from scratch when the error is transient
//! (see [`DbError::is_transient`]).
//!
//! The closure may run more than once, so it must own (or clone) its inputs
//! rather than consume them.
//!
//! ```rust,ignore
//! let names = vec!["a".to_string()];
//! let deleted = with_retry_tx(&pool, &RetryPolicy::default(), |tx| {
//!     let names = names.clone();
//!     Box::pin(async move {
//!         let res = sqlx::query("DELETE FROM t WHERE name = ANY($1)")
//!             .bind(&names)
//!             .execute(&mut **tx)
//!             .await?;
//!         Ok(res.rows_affected())
//!     })
//! })
//! .await?;
//! ```

use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::DbError;
use crate::pool::DbPool;

/// Transaction type handed to unit-of-work closures.
pub type PgTransaction = sqlx::Transaction<'static, sqlx::Postgres>;

/// Retry policy for transactional writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,

    /// Delay before the first retry (in milliseconds).
    pub initial_backoff_ms: u64,

    /// Upper bound for a single delay (in milliseconds).
    pub max_backoff_ms: u64,

    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,

    /// Spread delays by up to 25% in either direction.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_backoff(mut self, initial_backoff_ms: u64) -> Self {
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay to wait before retry number `attempt` (1-based).
    #[must_use]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1);
        let capped = base.min(self.max_backoff_ms as f64);

        let delay_ms = if self.use_jitter && capped > 0.0 {
            let jitter_range = capped * 0.25;
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(delay_ms as u64)
    }
}

/// Run `op` inside a transaction, retrying transient failures.
///
/// # Errors
///
/// Returns the last error once it is non-transient or the retry budget is
/// spent.
pub async fn with_retry_tx<T, F>(
    pool: &DbPool,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, DbError>
where
    T: Send,
    F: for<'c> FnMut(&'c mut PgTransaction) -> BoxFuture<'c, Result<T, DbError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match run_in_tx(pool, &mut op).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let backoff = policy.calculate_backoff(attempt);
                warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    wait_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient database error, retrying transaction"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_in_tx<T, F>(pool: &DbPool, op: &mut F) -> Result<T, DbError>
where
    F: for<'c> FnMut(&'c mut PgTransaction) -> BoxFuture<'c, Result<T, DbError>>,
{
    let mut tx = pool.begin().await?;
    match op(&mut tx).await {
        Ok(value) => {
            tx.commit().await.map_err(DbError::from)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                debug!(error = %rollback_err, "Rollback after failed unit of work also failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially_without_jitter() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(policy.calculate_backoff(0), Duration::ZERO);
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(50));
        assert_eq!(policy.calculate_backoff(2), Duration::from_millis(100));
        assert_eq!(policy.calculate_backoff(3), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(policy.calculate_backoff(20), Duration::from_millis(2_000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy::default().with_initial_backoff(400);
        for _ in 0..50 {
            let ms = policy.calculate_backoff(1).as_millis();
            assert!((300..=500).contains(&ms), "{ms} outside jitter range");
        }
    }

    #[test]
    fn test_no_retry_policy() {
        assert_eq!(RetryPolicy::no_retry().max_retries, 0);
    }
}
