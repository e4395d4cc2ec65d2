//! fleetmdm Database Layer
//!
//! PostgreSQL persistence for the MDM Apple profile reconciler.
//!
//! # Modules
//!
//! - [`pool`] - Connection pool wrapper ([`DbPool`])
//! - [`retry`] - Transactional unit of work with bounded retry ([`with_retry_tx`])
//! - [`migrations`] - Embedded schema migrations
//! - [`models`] - One module per table with its parameterized queries
//! - [`error`] - [`DbError`] and transient-failure classification
//!
//! # Example
//!
//! ```rust,ignore
//! use fleetmdm_db::{run_migrations, DbPool};
//!
//! let pool = DbPool::connect("postgres://localhost/fleet").await?;
//! run_migrations(&pool).await?;
//! ```

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod retry;

pub use error::DbError;
pub use migrations::run_migrations;
pub use pool::DbPool;
pub use retry::{with_retry_tx, PgTransaction, RetryPolicy};
