//! # Apple Profile Reconciler
//!
//! Keeps the configuration profiles installed on enrolled macOS hosts in
//! line with the profiles assigned to each host's scope (global or team).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  set profiles   ┌────────────────┐
//! │ProfileService│────────────────►│  ProfileStore  │◄──────────────┐
//! └──────────────┘                 │ desired+ledger │               │
//!                                  └───────┬────────┘               │
//!                                          │ candidates             │ verifying /
//!                                          ▼                        │ failed / delete
//!                                  ┌────────────────┐       ┌───────┴────────┐
//!                                  │   Scheduler    │       │ResultProcessor │
//!                                  └───────┬────────┘       └───────▲────────┘
//!                                          │ queued rows            │ device results
//!                                          ▼                        │
//!                                  ┌────────────────┐  commands ┌───┴──────────┐
//!                                  │   Dispatcher   │──────────►│ CommandQueue │
//!                                  └───────┬────────┘           └──────────────┘
//!                                          │ push
//!                                          ▼
//!                                  ┌────────────────┐
//!                                  │ PushTransport  │
//!                                  └────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fleetmdm_apple::{
//!     Dispatcher, DispatcherConfig, InMemoryCommandQueue, InMemoryProfileStore,
//!     InMemoryScheduleLock, NoopPushTransport, ReconcileScheduler, SchedulerConfig,
//! };
//!
//! let store = Arc::new(InMemoryProfileStore::new());
//! let dispatcher = Dispatcher::new(
//!     store.clone(),
//!     Arc::new(InMemoryCommandQueue::new()),
//!     Arc::new(NoopPushTransport),
//!     DispatcherConfig::default(),
//! );
//! let scheduler = ReconcileScheduler::new(
//!     store,
//!     dispatcher,
//!     Arc::new(InMemoryScheduleLock::new()),
//!     SchedulerConfig::default(),
//! );
//! let report = scheduler.run_once().await?;
//! ```

pub mod audit;
pub mod bootstrap;
pub mod commander;
pub mod config;
pub mod diff;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod mobileconfig;
pub mod push;
pub mod results;
pub mod scheduler;
pub mod service;
pub mod setup_assistant;
pub mod store;
pub mod types;

pub use audit::{
    Activity, ActivitySink, InMemoryActivitySink, PgActivitySink, TracingActivitySink,
};
pub use bootstrap::{
    BootstrapPackage, BootstrapPackageStatus, BootstrapPackageStore, BootstrapService,
    BootstrapSummary, HostBootstrapPackage, InMemoryBootstrapPackageStore,
    PgBootstrapPackageStore,
};
pub use commander::{Command, CommandQueue, InMemoryCommandQueue, PgCommandQueue, QueuedCommand};
pub use config::{ConfigError, ReconcilerConfig};
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherConfig};
pub use error::{CommandError, MdmError, PushError, StoreError};
pub use hooks::{LifecycleHooks, TeamChangeReport};
pub use lock::{InMemoryScheduleLock, PgScheduleLock, ScheduleLock};
pub use mobileconfig::{validate_batch, Mobileconfig, ValidationError};
pub use push::{HttpPushTransport, InMemoryPushTransport, NoopPushTransport, PushTransport};
pub use results::{
    format_error_chain, CommandResult, CommandResultProcessor, CommandStatus, ErrorChainItem,
    ResultOutcome,
};
pub use scheduler::{PreviewReport, ReconcileReport, ReconcileScheduler, SchedulerConfig};
pub use service::ProfileService;
pub use setup_assistant::{
    InMemorySetupAssistantStore, PgSetupAssistantStore, SetupAssistant, SetupAssistantStore,
};
pub use store::{InMemoryProfileStore, PgProfileStore, ProfileStore};
pub use types::{
    ConfigProfile, DeliveryStatus, DiskEncryptionKey, DiskEncryptionSummary, HostProfile,
    HostProfileView, HostSelector, OperationType, ProfileCandidate, ProfileContent, ProfileId,
    ProfilesSummary,
};
