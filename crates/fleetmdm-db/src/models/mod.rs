//! Database models, one per table.

pub mod activity;
pub mod bootstrap_package;
pub mod command_queue;
pub mod config_profile;
pub mod cron_lock;
pub mod disk_encryption_key;
pub mod host;
pub mod host_profile;
pub mod profile_summary;
pub mod setup_assistant;

pub use activity::ActivityRecord;
pub use bootstrap_package::{
    BootstrapPackageCounts, BootstrapPackageStatus, CreateMdmAppleBootstrapPackage,
    HostMdmAppleBootstrapPackage, MdmAppleBootstrapPackageMeta,
};
pub use command_queue::MdmCommand;
pub use config_profile::{MdmAppleConfigProfile, MdmAppleProfileContents, UpsertMdmAppleConfigProfile};
pub use cron_lock::CronLock;
pub use disk_encryption_key::HostDiskEncryptionKey;
pub use host::{Host, MdmAppleEnrollment, ENROLLMENT_TYPE_DEVICE, PLATFORM_DARWIN};
pub use host_profile::{
    DeliveryStatus, HostMdmAppleProfile, HostProfileCandidate, OperationType,
    UpsertHostMdmAppleProfile,
};
pub use profile_summary::{DiskEncryptionCounts, ProfileStatusCounts};
pub use setup_assistant::MdmAppleSetupAssistant;
