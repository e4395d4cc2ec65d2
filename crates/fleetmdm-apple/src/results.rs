//! Command result processor.
//!
//! Invoked by the protocol layer for every device result. Finds the ledger
//! row by (host, command UUID) and resolves it:
//!
//! | status | install | remove |
//! |--------|---------|--------|
//! | Acknowledged | verifying | row deleted |
//! | Error, CommandFormatError | failed | failed, or deleted when the profile was already gone |
//! | NotNow, Idle | unchanged | unchanged |
//!
//! Results that match no profile row may belong to a bootstrap package
//! install and are recorded there.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use fleetmdm_core::{CommandUuid, HostUuid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::bootstrap::{BootstrapPackageStatus, BootstrapPackageStore};
use crate::error::MdmError;
use crate::store::ProfileStore;
use crate::types::{DeliveryStatus, HostProfileUpdate, OperationType};

/// Error domain of device-side MDM client errors.
pub const MDM_CLIENT_ERROR_DOMAIN: &str = "MDMClientError";

/// `MDMClientError` code for "profile not installed".
pub const PROFILE_NOT_FOUND_CODE: i64 = 89;

/// Status reported by the device for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Acknowledged,
    Error,
    CommandFormatError,
    NotNow,
    Idle,
}

impl CommandStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Acknowledged => "Acknowledged",
            CommandStatus::Error => "Error",
            CommandStatus::CommandFormatError => "CommandFormatError",
            CommandStatus::NotNow => "NotNow",
            CommandStatus::Idle => "Idle",
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, CommandStatus::Error | CommandStatus::CommandFormatError)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Acknowledged" => Ok(CommandStatus::Acknowledged),
            "Error" => Ok(CommandStatus::Error),
            "CommandFormatError" => Ok(CommandStatus::CommandFormatError),
            "NotNow" => Ok(CommandStatus::NotNow),
            "Idle" => Ok(CommandStatus::Idle),
            _ => Err(format!("Unknown command status: {s}")),
        }
    }
}

/// One entry of a device error chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorChainItem {
    pub error_code: i64,
    pub error_domain: String,
    #[serde(default)]
    pub localized_description: String,
    #[serde(default, rename = "USEnglishDescription")]
    pub us_english_description: Option<String>,
}

impl ErrorChainItem {
    fn description(&self) -> &str {
        self.us_english_description
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.localized_description)
    }
}

/// Render an error chain as `"{domain} ({code}): {description}"` lines.
#[must_use]
pub fn format_error_chain(chain: &[ErrorChainItem]) -> String {
    chain
        .iter()
        .map(|item| {
            format!(
                "{} ({}): {}",
                item.error_domain,
                item.error_code,
                item.description()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Detail recorded for a failed command. Falls back to the status when the
/// device sent no error chain.
fn failure_detail(result: &CommandResult) -> String {
    if result.error_chain.is_empty() {
        result.status.as_str().to_string()
    } else {
        format_error_chain(&result.error_chain)
    }
}

/// Whether the chain says the profile is already absent from the device.
#[must_use]
pub fn is_profile_not_found(chain: &[ErrorChainItem]) -> bool {
    chain.iter().any(|item| {
        item.error_domain == MDM_CLIENT_ERROR_DOMAIN && item.error_code == PROFILE_NOT_FOUND_CODE
    })
}

/// A decoded device result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub host_uuid: HostUuid,
    pub command_uuid: CommandUuid,
    pub status: CommandStatus,
    #[serde(default)]
    pub error_chain: Vec<ErrorChainItem>,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// What processing a result did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultOutcome {
    Verifying,
    /// The row was deleted: removal confirmed, or profile already absent.
    Removed,
    Failed { detail: String },
    /// `NotNow` or `Idle`; the device will report again.
    Unchanged,
    Bootstrap(BootstrapPackageStatus),
    /// No profile row or bootstrap record carries this command.
    Unmatched,
}

/// Resolves ledger rows from device results.
#[derive(Clone)]
pub struct CommandResultProcessor {
    store: Arc<dyn ProfileStore>,
    bootstrap: Option<Arc<dyn BootstrapPackageStore>>,
}

impl CommandResultProcessor {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self {
            store,
            bootstrap: None,
        }
    }

    #[must_use]
    pub fn with_bootstrap(mut self, bootstrap: Arc<dyn BootstrapPackageStore>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Apply one device result.
    ///
    /// # Errors
    ///
    /// Store failures. A result whose row vanished in the meantime is
    /// [`ResultOutcome::Unmatched`], not an error.
    #[instrument(skip(self, result), fields(
        host_uuid = %result.host_uuid,
        command_uuid = %result.command_uuid,
        status = %result.status,
    ))]
    pub async fn process(&self, result: &CommandResult) -> Result<ResultOutcome, MdmError> {
        if !(result.status == CommandStatus::Acknowledged || result.status.is_error()) {
            debug!("Device deferred the command");
            return Ok(ResultOutcome::Unchanged);
        }

        let Some(row) = self
            .store
            .get_host_profile_by_command(&result.host_uuid, result.command_uuid)
            .await?
        else {
            return self.process_bootstrap(result).await;
        };

        let update = if result.status.is_error() {
            HostProfileUpdate {
                host_uuid: result.host_uuid.clone(),
                command_uuid: result.command_uuid,
                operation: row.operation,
                status: Some(DeliveryStatus::Failed),
                detail: failure_detail(result),
                ignorable_error: row.operation == OperationType::Remove
                    && is_profile_not_found(&result.error_chain),
            }
        } else {
            HostProfileUpdate {
                host_uuid: result.host_uuid.clone(),
                command_uuid: result.command_uuid,
                operation: row.operation,
                status: Some(DeliveryStatus::Verifying),
                detail: String::new(),
                ignorable_error: false,
            }
        };

        match self.store.update_or_delete_host_profile(&update).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("Ledger row superseded before its result arrived");
                return Ok(ResultOutcome::Unmatched);
            }
            Err(e) => return Err(e.into()),
        }

        let outcome = if update.deletes_row() {
            ResultOutcome::Removed
        } else if result.status.is_error() {
            ResultOutcome::Failed {
                detail: update.detail,
            }
        } else {
            ResultOutcome::Verifying
        };

        info!(
            profile_identifier = %row.profile_identifier,
            operation = %row.operation,
            outcome = ?outcome,
            "Command result processed"
        );
        Ok(outcome)
    }

    async fn process_bootstrap(&self, result: &CommandResult) -> Result<ResultOutcome, MdmError> {
        let Some(bootstrap) = &self.bootstrap else {
            debug!("No ledger row for command");
            return Ok(ResultOutcome::Unmatched);
        };

        let (status, detail) = if result.status.is_error() {
            (
                BootstrapPackageStatus::Failed,
                failure_detail(result),
            )
        } else {
            (BootstrapPackageStatus::Installed, String::new())
        };

        if bootstrap
            .set_host_result(&result.host_uuid, result.command_uuid, status, &detail)
            .await?
        {
            info!(status = ?status, "Bootstrap package result recorded");
            return Ok(ResultOutcome::Bootstrap(status));
        }

        debug!("No ledger row for command");
        Ok(ResultOutcome::Unmatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::InMemoryBootstrapPackageStore;
    use crate::store::InMemoryProfileStore;
    use crate::types::HostProfile;

    fn chain(domain: &str, code: i64, description: &str) -> Vec<ErrorChainItem> {
        vec![ErrorChainItem {
            error_code: code,
            error_domain: domain.to_string(),
            localized_description: description.to_string(),
            us_english_description: None,
        }]
    }

    async fn pending_row(
        store: &InMemoryProfileStore,
        operation: OperationType,
    ) -> (HostUuid, CommandUuid) {
        let host = HostUuid::new("H");
        let command = CommandUuid::new();
        store
            .bulk_upsert_host_profiles(&[HostProfile {
                host_uuid: host.clone(),
                profile_id: 1,
                profile_identifier: "I1".to_string(),
                profile_name: "N1".to_string(),
                checksum: "c".to_string(),
                operation,
                status: Some(DeliveryStatus::Pending),
                command_uuid: Some(command),
                detail: String::new(),
            }])
            .await
            .unwrap();
        (host, command)
    }

    fn result(host: &HostUuid, command: CommandUuid, status: CommandStatus) -> CommandResult {
        CommandResult {
            host_uuid: host.clone(),
            command_uuid: command,
            status,
            error_chain: Vec::new(),
            raw: Vec::new(),
        }
    }

    #[test]
    fn test_command_status_parses_wire_strings() {
        assert_eq!("NotNow".parse::<CommandStatus>().unwrap(), CommandStatus::NotNow);
        assert_eq!(
            "CommandFormatError".parse::<CommandStatus>().unwrap(),
            CommandStatus::CommandFormatError
        );
        assert!("acknowledged".parse::<CommandStatus>().is_err());
    }

    #[test]
    fn test_format_error_chain_prefers_english_description() {
        let items = vec![
            ErrorChainItem {
                error_code: 4,
                error_domain: "MCProfileErrorDomain".to_string(),
                localized_description: "Profil ungültig".to_string(),
                us_english_description: Some("Invalid profile".to_string()),
            },
            ErrorChainItem {
                error_code: 12,
                error_domain: "MDMErrorDomain".to_string(),
                localized_description: "Unknown command".to_string(),
                us_english_description: None,
            },
        ];
        assert_eq!(
            format_error_chain(&items),
            "MCProfileErrorDomain (4): Invalid profile\nMDMErrorDomain (12): Unknown command"
        );
    }

    #[test]
    fn test_error_chain_deserializes_from_device_keys() {
        let item: ErrorChainItem = serde_json::from_value(serde_json::json!({
            "ErrorCode": 89,
            "ErrorDomain": "MDMClientError",
            "LocalizedDescription": "Profile not found",
            "USEnglishDescription": "Profile not found"
        }))
        .unwrap();
        assert!(is_profile_not_found(&[item]));
    }

    #[tokio::test]
    async fn test_acknowledged_install_becomes_verifying() {
        let store = Arc::new(InMemoryProfileStore::new());
        let (host, command) = pending_row(&store, OperationType::Install).await;
        let processor = CommandResultProcessor::new(store.clone());

        let outcome = processor
            .process(&result(&host, command, CommandStatus::Acknowledged))
            .await
            .unwrap();

        assert_eq!(outcome, ResultOutcome::Verifying);
        let row = store.host_profile(&host, 1).unwrap();
        assert_eq!(row.status, Some(DeliveryStatus::Verifying));
    }

    #[tokio::test]
    async fn test_acknowledged_remove_deletes_row() {
        let store = Arc::new(InMemoryProfileStore::new());
        let (host, command) = pending_row(&store, OperationType::Remove).await;
        let processor = CommandResultProcessor::new(store.clone());

        let outcome = processor
            .process(&result(&host, command, CommandStatus::Acknowledged))
            .await
            .unwrap();

        assert_eq!(outcome, ResultOutcome::Removed);
        assert_eq!(store.host_profile_count(), 0);
    }

    #[tokio::test]
    async fn test_error_marks_failed_with_detail() {
        let store = Arc::new(InMemoryProfileStore::new());
        let (host, command) = pending_row(&store, OperationType::Install).await;
        let processor = CommandResultProcessor::new(store.clone());
        let mut res = result(&host, command, CommandStatus::Error);
        res.error_chain = chain("MDMErrorDomain", 12, "Unknown command");

        let outcome = processor.process(&res).await.unwrap();

        assert!(matches!(outcome, ResultOutcome::Failed { .. }));
        let row = store.host_profile(&host, 1).unwrap();
        assert_eq!(row.status, Some(DeliveryStatus::Failed));
        assert!(row.detail.contains("Unknown command"));
    }

    #[tokio::test]
    async fn test_error_without_chain_records_status() {
        let store = Arc::new(InMemoryProfileStore::new());
        let (host, command) = pending_row(&store, OperationType::Install).await;
        let processor = CommandResultProcessor::new(store.clone());

        let outcome = processor
            .process(&result(&host, command, CommandStatus::CommandFormatError))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ResultOutcome::Failed {
                detail: "CommandFormatError".to_string()
            }
        );
        let row = store.host_profile(&host, 1).unwrap();
        assert_eq!(row.detail, "CommandFormatError");
    }

    #[tokio::test]
    async fn test_profile_not_found_on_remove_is_ignored() {
        let store = Arc::new(InMemoryProfileStore::new());
        let (host, command) = pending_row(&store, OperationType::Remove).await;
        let processor = CommandResultProcessor::new(store.clone());
        let mut res = result(&host, command, CommandStatus::Error);
        res.error_chain = chain(MDM_CLIENT_ERROR_DOMAIN, PROFILE_NOT_FOUND_CODE, "Profile not found");

        assert_eq!(processor.process(&res).await.unwrap(), ResultOutcome::Removed);
        assert_eq!(store.host_profile_count(), 0);
    }

    #[tokio::test]
    async fn test_profile_not_found_on_install_still_fails() {
        let store = Arc::new(InMemoryProfileStore::new());
        let (host, command) = pending_row(&store, OperationType::Install).await;
        let processor = CommandResultProcessor::new(store.clone());
        let mut res = result(&host, command, CommandStatus::CommandFormatError);
        res.error_chain = chain(MDM_CLIENT_ERROR_DOMAIN, PROFILE_NOT_FOUND_CODE, "Profile not found");

        assert!(matches!(
            processor.process(&res).await.unwrap(),
            ResultOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_not_now_leaves_row_pending() {
        let store = Arc::new(InMemoryProfileStore::new());
        let (host, command) = pending_row(&store, OperationType::Install).await;
        let processor = CommandResultProcessor::new(store.clone());

        for status in [CommandStatus::NotNow, CommandStatus::Idle] {
            let outcome = processor.process(&result(&host, command, status)).await.unwrap();
            assert_eq!(outcome, ResultOutcome::Unchanged);
        }
        let row = store.host_profile(&host, 1).unwrap();
        assert_eq!(row.status, Some(DeliveryStatus::Pending));
    }

    #[tokio::test]
    async fn test_unmatched_result_goes_to_bootstrap_ledger() {
        let store = Arc::new(InMemoryProfileStore::new());
        let bootstrap = Arc::new(InMemoryBootstrapPackageStore::new());
        let host = HostUuid::new("H");
        let command = CommandUuid::new();
        bootstrap.record_host_package(&host, command).await.unwrap();
        let processor = CommandResultProcessor::new(store).with_bootstrap(bootstrap.clone());

        let mut res = result(&host, command, CommandStatus::Error);
        res.error_chain = chain("InstallError", 3, "Bad package");
        let outcome = processor.process(&res).await.unwrap();

        assert_eq!(outcome, ResultOutcome::Bootstrap(BootstrapPackageStatus::Failed));
        let record = bootstrap.host_package(&host).await.unwrap().unwrap();
        assert_eq!(record.detail, "InstallError (3): Bad package");

        let stray = processor
            .process(&result(&host, CommandUuid::new(), CommandStatus::Acknowledged))
            .await
            .unwrap();
        assert_eq!(stray, ResultOutcome::Unmatched);
    }
}
