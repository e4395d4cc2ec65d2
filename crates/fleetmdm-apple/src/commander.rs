//! Device commands and the durable command queue.
//!
//! Commands are serialized as Apple plist dictionaries carrying their
//! `CommandUUID`; the device echoes that UUID back in its result, which is
//! how results are correlated to ledger rows.

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use base64::Engine;
use fleetmdm_core::{CommandUuid, HostUuid};
use fleetmdm_db::models::MdmCommand;
use fleetmdm_db::{DbError, DbPool};
use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// A command addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum Command {
    InstallProfile {
        #[serde(skip)]
        payload: Vec<u8>,
    },
    RemoveProfile {
        identifier: String,
    },
    InstallEnterpriseApplication {
        manifest_url: String,
    },
}

impl Command {
    /// Apple `RequestType` of the command.
    #[must_use]
    pub fn request_type(&self) -> &'static str {
        match self {
            Command::InstallProfile { .. } => "InstallProfile",
            Command::RemoveProfile { .. } => "RemoveProfile",
            Command::InstallEnterpriseApplication { .. } => "InstallEnterpriseApplication",
        }
    }

    /// Serialize the command for the device.
    #[must_use]
    pub fn to_plist(&self, command_uuid: CommandUuid) -> Vec<u8> {
        let body = match self {
            Command::InstallProfile { payload } => format!(
                "\t\t<key>Payload</key>\n\t\t<data>{}</data>\n",
                base64::engine::general_purpose::STANDARD.encode(payload)
            ),
            Command::RemoveProfile { identifier } => format!(
                "\t\t<key>Identifier</key>\n\t\t<string>{}</string>\n",
                escape(identifier.as_str())
            ),
            Command::InstallEnterpriseApplication { manifest_url } => format!(
                "\t\t<key>ManifestURL</key>\n\t\t<string>{}</string>\n",
                escape(manifest_url.as_str())
            ),
        };

        format!(
            concat!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
                "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" ",
                "\"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n",
                "<plist version=\"1.0\">\n",
                "<dict>\n",
                "\t<key>CommandUUID</key>\n",
                "\t<string>{uuid}</string>\n",
                "\t<key>Command</key>\n",
                "\t<dict>\n",
                "\t\t<key>RequestType</key>\n",
                "\t\t<string>{request_type}</string>\n",
                "{body}",
                "\t</dict>\n",
                "</dict>\n",
                "</plist>\n"
            ),
            uuid = command_uuid,
            request_type = self.request_type(),
            body = body,
        )
        .into_bytes()
    }
}

/// Durable per-host command queue owned by the protocol layer.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Enqueue `command` for `host` under `command_uuid`.
    async fn enqueue(
        &self,
        host: &HostUuid,
        command_uuid: CommandUuid,
        command: &Command,
    ) -> Result<(), CommandError>;
}

/// A command accepted by [`InMemoryCommandQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub host_uuid: HostUuid,
    pub command_uuid: CommandUuid,
    pub command: Command,
}

/// In-memory command queue for tests.
#[derive(Debug, Default)]
pub struct InMemoryCommandQueue {
    commands: RwLock<Vec<QueuedCommand>>,
    failing_hosts: RwLock<HashSet<HostUuid>>,
}

impl InMemoryCommandQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every enqueue for `host` fail (for testing).
    pub fn fail_host(&self, host: &HostUuid) {
        self.failing_hosts
            .write()
            .expect("lock poisoned")
            .insert(host.clone());
    }

    /// Let enqueues for `host` succeed again (for testing).
    pub fn recover_host(&self, host: &HostUuid) {
        self.failing_hosts.write().expect("lock poisoned").remove(host);
    }

    /// Everything enqueued so far, in order.
    pub fn commands(&self) -> Vec<QueuedCommand> {
        self.commands.read().expect("lock poisoned").clone()
    }

    pub fn commands_for(&self, host: &HostUuid) -> Vec<QueuedCommand> {
        self.commands
            .read()
            .expect("lock poisoned")
            .iter()
            .filter(|c| &c.host_uuid == host)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.commands.read().expect("lock poisoned").len()
    }

    pub fn clear(&self) {
        self.commands.write().expect("lock poisoned").clear();
    }
}

#[async_trait]
impl CommandQueue for InMemoryCommandQueue {
    async fn enqueue(
        &self,
        host: &HostUuid,
        command_uuid: CommandUuid,
        command: &Command,
    ) -> Result<(), CommandError> {
        if self.failing_hosts.read().expect("lock poisoned").contains(host) {
            return Err(CommandError::EnqueueFailed {
                host_uuid: host.to_string(),
                command_uuid: command_uuid.to_string(),
                message: "queue unavailable".to_string(),
            });
        }
        self.commands.write().expect("lock poisoned").push(QueuedCommand {
            host_uuid: host.clone(),
            command_uuid,
            command: command.clone(),
        });
        Ok(())
    }
}

/// Command queue backed by the `mdm_commands` tables.
#[derive(Debug, Clone)]
pub struct PgCommandQueue {
    pool: DbPool,
}

impl PgCommandQueue {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommandQueue for PgCommandQueue {
    async fn enqueue(
        &self,
        host: &HostUuid,
        command_uuid: CommandUuid,
        command: &Command,
    ) -> Result<(), CommandError> {
        MdmCommand::enqueue(
            self.pool.inner(),
            host.as_str(),
            *command_uuid.as_uuid(),
            command.request_type(),
            &command.to_plist(command_uuid),
        )
        .await
        .map_err(|e| CommandError::EnqueueFailed {
            host_uuid: host.to_string(),
            command_uuid: command_uuid.to_string(),
            message: DbError::from(e).to_string(),
        })
    }
}
