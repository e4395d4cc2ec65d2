//! Push notifications that wake devices to fetch queued commands.
//!
//! A push carries no command data. Delivery failures are never fatal: the
//! commands stay queued and the device picks them up on its next check-in.

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use fleetmdm_core::HostUuid;
use serde::Serialize;
use tracing::debug;

use crate::error::PushError;

/// Wakes a device so it fetches its queued commands.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send_push(&self, host: &HostUuid) -> Result<(), PushError>;
}

/// Transport used when no push gateway is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPushTransport;

#[async_trait]
impl PushTransport for NoopPushTransport {
    async fn send_push(&self, host: &HostUuid) -> Result<(), PushError> {
        debug!(host_uuid = %host, "No push gateway configured, skipping push");
        Ok(())
    }
}

/// Records pushes for tests.
#[derive(Debug, Default)]
pub struct InMemoryPushTransport {
    sent: RwLock<Vec<HostUuid>>,
    failing_hosts: RwLock<HashSet<HostUuid>>,
}

impl InMemoryPushTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make pushes to `host` fail (for testing).
    pub fn fail_host(&self, host: &HostUuid) {
        self.failing_hosts
            .write()
            .expect("lock poisoned")
            .insert(host.clone());
    }

    /// Hosts pushed so far, in order.
    pub fn sent(&self) -> Vec<HostUuid> {
        self.sent.read().expect("lock poisoned").clone()
    }

    pub fn clear(&self) {
        self.sent.write().expect("lock poisoned").clear();
    }
}

#[async_trait]
impl PushTransport for InMemoryPushTransport {
    async fn send_push(&self, host: &HostUuid) -> Result<(), PushError> {
        if self.failing_hosts.read().expect("lock poisoned").contains(host) {
            return Err(PushError::Transport(format!("push to {host} refused")));
        }
        self.sent.write().expect("lock poisoned").push(host.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    host_uuid: &'a str,
}

/// Sends pushes through an HTTP push gateway.
///
/// `POST {base_url}/push` with `{"host_uuid": ".."}`; any 2xx is success.
#[derive(Debug, Clone)]
pub struct HttpPushTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPushTransport {
    /// Create a transport with the default 10 second timeout.
    ///
    /// # Errors
    ///
    /// Returns `PushError::Transport` if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self, PushError> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    /// # Errors
    ///
    /// Returns `PushError::Transport` if the HTTP client cannot be created.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PushError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send_push(&self, host: &HostUuid) -> Result<(), PushError> {
        let url = format!("{}/push", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&PushRequest {
                host_uuid: host.as_str(),
            })
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Rejected {
                host_uuid: host.to_string(),
                status: status.as_u16(),
            });
        }

        debug!(host_uuid = %host, "Push sent");
        Ok(())
    }
}
