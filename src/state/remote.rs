//! Read-only references to another run's published outputs.
//!
//! A remote state reference never exposes resource records; only the
//! `outputs` section of the referenced snapshot is read.

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, StateError};

use super::store::StateStore;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Read-only view of another snapshot's published outputs.
#[async_trait]
pub trait RemoteState: Send + Sync {
    /// Returns the published output values.
    async fn outputs(&self) -> Result<BTreeMap<String, Value>>;

    /// Returns one output value, if published.
    async fn output(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.outputs().await?.remove(name))
    }
}

/// Remote state backed by any [`StateStore`].
#[derive(Debug)]
pub struct StoreRemoteState<S> {
    store: S,
}

impl<S: StateStore> StoreRemoteState<S> {
    /// Wraps a store.
    pub const fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: StateStore> RemoteState for StoreRemoteState<S> {
    async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        let snapshot = self.store.read_snapshot().await?;
        debug!(
            "Read {} outputs from {} state {}",
            snapshot.outputs.len(),
            self.store.backend_type(),
            snapshot.version_label()
        );
        Ok(snapshot.outputs)
    }
}

/// Remote state fetched from an HTTP endpoint serving a snapshot document.
#[derive(Debug, Clone)]
pub struct HttpRemoteState {
    client: Client,
    url: String,
    token: Option<String>,
}

/// The only part of a snapshot document this reader deserializes.
#[derive(Debug, Deserialize)]
struct PublishedOutputs {
    #[serde(default)]
    outputs: BTreeMap<String, Value>,
}

impl HttpRemoteState {
    /// Creates a reference to the snapshot document at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| StateError::backend(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.to_string(),
            token: None,
        })
    }

    /// Sends `token` as a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl RemoteState for HttpRemoteState {
    async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        let mut request = self
            .client
            .get(&self.url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| StateError::backend(format!("Remote state request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StateError::backend(format!(
                "Remote state {} returned HTTP {}",
                self.url,
                status.as_u16()
            ))
            .into());
        }

        let published: PublishedOutputs = response.json().await.map_err(|e| {
            StateError::corrupted(format!("Failed to parse remote state {}: {e}", self.url))
        })?;

        debug!("Read {} outputs from {}", published.outputs.len(), self.url);
        Ok(published.outputs)
    }
}
