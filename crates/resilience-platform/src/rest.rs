//! REST presence client speaking a minimal PATCH-by-id row API.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use resilience_core::{ExitTransport, PresenceError, PresenceStatus, PresenceStore};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_TABLE: &str = "profiles";
/// Upper bound on one offline request sent during teardown.
pub const EXIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RestPresenceConfig {
    /// REST root, for example `https://db.example.org/rest/v1`.
    pub base_url: Url,
    /// Table or resource holding one presence row per subject.
    pub table: String,
    /// Bearer credential of the signed-in user.
    pub bearer_token: String,
    /// Optional project key sent as the `apikey` header.
    pub api_key: Option<String>,
}

impl RestPresenceConfig {
    pub fn new(base_url: Url, bearer_token: impl Into<String>) -> Self {
        Self {
            base_url,
            table: DEFAULT_TABLE.to_owned(),
            bearer_token: bearer_token.into(),
            api_key: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn row_url(&self, subject_id: &str) -> Result<Url, PresenceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                PresenceError::Store(format!("base url '{}' cannot hold a path", self.base_url))
            })?
            .pop_if_empty()
            .push(&self.table);
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{subject_id}"));
        Ok(url)
    }
}

#[derive(Debug, Serialize)]
struct PresencePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<PresenceStatus>,
    updated_at: String,
}

impl PresencePatch {
    fn now(status: Option<PresenceStatus>) -> Self {
        Self {
            status,
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Durable store accessor and exit transport backed by the same REST row.
#[derive(Clone)]
pub struct RestPresenceClient {
    http: Client,
    config: Arc<RestPresenceConfig>,
    runtime: Handle,
    exits: TaskTracker,
}

impl RestPresenceClient {
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime context.
    pub fn new(config: RestPresenceConfig) -> Self {
        Self::with_runtime(Client::new(), config, Handle::current())
    }

    pub fn with_runtime(http: Client, config: RestPresenceConfig, runtime: Handle) -> Self {
        Self {
            http,
            config: Arc::new(config),
            runtime,
            exits: TaskTracker::new(),
        }
    }

    /// Give detached offline requests up to `grace` to finish.
    ///
    /// Call before dropping the runtime, which would otherwise cancel them.
    /// Returns `false` when some request was still pending at the deadline.
    pub async fn flush_exit_signals(&self, grace: Duration) -> bool {
        self.exits.close();
        let flushed = tokio::time::timeout(grace, self.exits.wait())
            .await
            .is_ok();
        self.exits.reopen();
        if !flushed {
            warn!(pending = self.exits.len(), "offline signal still pending at exit");
        }
        flushed
    }

    async fn patch(
        &self,
        subject_id: &str,
        patch: &PresencePatch,
        timeout: Option<Duration>,
    ) -> Result<(), PresenceError> {
        let url = self.config.row_url(subject_id)?;
        let mut request = self
            .http
            .patch(url)
            .bearer_auth(&self.config.bearer_token)
            .header("Prefer", "return=minimal")
            .json(patch);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("apikey", api_key);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|err| PresenceError::Store(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PresenceError::Store(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for RestPresenceClient {
    async fn set_presence(
        &self,
        subject_id: &str,
        status: PresenceStatus,
    ) -> Result<(), PresenceError> {
        self.patch(subject_id, &PresencePatch::now(Some(status)), None)
            .await
    }

    async fn touch_presence(&self, subject_id: &str) -> Result<(), PresenceError> {
        self.patch(subject_id, &PresencePatch::now(None), None).await
    }
}

impl ExitTransport for RestPresenceClient {
    fn send_offline(&self, subject_id: &str) {
        let client = self.clone();
        let subject_id = subject_id.to_owned();
        // Detached: the caller is tearing down and must not wait for a response.
        self.exits.spawn_on(
            async move {
                let patch = PresencePatch::now(Some(PresenceStatus::Offline));
                if let Err(err) = client
                    .patch(&subject_id, &patch, Some(EXIT_REQUEST_TIMEOUT))
                    .await
                {
                    debug!(%subject_id, error = %err, "offline signal not delivered");
                }
            },
            &self.runtime,
        );
    }
}
