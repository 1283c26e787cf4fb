//! Read-only RabbitMQ management API accessor.
//!
//! Lists broker-side queues so provisioning can be verified from outside the
//! AMQP connection, and lists exchange bindings, which AMQP itself cannot
//! enumerate. Group membership reads go through the latter.

use std::collections::BTreeSet;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::LayerConfig;
use crate::error::{LayerError, Result};
use crate::transport::ConnectionParams;

/// Port the management plugin listens on by default.
pub const DEFAULT_MANAGEMENT_PORT: u16 = 15672;

#[derive(Debug, Deserialize)]
struct QueueInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BindingInfo {
    destination: String,
    destination_type: String,
}

/// Client for the `/api/queues` and `/api/exchanges` endpoints.
pub struct ManagementClient {
    client: Client,
    base: Url,
    vhost: String,
    username: String,
    password: String,
}

impl ManagementClient {
    pub fn new(
        base: &str,
        vhost: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let base = Url::parse(base).map_err(|e| {
            LayerError::Configuration(format!("Invalid management URL '{}': {}", base, e))
        })?;
        if base.cannot_be_a_base() {
            return Err(LayerError::Configuration(format!(
                "Management URL '{}' cannot be a base",
                base
            )));
        }

        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;

        Ok(Self {
            client,
            base,
            vhost: vhost.into(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// Client for the broker `config.url` points at, reusing its credentials.
    ///
    /// Uses `config.management_url` when set, otherwise
    /// `http://<amqp host>:15672`.
    pub fn from_config(config: &LayerConfig) -> Result<Self> {
        let params = ConnectionParams::parse(&config.url)?;
        Self::for_broker(config, &params)
    }

    pub(crate) fn for_broker(config: &LayerConfig, params: &ConnectionParams) -> Result<Self> {
        let base = config.management_url.clone().unwrap_or_else(|| {
            format!("http://{}:{}", params.host(), DEFAULT_MANAGEMENT_PORT)
        });
        Self::new(&base, params.vhost(), params.username(), params.password())
    }

    /// Virtual host of the AMQP connection this client was built for.
    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| LayerError::Configuration(format!("Bad management URL '{}'", self.base)))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    fn queues_url(&self, vhost: &str) -> Result<Url> {
        let mut url = self.api_url(&["queues", vhost])?;
        url.query_pairs_mut().append_pair("columns", "name");
        Ok(url)
    }

    fn bindings_url(&self, exchange: &str) -> Result<Url> {
        self.api_url(&["exchanges", self.vhost.as_str(), exchange, "bindings", "source"])
    }

    /// GET `url`; `None` on 404.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        let response = self
            .client
            .get(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(LayerError::Management(format!(
                "GET {} returned {}",
                url.path(),
                status
            )));
        }
        Ok(Some(response.json().await?))
    }

    /// Names of every queue in `vhost`.
    pub async fn queue_names(&self, vhost: &str) -> Result<BTreeSet<String>> {
        let url = self.queues_url(vhost)?;
        let queues: Vec<QueueInfo> = self.get_json(url.clone()).await?.ok_or_else(|| {
            LayerError::Management(format!("GET {} returned 404 Not Found", url.path()))
        })?;
        debug!(vhost = %vhost, count = queues.len(), "Listed broker queues");
        Ok(queues.into_iter().map(|queue| queue.name).collect())
    }

    /// Queue names in `vhost` starting with `prefix`.
    pub async fn queue_names_with_prefix(
        &self,
        vhost: &str,
        prefix: &str,
    ) -> Result<BTreeSet<String>> {
        Ok(self
            .queue_names(vhost)
            .await?
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    /// Queues bound to `exchange` in this client's vhost. Empty when the
    /// exchange does not exist.
    pub async fn exchange_bindings(&self, exchange: &str) -> Result<BTreeSet<String>> {
        let bindings: Vec<BindingInfo> = self
            .get_json(self.bindings_url(exchange)?)
            .await?
            .unwrap_or_default();
        Ok(queue_destinations(bindings))
    }
}

fn queue_destinations(bindings: Vec<BindingInfo>) -> BTreeSet<String> {
    bindings
        .into_iter()
        .filter(|binding| binding.destination_type == "queue")
        .map(|binding| binding.destination)
        .collect()
}

impl std::fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementClient")
            .field("base", &self.base.as_str())
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .finish()
    }
}
