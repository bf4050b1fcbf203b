//! Remote data service client used to replay queued changes.

use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::entity::{EntityPatch, EntityType};
use crate::config::Config;
use crate::error::RemoteError;

/// Accepts a partial update for one record and reports success or failure.
pub trait RemoteBackend: Send + Sync {
  fn update(
    &self,
    entity_type: EntityType,
    entity_id: &str,
    patch: &EntityPatch,
  ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// PostgREST-style HTTP backend: `PATCH {base}/rest/v1/{table}?id=eq.{id}`.
#[derive(Clone)]
pub struct HttpBackend {
  client: reqwest::Client,
  base_url: Url,
  api_key: String,
}

impl HttpBackend {
  pub fn new(base_url: &str, api_key: String, timeout: Duration) -> color_eyre::Result<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| color_eyre::eyre::eyre!("Invalid remote URL {}: {}", base_url, e))?;
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      api_key,
    })
  }

  /// Build from config, taking the API key from the environment.
  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    let url = config
      .remote
      .url
      .as_deref()
      .ok_or_else(|| color_eyre::eyre::eyre!("No remote.url configured"))?;
    Self::new(url, Config::get_api_key()?, config.remote.dispatch_timeout())
  }

  /// Endpoint for one record of `entity_type`.
  pub fn endpoint(&self, entity_type: EntityType, entity_id: &str) -> Result<Url, RemoteError> {
    let mut url = self
      .base_url
      .join(&format!("rest/v1/{}", entity_type.table()))?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", entity_id));
    Ok(url)
  }
}

impl RemoteBackend for HttpBackend {
  async fn update(
    &self,
    entity_type: EntityType,
    entity_id: &str,
    patch: &EntityPatch,
  ) -> Result<(), RemoteError> {
    let url = self.endpoint(entity_type, entity_id)?;
    let body = patch.fields()?;

    debug!(%entity_type, entity_id, "Dispatching queued change");
    let response = self
      .client
      .patch(url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key)
      .header("Prefer", "return=minimal")
      .json(&body)
      .send()
      .await?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status, &body))
  }
}
