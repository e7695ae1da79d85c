use crate::config::MlmmjAdminConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Remote answer to "is `identity` subscribed to `list`".
#[async_trait]
pub trait ListMembership: Send + Sync {
    /// Transport and protocol failures answer `false`.
    async fn has_subscriber(&self, list: &str, identity: &str) -> bool;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(rename = "_success", default)]
    success: bool,
}

/// Client for the mlmmjadmin REST API.
pub struct MlmmjAdminClient {
    client: Client,
    endpoint: Url,
    token_header: String,
    token: String,
}

impl MlmmjAdminClient {
    pub fn new(
        endpoint: &str,
        token: &str,
        token_header: &str,
        timeout: Duration,
        verify_tls: bool,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid mlmmjadmin endpoint: {endpoint}"))?;
        if endpoint.cannot_be_a_base() {
            return Err(anyhow!("invalid mlmmjadmin endpoint: {endpoint}"));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mta-policyd/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            token_header: token_header.to_string(),
            token: token.to_string(),
        })
    }

    /// Client for the configured endpoint, `None` when no endpoint or token
    /// is configured.
    pub fn from_config(config: &MlmmjAdminConfig) -> Result<Option<Self>> {
        match (&config.api_endpoint, &config.api_auth_token) {
            (Some(endpoint), Some(token)) if !endpoint.is_empty() && !token.is_empty() => {
                Ok(Some(Self::new(
                    endpoint,
                    token,
                    &config.auth_token_header,
                    Duration::from_secs(config.timeout_seconds),
                    config.verify_tls,
                )?))
            }
            _ => Ok(None),
        }
    }

    /// `{endpoint}/{list}/has_subscriber/{identity}`, each segment encoded.
    fn subscriber_url(&self, list: &str, identity: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("mlmmjadmin endpoint cannot be a base"))?
            .pop_if_empty()
            .extend([list, "has_subscriber", identity]);
        Ok(url)
    }

    async fn query(&self, list: &str, identity: &str) -> Result<bool> {
        let url = self.subscriber_url(list, identity)?;
        log::debug!("mlmmjadmin api endpoint: {url}");

        let response = self
            .client
            .get(url)
            .header(self.token_header.as_str(), self.token.as_str())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("mlmmjadmin api returned {status}"));
        }

        let body = response.text().await?;
        let parsed: ApiResponse = serde_json::from_str(&body)
            .with_context(|| format!("malformed mlmmjadmin api response: {body}"))?;
        Ok(parsed.success)
    }
}

#[async_trait]
impl ListMembership for MlmmjAdminClient {
    async fn has_subscriber(&self, list: &str, identity: &str) -> bool {
        match self.query(list, identity).await {
            Ok(true) => {
                log::debug!("{identity} is a member of mailing list {list}");
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::error!("Error while querying mlmmjadmin api: {e:#}");
                false
            }
        }
    }
}
