// Control-plane HTTP client: desired peer set in, health and bandwidth telemetry out.

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::models::{BandwidthUsageReport, HealthSnapshot, PeerList};
use async_trait::async_trait;
use std::time::Duration;
use tracing::instrument;

const ACTIVE_PUBKEYS_PATH: &str = "/wg/active-pubkeys/v2/";
const SERVER_DATA_PATH: &str = "/update-server-data/";
const BANDWIDTH_USAGES_PATH: &str = "/update-peers-bandwidth-usages/";

/// Operations the reconciliation engine needs from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch the complete desired peer set.
    async fn get_wireguard_peers(&self) -> Result<PeerList, ApiError>;

    /// Push one node-health report.
    async fn update_server_data(&self, snapshot: &HealthSnapshot) -> Result<(), ApiError>;

    /// Push a batch of per-peer usage samples.
    async fn update_peers_bandwidth_usages(
        &self,
        report: &BandwidthUsageReport,
    ) -> Result<(), ApiError>;
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    admin_base_url: String,
    credentials: Option<(String, String)>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(crate::version::user_agent())
            .build()?;
        let credentials = (!config.username.is_empty() && !config.password.is_empty())
            .then(|| (config.username.clone(), config.password.clone()));
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            admin_base_url: config.admin_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => req.basic_auth(user, Some(pass)),
            None => req,
        }
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        endpoint: &'static str,
        body: &T,
    ) -> Result<(), ApiError> {
        let url = format!("{}{}", self.admin_base_url, endpoint);
        let response = self
            .authorize(self.client.post(url))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status { endpoint, status });
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    #[instrument(skip(self), fields(operation = "get_wireguard_peers"))]
    async fn get_wireguard_peers(&self) -> Result<PeerList, ApiError> {
        let url = format!("{}{}", self.base_url, ACTIVE_PUBKEYS_PATH);
        let response = self.authorize(self.client.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                endpoint: ACTIVE_PUBKEYS_PATH,
                status,
            });
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    #[instrument(skip(self, snapshot), fields(operation = "update_server_data"))]
    async fn update_server_data(&self, snapshot: &HealthSnapshot) -> Result<(), ApiError> {
        self.post_json(SERVER_DATA_PATH, &snapshot.to_wire()).await
    }

    #[instrument(skip(self, report), fields(operation = "update_peers_bandwidth_usages", peers = report.peers.len()))]
    async fn update_peers_bandwidth_usages(
        &self,
        report: &BandwidthUsageReport,
    ) -> Result<(), ApiError> {
        self.post_json(BANDWIDTH_USAGES_PATH, report).await
    }
}
