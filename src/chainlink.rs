use std::time::Duration;

use ethers::types::H256;
use serde::Serialize;
use serde_json::json;
use url::Url;

use crate::config::ChainlinkConfig;
use crate::error::Error;

/// The error string reported to the Chainlink node when a fulfillment
/// fails. Internal error detail stays in the bridge logs.
pub const GENERIC_FULFILLMENT_ERROR: &str = "Error trying to fulfill request";

/// Terminal status of a job run, as the Chainlink runs API spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// The fulfillment transaction was mined successfully.
    Completed,
    /// The fulfillment failed terminally.
    Errored,
}

/// A terminal job run update sent back to the Chainlink node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunUpdate {
    /// The run being updated.
    pub id: String,
    /// Result payload; carries the transaction hash on completion.
    pub data: serde_json::Value,
    /// Terminal status of the run.
    pub status: RunStatus,
    /// Cleared pending marker, present on completion only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<bool>,
    /// Generic error marker, present on failure only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunUpdate {
    /// A successful update carrying the fulfillment transaction hash.
    pub fn completed(run_id: impl Into<String>, tx_hash: H256) -> Self {
        Self {
            id: run_id.into(),
            data: json!({ "result": tx_hash }),
            status: RunStatus::Completed,
            pending: Some(false),
            error: None,
        }
    }

    /// A failed update carrying only the generic error marker.
    pub fn errored(run_id: impl Into<String>) -> Self {
        Self {
            id: run_id.into(),
            data: json!({}),
            status: RunStatus::Errored,
            pending: None,
            error: Some(GENERIC_FULFILLMENT_ERROR.to_string()),
        }
    }
}

/// The job run operations the bridge needs from the Chainlink node.
#[async_trait::async_trait]
pub trait JobService: Send + Sync {
    /// Starts a run of the given job spec, returning the new run id.
    async fn initiate_job_run(
        &self,
        job_id: &str,
        access_key: &str,
        secret: &str,
        payload: &serde_json::Value,
    ) -> crate::Result<String>;

    /// Reports the terminal outcome of a run.
    async fn update_job_run(
        &self,
        token: &str,
        update: &RunUpdate,
    ) -> crate::Result<()>;
}

/// A thin client for the Chainlink node REST API.
#[derive(Debug, Clone)]
pub struct ChainlinkApi {
    client: reqwest::Client,
    base_url: Url,
}

impl ChainlinkApi {
    /// Builds a client for the configured node, with every request
    /// bounded by the configured timeout.
    pub fn new(config: &ChainlinkConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> crate::Result<Url> {
        Ok(self.base_url.join(path)?)
    }
}

#[async_trait::async_trait]
impl JobService for ChainlinkApi {
    #[tracing::instrument(skip(self, access_key, secret, payload))]
    async fn initiate_job_run(
        &self,
        job_id: &str,
        access_key: &str,
        secret: &str,
        payload: &serde_json::Value,
    ) -> crate::Result<String> {
        let url = self.endpoint(&format!("v2/specs/{}/runs", job_id))?;
        let response = self
            .client
            .post(url)
            .header("X-Chainlink-EA-AccessKey", access_key)
            .header("X-Chainlink-EA-Secret", secret)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::JobService(format!(
                "job run trigger for {} rejected with status {}",
                job_id, status,
            )));
        }
        let body: serde_json::Value = response.json().await?;
        if body.get("errors").map_or(false, |e| !e.is_null()) {
            return Err(Error::JobService(body["errors"].to_string()));
        }
        let run_id = body
            .pointer("/data/attributes/id")
            .or_else(|| body.pointer("/data/id"))
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                Error::JobService(
                    "job run response carries no run id".to_string(),
                )
            })?;
        Ok(run_id.to_string())
    }

    #[tracing::instrument(skip(self, token), fields(run_id = %update.id))]
    async fn update_job_run(
        &self,
        token: &str,
        update: &RunUpdate,
    ) -> crate::Result<()> {
        let url = self.endpoint(&format!("v2/runs/{}", update.id))?;
        let response = self
            .client
            .patch(url)
            .header("Authorization", token)
            .json(update)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::JobService(format!(
                "run update for {} rejected with status {}",
                update.id, status,
            )));
        }
        Ok(())
    }
}
