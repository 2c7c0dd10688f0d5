use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde_json::{json, Value};

use super::models::{ApiError, ApiResult, AttachmentMeta, Observation, ObservationScope};
use crate::config::ApiSettings;

/// Remote inspection database as seen by a run.
#[async_trait]
pub trait InspectionApi: Send + Sync {
    /// Sample + design + test case context for a scanned identifier
    async fn sample_context(&self, identifier: &str) -> ApiResult<Value>;

    /// Create the record that every capture of one run attaches to
    async fn create_observation(
        &self,
        test_case_id: u64,
        cut_number: Option<u32>,
    ) -> ApiResult<Observation>;

    /// Upload one image, tagged with its 1-based tooth number
    async fn upload_attachment(
        &self,
        observation_id: u64,
        path: &Path,
        tag: u32,
    ) -> ApiResult<AttachmentMeta>;
}

pub struct HttpInspectionApi {
    client: Client,
    base_url: String,
}

impl HttpInspectionApi {
    pub fn new(settings: &ApiSettings) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

async fn check_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!("Inspection API request failed with status: {}", status);
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl InspectionApi for HttpInspectionApi {
    async fn sample_context(&self, identifier: &str) -> ApiResult<Value> {
        let url = self.url(&format!("samples/identifier/{}/context", identifier));
        debug!("Fetching sample context from: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn create_observation(
        &self,
        test_case_id: u64,
        cut_number: Option<u32>,
    ) -> ApiResult<Observation> {
        let scope = ObservationScope::for_cut(cut_number);
        let url = self.url(&format!("test-cases/{}/observations", test_case_id));
        let mut body = json!({ "scope": scope.as_str() });
        if scope == ObservationScope::Cut {
            body["cut_number"] = json!(cut_number);
        }

        info!(
            "Creating observation for test case {} (scope: {})",
            test_case_id,
            scope.as_str()
        );
        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        let created: Value = check_status(response).await?.json().await?;

        let id = created["id"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("No 'id' in observation response: {}", created))?;

        Ok(Observation {
            id,
            test_case_id,
            scope,
            cut_number,
        })
    }

    async fn upload_attachment(
        &self,
        observation_id: u64,
        path: &Path,
        tag: u32,
    ) -> ApiResult<AttachmentMeta> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("tooth_{:04}.png", tag));
        let bytes = tokio::fs::read(path).await?;

        let part = Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str("image/png")?;
        let form = Form::new().part("file", part).text("tag", tag.to_string());

        let url = self.url(&format!("observations/{}/attachments", observation_id));
        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .multipart(form)
            .send()
            .await?;
        let created: Value = check_status(response).await?.json().await?;

        Ok(AttachmentMeta {
            id: created["id"].as_u64(),
            observation_id,
            tag,
            file_name,
        })
    }
}
