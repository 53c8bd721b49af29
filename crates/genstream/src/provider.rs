//! Image generation provider: wire types and HTTP client.
//!
//! The provider reports the same image object through webhooks and through
//! `GET /items/images/{id}`; both are decoded into [`ProviderImage`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::version::GENSTREAM_VERSION;

/// Provider status vocabulary. Anything unrecognised decodes to `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderImage {
    pub id: String,
    #[serde(default)]
    pub status: ProviderStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub upscaled_urls: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl ProviderImage {
    /// Progress clamped to 0..=100.
    pub fn progress_percent(&self) -> Option<u8> {
        self.progress
            .filter(|p| p.is_finite())
            .map(|p| p.round().clamp(0.0, 100.0) as u8)
    }
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct SubmittedImage {
    id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid provider response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Start a generation. Returns the provider's job id.
    async fn submit(&self, prompt: &str, reference: &str) -> Result<String, ProviderError>;

    async fn status(&self, external_job_id: &str) -> Result<ProviderImage, ProviderError>;

    /// Fetch a provider-hosted artifact.
    async fn download(&self, url: &str) -> Result<Bytes, ProviderError>;
}

/// ImagineAPI-compatible HTTP client.
pub struct ImagineClient {
    base_url: String,
    api: reqwest::Client,
    cdn: reqwest::Client,
}

impl ImagineClient {
    pub fn new(base_url: impl Into<String>, token: &str) -> Result<Self, ProviderError> {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token)) {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let user_agent = format!("genstream/{}", GENSTREAM_VERSION);

        let api = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(user_agent.clone())
            .timeout(Duration::from_secs(30))
            .build()?;

        // Artifact downloads go to the provider CDN and never carry the API token.
        let cdn = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api,
            cdn,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Provider for ImagineClient {
    async fn submit(&self, prompt: &str, reference: &str) -> Result<String, ProviderError> {
        let response = self
            .api
            .post(format!("{}/items/images", self.base_url))
            .json(&serde_json::json!({ "prompt": prompt, "ref": reference }))
            .send()
            .await?;

        let envelope: DataEnvelope<SubmittedImage> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        tracing::debug!(external_id = %envelope.data.id, "Generation submitted to provider");
        Ok(envelope.data.id)
    }

    async fn status(&self, external_job_id: &str) -> Result<ProviderImage, ProviderError> {
        let response = self
            .api
            .get(format!("{}/items/images/{}", self.base_url, external_job_id))
            .send()
            .await?;

        let envelope: DataEnvelope<ProviderImage> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }

    async fn download(&self, url: &str) -> Result<Bytes, ProviderError> {
        let response = self.cdn.get(url).send().await?;
        Ok(Self::check(response).await?.bytes().await?)
    }
}
