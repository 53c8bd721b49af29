//! Object storage: `put(bytes, key) -> url`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::version::GENSTREAM_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("storage returned {0}")]
    Status(u16),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return the public URL.
    async fn put(&self, bytes: Bytes, key: &str, content_type: &str)
    -> Result<String, StorageError>;

    /// Whether `url` is already served by this store.
    fn owns(&self, url: &str) -> bool;
}

/// S3-compatible gateway accepting `PUT {endpoint}/{key}`.
pub struct HttpObjectStore {
    endpoint: String,
    public_url: String,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: impl Into<String>,
        public_url: impl Into<String>,
        token: Option<&str>,
    ) -> Result<Self, StorageError> {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Some(token) = token
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(format!("genstream/{}", GENSTREAM_VERSION))
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        bytes: Bytes,
        key: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let response = self
            .client
            .put(format!("{}/{}", self.endpoint, key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StorageError::Status(response.status().as_u16()));
        }
        Ok(format!("{}/{}", self.public_url, key))
    }

    fn owns(&self, url: &str) -> bool {
        url.starts_with(&self.public_url)
    }
}

/// Keeps objects in memory. Used by tests and ephemeral deployments.
pub struct MemoryObjectStore {
    public_url: String,
    objects: DashMap<String, Bytes>,
}

impl MemoryObjectStore {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into().trim_end_matches('/').to_string(),
            objects: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|b| b.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        bytes: Bytes,
        key: &str,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        self.objects.insert(key.to_string(), bytes);
        Ok(format!("{}/{}", self.public_url, key))
    }

    fn owns(&self, url: &str) -> bool {
        url.starts_with(&self.public_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn http_put_returns_public_url() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/bucket/generations/job-1/0.png"))
            .and(header("content-type", "image/png"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(
            format!("{}/bucket", server.uri()),
            "https://assets.example.com/",
            Some("tok"),
        )
        .unwrap();

        let url = store
            .put(Bytes::from_static(b"png"), "generations/job-1/0.png", "image/png")
            .await
            .unwrap();
        assert_eq!(url, "https://assets.example.com/generations/job-1/0.png");
        assert!(store.owns(&url));
        assert!(!store.owns("https://cdn.provider/x.png"));
    }

    #[tokio::test]
    async fn http_put_surfaces_error_status() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(server.uri(), "https://assets.example.com", None).unwrap();
        let err = store
            .put(Bytes::from_static(b"png"), "k.png", "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Status(403)));
    }

    #[tokio::test]
    async fn memory_store_keeps_objects() {
        let store = MemoryObjectStore::new("https://assets.test");
        let url = store
            .put(Bytes::from_static(b"abc"), "a/b.png", "image/png")
            .await
            .unwrap();
        assert_eq!(url, "https://assets.test/a/b.png");
        assert_eq!(store.get("a/b.png").unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(store.len(), 1);
    }
}
