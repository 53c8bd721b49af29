//! In-process provider double shared by unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::provider::{Provider, ProviderError, ProviderImage, ProviderStatus};

#[derive(Default)]
pub(crate) struct FakeProvider {
    pub statuses: DashMap<String, ProviderImage>,
    pub status_calls: AtomicUsize,
    pub status_unavailable: AtomicBool,
    pub reject_submit: AtomicBool,
    /// Downloads fail this many times before succeeding.
    pub download_failures: AtomicUsize,
    pub downloads: AtomicUsize,
    pub submitted: Mutex<Vec<(String, String)>>,
    next_id: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, image: ProviderImage) {
        self.statuses.insert(image.id.clone(), image);
    }

    pub fn submissions(&self) -> Vec<(String, String)> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub(crate) fn image(id: &str, status: ProviderStatus) -> ProviderImage {
    ProviderImage {
        id: id.to_string(),
        status,
        ..Default::default()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn submit(&self, prompt: &str, reference: &str) -> Result<String, ProviderError> {
        if self.reject_submit.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 422,
                body: "prompt rejected".to_string(),
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("ext-{n}");
        self.submitted
            .lock()
            .unwrap()
            .push((prompt.to_string(), reference.to_string()));
        self.set(image(&id, ProviderStatus::Pending));
        Ok(id)
    }

    async fn status(&self, external_job_id: &str) -> Result<ProviderImage, ProviderError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.status_unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.statuses
            .get(external_job_id)
            .map(|i| i.clone())
            .ok_or_else(|| ProviderError::Status {
                status: 404,
                body: "not found".to_string(),
            })
    }

    async fn download(&self, url: &str) -> Result<Bytes, ProviderError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let remaining = self.download_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.download_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Status {
                status: 502,
                body: "cdn error".to_string(),
            });
        }
        Ok(Bytes::from(format!("image-bytes:{url}")))
    }
}
