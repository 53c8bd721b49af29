//! GenerationService: transport-agnostic facade over the pipeline.
//!
//! Owns the collaborators (store, provider, object storage), the broadcaster
//! and the root cancellation token. Transports delegate to it for submission,
//! webhook ingestion, status queries and live streams.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::broadcast::{BroadcastConfig, Broadcaster, Frame};
use crate::ingest::{IngestConfig, IngestError, IngestOutcome, Ingestor};
use crate::job::{EventKind, ExternalIdMapping, JobRecord, NewEvent, generate_job_id, terminal_dedupe_key};
use crate::mapping::{IdMapper, MappingError};
use crate::poller::{PollConfig, Poller};
use crate::provider::{Provider, ProviderError};
use crate::storage::ObjectStore;
use crate::store::{JobStore, StoreError};
use crate::stream::{LiveChannel, StreamConfig, StreamManager};
use crate::terminal::{JobSummary, SubJob};
use crate::version::VersionInfo;
use crate::webhook::{self, WebhookError};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub ingest: IngestConfig,
    pub poll: PollConfig,
    pub stream: StreamConfig,
    pub broadcast: BroadcastConfig,
    /// Shared secret for `x-imagine-signature`. Unsigned webhooks are
    /// accepted when unset.
    pub webhook_secret: Option<String>,
    /// Start a server-side poll loop for every submission.
    pub poll_on_submit: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            poll: PollConfig::default(),
            stream: StreamConfig::default(),
            broadcast: BroadcastConfig::default(),
            webhook_secret: None,
            poll_on_submit: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Sub-job types for a multi-part request, e.g. `["side", "back"]`.
    #[serde(default)]
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub status: &'static str,
    pub external_ids: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("provider rejected submission for job {job_id}: {source}")]
    Provider {
        job_id: String,
        #[source]
        source: ProviderError,
    },
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookHandleError {
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookAck {
    Ingested(IngestOutcome),
    /// Event type without an image payload.
    Ignored,
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub version: VersionInfo,
    pub channels: usize,
    pub shutting_down: bool,
}

pub struct GenerationService {
    store: Arc<dyn JobStore>,
    mapper: IdMapper,
    provider: Arc<dyn Provider>,
    ingestor: Arc<Ingestor>,
    poller: Poller,
    streams: StreamManager,
    broadcaster: Arc<Broadcaster>,
    webhook_secret: Option<String>,
    poll_on_submit: bool,
    shutdown: CancellationToken,
    version: VersionInfo,
}

impl GenerationService {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn Provider>,
        objects: Arc<dyn ObjectStore>,
        config: ServiceConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let broadcaster = Broadcaster::new(config.broadcast);
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            objects,
            Arc::clone(&broadcaster),
            config.ingest,
        ));
        let poller = Poller::new(Arc::clone(&provider), Arc::clone(&ingestor), config.poll);
        let streams = StreamManager::new(
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            config.stream,
            shutdown.clone(),
        )
        .with_poller(poller.clone());

        Self {
            mapper: IdMapper::new(Arc::clone(&store)),
            store,
            provider,
            ingestor,
            poller,
            streams,
            broadcaster,
            webhook_secret: config.webhook_secret.filter(|s| !s.is_empty()),
            poll_on_submit: config.poll_on_submit,
            shutdown,
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn mapper(&self) -> &IdMapper {
        &self.mapper
    }

    /// Create the job row, submit every part to the provider and map each
    /// external id before returning.
    pub async fn submit(&self, request: GenerationRequest) -> Result<Submission, SubmitError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(SubmitError::Invalid("prompt is required".to_string()));
        }
        let mut unique = HashSet::new();
        if request
            .variants
            .iter()
            .any(|v| v.trim().is_empty() || !unique.insert(v.as_str()))
        {
            return Err(SubmitError::Invalid(
                "variants must be unique and non-empty".to_string(),
            ));
        }

        let job_id = generate_job_id();
        let mut job = JobRecord::new(&job_id, prompt);
        if !request.variants.is_empty() {
            job = job.with_expected_count(request.variants.len());
        }
        self.store.insert_job(&job).await?;
        for variant in &request.variants {
            self.store
                .record_sub_job(&job_id, SubJob::pending(variant.as_str()))
                .await?;
        }

        let parts: Vec<Option<&str>> = if request.variants.is_empty() {
            vec![None]
        } else {
            request.variants.iter().map(|v| Some(v.as_str())).collect()
        };

        let mut external_ids = Vec::with_capacity(parts.len());
        let mut last_error = None;
        for variant in parts {
            let reference = match variant {
                Some(v) => format!("{job_id}:{v}"),
                None => job_id.clone(),
            };
            match self.provider.submit(prompt, &reference).await {
                Ok(external_id) => {
                    self.mapper.create(&external_id, &job_id, variant).await?;
                    if self.poll_on_submit {
                        self.spawn_poll(external_id.clone());
                    }
                    external_ids.push(external_id);
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, variant = ?variant, error = %e, "Provider rejected submission");
                    self.record_submission_failure(&job_id, variant, &e).await?;
                    last_error = Some(e);
                }
            }
        }

        if external_ids.is_empty()
            && let Some(source) = last_error
        {
            return Err(SubmitError::Provider { job_id, source });
        }

        tracing::info!(job_id = %job_id, parts = external_ids.len(), "Generation submitted");
        Ok(Submission {
            id: job_id,
            status: "pending",
            external_ids,
        })
    }

    async fn record_submission_failure(
        &self,
        job_id: &str,
        variant: Option<&str>,
        error: &ProviderError,
    ) -> Result<(), StoreError> {
        let mut mapping = ExternalIdMapping::new("", job_id);
        if let Some(v) = variant {
            mapping = mapping.with_variant(v);
        }
        let mut new = NewEvent::new(
            &mapping,
            EventKind::Failed,
            terminal_dedupe_key(job_id, variant, EventKind::Failed),
        );
        new.error_message = Some(format!("Submission failed: {error}"));

        if let Some(event) = self.store.append_event(new).await? {
            self.broadcaster.publish(job_id, Frame::from_event(&event));
            if let Some(sub_job) = SubJob::from_event(&event) {
                self.store.record_sub_job(job_id, sub_job).await?;
            }
        }
        Ok(())
    }

    /// Hold a lease on the shared loop until it ends, so streams join it
    /// instead of starting their own.
    fn spawn_poll(&self, external_id: String) {
        let lease = self.poller.acquire(&external_id, &self.shutdown);
        tokio::spawn(async move {
            lease.finished().await;
        });
    }

    /// Verify, decode and ingest one webhook delivery.
    pub async fn handle_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookAck, WebhookHandleError> {
        if let Some(secret) = &self.webhook_secret {
            webhook::verify_signature(secret, body, signature)?;
        }

        let (envelope, raw) = webhook::parse(body)?;
        if !envelope.is_image_event() {
            tracing::debug!(event = %envelope.event, "Ignoring webhook event");
            return Ok(WebhookAck::Ignored);
        }

        let outcome = self.ingestor.ingest(&envelope.payload, raw).await?;
        Ok(WebhookAck::Ingested(outcome))
    }

    /// Latest known state of a job, or `None` if it does not exist.
    pub async fn status(&self, job_id: &str) -> Result<Option<JobSummary>, StoreError> {
        let Some(job) = self.store.job(job_id).await? else {
            return Ok(None);
        };
        let events = self.store.events_for_job(job_id, 0).await?;
        let expectation = self.store.expectation(job_id).await?;
        Ok(Some(JobSummary::build(&job, &events, expectation.as_ref())))
    }

    pub async fn open_stream(
        &self,
        key: &str,
        last_event_id: Option<i64>,
    ) -> Result<LiveChannel, StoreError> {
        self.streams.open(key, last_event_id).await
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            version: self.version.clone(),
            channels: self.broadcaster.channel_count(),
            shutting_down: self.shutdown.is_cancelled(),
        }
    }

    /// Sweep expired cached frames until shutdown.
    pub fn spawn_janitor(&self) -> tokio::task::JoinHandle<()> {
        self.broadcaster.spawn_janitor(self.shutdown.clone())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop poll loops, streams and background tasks.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(channels = self.broadcaster.channel_count(), "Shutting down generation service");
        }
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::provider::ProviderStatus;
    use crate::storage::MemoryObjectStore;
    use crate::store::MemoryStore;
    use crate::terminal::{JobPhase, SubJobStatus};
    use crate::testing::FakeProvider;

    fn service(provider: Arc<FakeProvider>, config: ServiceConfig) -> GenerationService {
        GenerationService::new(
            Arc::new(MemoryStore::new()),
            provider,
            Arc::new(MemoryObjectStore::new("https://assets.test")),
            ServiceConfig {
                poll_on_submit: false,
                ..config
            },
        )
    }

    fn request(prompt: &str, variants: &[&str]) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            variants: variants.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn submit_maps_external_id_before_returning() {
        let provider = Arc::new(FakeProvider::new());
        let service = service(provider.clone(), ServiceConfig::default());

        let submission = service.submit(request("a red coat", &[])).await.unwrap();
        assert_eq!(submission.status, "pending");
        assert_eq!(submission.external_ids, vec!["ext-1"]);

        let mapping = service.mapper().resolve("ext-1").await.unwrap().unwrap();
        assert_eq!(mapping.internal_job_id, submission.id);
        assert_eq!(provider.submissions(), vec![("a red coat".to_string(), submission.id.clone())]);

        let summary = service.status(&submission.id).await.unwrap().unwrap();
        assert_eq!(summary.status, JobPhase::Pending);
    }

    #[tokio::test]
    async fn submit_validates_request() {
        let service = service(Arc::new(FakeProvider::new()), ServiceConfig::default());
        assert!(matches!(
            service.submit(request("  ", &[])).await,
            Err(SubmitError::Invalid(_))
        ));
        assert!(matches!(
            service.submit(request("p", &["side", "side"])).await,
            Err(SubmitError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn multi_part_submission_maps_each_variant() {
        let provider = Arc::new(FakeProvider::new());
        let service = service(provider.clone(), ServiceConfig::default());

        let submission = service.submit(request("p", &["side", "back"])).await.unwrap();
        assert_eq!(submission.external_ids.len(), 2);

        let mappings = service.mapper().external_ids(&submission.id).await.unwrap();
        let variants: Vec<_> = mappings.iter().filter_map(|m| m.variant.clone()).collect();
        assert_eq!(variants.len(), 2);
        assert!(variants.contains(&"side".to_string()));

        let summary = service.status(&submission.id).await.unwrap().unwrap();
        let sub_jobs = summary.variants.unwrap();
        assert!(sub_jobs.iter().all(|s| s.status == SubJobStatus::Pending));
    }

    #[tokio::test]
    async fn rejected_submission_keeps_failed_job() {
        let provider = Arc::new(FakeProvider::new());
        provider.reject_submit.store(true, Ordering::SeqCst);
        let service = service(provider, ServiceConfig::default());

        let err = service.submit(request("p", &[])).await.unwrap_err();
        let SubmitError::Provider { job_id, .. } = err else {
            panic!("expected provider error");
        };
        let summary = service.status(&job_id).await.unwrap().unwrap();
        assert_eq!(summary.status, JobPhase::Failed);
        assert!(summary.error.unwrap().starts_with("Submission failed"));
    }

    #[tokio::test]
    async fn webhook_signature_is_enforced_when_configured() {
        let service = service(
            Arc::new(FakeProvider::new()),
            ServiceConfig {
                webhook_secret: Some("s3cret".to_string()),
                ..ServiceConfig::default()
            },
        );
        let body = br#"{"event":"images.items.update","payload":{"id":"ext-9","status":"pending"}}"#;

        assert!(matches!(
            service.handle_webhook(body, None).await,
            Err(WebhookHandleError::Webhook(WebhookError::BadSignature))
        ));
        let signature = webhook::sign("s3cret", body);
        assert_eq!(
            service.handle_webhook(body, Some(&signature)).await.unwrap(),
            WebhookAck::Ingested(IngestOutcome::Unroutable)
        );
    }

    #[tokio::test]
    async fn unrelated_webhook_events_are_ignored() {
        let service = service(Arc::new(FakeProvider::new()), ServiceConfig::default());
        let body = br#"{"event":"account.updated","payload":{"id":"acct-1"}}"#;
        assert_eq!(service.handle_webhook(body, None).await.unwrap(), WebhookAck::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_on_submit_completes_job_without_listeners() {
        let provider = Arc::new(FakeProvider::new());
        let service = GenerationService::new(
            Arc::new(MemoryStore::new()),
            provider.clone(),
            Arc::new(MemoryObjectStore::new("https://assets.test")),
            ServiceConfig::default(),
        );

        let submission = service.submit(request("p", &[])).await.unwrap();
        provider.set(crate::provider::ProviderImage {
            url: Some("https://cdn.provider/x.png".to_string()),
            ..crate::testing::image("ext-1", ProviderStatus::Completed)
        });

        // A stream opened meanwhile joins the submission's loop.
        let channel = service.open_stream(&submission.id, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(6)).await;
        drop(channel);
        assert_eq!(provider.status_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let summary = service.status(&submission.id).await.unwrap().unwrap();
        assert_eq!(summary.status, JobPhase::Completed);
        assert_eq!(
            summary.result_urls.unwrap(),
            vec![format!("https://assets.test/generations/{}/image.png", submission.id)]
        );
        service.shutdown();
    }

    #[test]
    fn health_reports_channels_and_shutdown() {
        let service = service(Arc::new(FakeProvider::new()), ServiceConfig::default());
        assert_eq!(service.health().channels, 0);
        assert!(!service.health().shutting_down);
        service.shutdown();
        service.shutdown();
        assert!(service.health().shutting_down);
    }
}
