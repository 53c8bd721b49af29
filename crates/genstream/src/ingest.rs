//! Normalize-and-append: the single path both the webhook handler and the
//! poller feed provider reports through.
//!
//! resolve mapping -> classify -> dedupe -> resolve artifact -> append ->
//! update sub-job expectation -> detect terminal -> publish.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::{Broadcaster, Frame};
use crate::job::{Event, EventKind, ExternalIdMapping, NewEvent, terminal_dedupe_key};
use crate::mapping::{IdMapper, MappingError};
use crate::provider::{Provider, ProviderError, ProviderImage, ProviderStatus};
use crate::storage::{ObjectStore, StorageError};
use crate::store::{JobStore, StoreError};
use crate::terminal::{self, SubJob, TerminalState};

/// Which progress reports make it into the event log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgressPolicy {
    /// Only the first progress report per job (and variant) is recorded.
    FirstOnly,
    /// A report is recorded only if its value exceeds the latest recorded one.
    #[default]
    Monotonic,
}

impl FromStr for ProgressPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first-only" | "first_only" | "first" => Ok(Self::FirstOnly),
            "monotonic" => Ok(Self::Monotonic),
            other => Err(format!("unknown progress policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub progress_policy: ProgressPolicy,
    /// Attempts to copy a provider-hosted artifact before giving up.
    pub artifact_attempts: u32,
    pub artifact_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            progress_policy: ProgressPolicy::default(),
            artifact_attempts: 3,
            artifact_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("download failed: {0}")]
    Download(#[from] ProviderError),
    #[error("upload failed: {0}")]
    Upload(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// No mapping for the external id. Acknowledged and dropped.
    Unroutable,
    /// Already recorded, or superseded by a recorded terminal event.
    Duplicate,
    Recorded {
        event: Event,
        /// Set when this event moved the job into a terminal state.
        terminal: Option<TerminalState>,
    },
}

impl IngestOutcome {
    /// Whether the reported external job has nothing more to say.
    pub fn is_settled(&self) -> bool {
        match self {
            Self::Recorded { event, .. } => event.is_terminal(),
            _ => false,
        }
    }
}

/// Copies provider-hosted artifacts into the system's own object store.
pub struct ArtifactMirror {
    provider: Arc<dyn Provider>,
    objects: Arc<dyn ObjectStore>,
    attempts: u32,
    backoff_base: Duration,
}

impl ArtifactMirror {
    pub fn new(
        provider: Arc<dyn Provider>,
        objects: Arc<dyn ObjectStore>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            provider,
            objects,
            attempts: config.artifact_attempts.max(1),
            backoff_base: config.artifact_backoff,
        }
    }

    /// Return a URL in our own store for `url`, copying it if needed.
    pub async fn mirror(&self, url: &str, key_prefix: &str) -> Result<String, ArtifactError> {
        if self.objects.owns(url) {
            return Ok(url.to_string());
        }

        let (key, content_type) = object_key(url, key_prefix);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.copy(url, &key, &content_type).await {
                Ok(stored) => {
                    tracing::debug!(source = %url, stored = %stored, "Artifact mirrored");
                    return Ok(stored);
                }
                Err(e) if attempt < self.attempts => {
                    let backoff = self.backoff_base * (1 << (attempt - 1).min(10));
                    tracing::warn!(
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Artifact copy failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, attempts = attempt, source = %url, "Artifact copy failed after max attempts");
                    return Err(e);
                }
            }
        }
    }

    async fn copy(&self, url: &str, key: &str, content_type: &str) -> Result<String, ArtifactError> {
        let bytes = self.provider.download(url).await?;
        Ok(self.objects.put(bytes, key, content_type).await?)
    }
}

/// Object key and content type for an artifact URL.
fn object_key(url: &str, key_prefix: &str) -> (String, String) {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or("");
    let mime = mime_guess::from_path(file).first_or_octet_stream();
    let ext = std::path::Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png");
    (format!("{key_prefix}.{ext}"), mime.essence_str().to_string())
}

pub struct Ingestor {
    mapper: IdMapper,
    store: Arc<dyn JobStore>,
    mirror: ArtifactMirror,
    broadcaster: Arc<Broadcaster>,
    progress_policy: ProgressPolicy,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn Provider>,
        objects: Arc<dyn ObjectStore>,
        broadcaster: Arc<Broadcaster>,
        config: IngestConfig,
    ) -> Self {
        Self {
            mapper: IdMapper::new(Arc::clone(&store)),
            mirror: ArtifactMirror::new(provider, objects, &config),
            store,
            broadcaster,
            progress_policy: config.progress_policy,
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Ingest one provider report. `raw` is stored verbatim with the event.
    pub async fn ingest(
        &self,
        image: &ProviderImage,
        raw: serde_json::Value,
    ) -> Result<IngestOutcome, IngestError> {
        let Some(mapping) = self.mapper.resolve(&image.id).await? else {
            tracing::warn!(external_id = %image.id, "Unroutable provider event, dropping");
            return Ok(IngestOutcome::Unroutable);
        };
        let job_id = mapping.internal_job_id.as_str();
        let variant = mapping.variant.as_deref();

        let recorded: Vec<Event> = self
            .store
            .events_for_job(job_id, 0)
            .await?
            .into_iter()
            .filter(|e| e.variant.as_deref() == variant)
            .collect();

        if recorded.iter().any(Event::is_terminal) {
            tracing::debug!(job_id = %job_id, external_id = %image.id, "Job already terminal, ignoring report");
            return Ok(IngestOutcome::Duplicate);
        }

        let Some(mut new) = self.normalize(&mapping, image, &recorded).await else {
            tracing::debug!(job_id = %job_id, external_id = %image.id, "Progress report suppressed");
            return Ok(IngestOutcome::Duplicate);
        };
        new.raw_payload = raw;

        let Some(event) = self.store.append_event(new).await? else {
            tracing::debug!(job_id = %job_id, external_id = %image.id, "Duplicate event, ignoring");
            return Ok(IngestOutcome::Duplicate);
        };

        tracing::info!(
            job_id = %job_id,
            external_id = %image.id,
            event_id = event.id,
            kind = event.kind.as_str(),
            progress = ?event.progress,
            "Event recorded"
        );

        self.broadcaster.publish(job_id, Frame::from_event(&event));

        let terminal = self.settle(&event).await?;
        Ok(IngestOutcome::Recorded { event, terminal })
    }

    /// Build the event row for a report, or `None` if the progress policy
    /// suppresses it.
    async fn normalize(
        &self,
        mapping: &ExternalIdMapping,
        image: &ProviderImage,
        recorded: &[Event],
    ) -> Option<NewEvent> {
        let job_id = mapping.internal_job_id.as_str();
        let variant = mapping.variant.as_deref();

        match classify(image.status) {
            EventKind::Progress => {
                // Unrecognized statuses count as activity only.
                let known = image.status != ProviderStatus::Unknown;
                let progress = image.progress_percent().filter(|_| known);
                let key = self.progress_key(job_id, variant, progress, recorded)?;
                let mut new = NewEvent::new(mapping, EventKind::Progress, key);
                new.progress = progress;
                new.preview_url = image.url.clone().filter(|_| known);
                Some(new)
            }
            EventKind::Completed => Some(self.completed(mapping, image).await),
            EventKind::Failed => {
                let error = image
                    .error
                    .clone()
                    .unwrap_or_else(|| "Generation failed".to_string());
                Some(failed_event(mapping, error))
            }
        }
    }

    fn progress_key(
        &self,
        job_id: &str,
        variant: Option<&str>,
        progress: Option<u8>,
        recorded: &[Event],
    ) -> Option<String> {
        let base = format!("{}:{}:progress", job_id, variant.unwrap_or(""));
        let mut reported = recorded.iter().filter(|e| e.kind == EventKind::Progress);

        match self.progress_policy {
            ProgressPolicy::FirstOnly => reported.next().is_none().then_some(base),
            ProgressPolicy::Monotonic => match progress {
                Some(value) => {
                    let latest = reported.filter_map(|e| e.progress).max();
                    latest
                        .is_none_or(|latest| value > latest)
                        .then(|| format!("{base}:{value}"))
                }
                // Status-only report: record once so the job shows activity.
                None => reported.next().is_none().then(|| format!("{base}:-")),
            },
        }
    }

    async fn completed(&self, mapping: &ExternalIdMapping, image: &ProviderImage) -> NewEvent {
        let upscaled: Vec<String> = image
            .upscaled_urls
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|u| !u.is_empty())
            .collect();
        let artifact = upscaled
            .first()
            .cloned()
            .or_else(|| image.url.clone().filter(|u| !u.is_empty()));

        let Some(artifact) = artifact else {
            tracing::warn!(external_id = %image.id, "Completed report carries no artifact");
            return failed_event(mapping, "Generation completed without an artifact".to_string());
        };

        let key_prefix = format!(
            "generations/{}/{}",
            mapping.internal_job_id,
            mapping.variant.as_deref().unwrap_or("image")
        );
        match self.mirror.mirror(&artifact, &key_prefix).await {
            Ok(url) => {
                let key = terminal_dedupe_key(
                    &mapping.internal_job_id,
                    mapping.variant.as_deref(),
                    EventKind::Completed,
                );
                let mut new = NewEvent::new(mapping, EventKind::Completed, key);
                new.progress = Some(100);
                new.preview_url = image.url.clone();
                new.result_urls = vec![url];
                new.upscaled_urls = upscaled;
                new
            }
            Err(e) => failed_event(mapping, format!("Artifact could not be stored: {e}")),
        }
    }

    /// Update the sub-job expectation for a terminal event and publish the
    /// aggregate frame once the job resolves.
    async fn settle(&self, event: &Event) -> Result<Option<TerminalState>, IngestError> {
        if !event.is_terminal() {
            return Ok(None);
        }
        let job_id = event.internal_job_id.as_str();

        let Some(sub_job) = SubJob::from_event(event) else {
            return Ok(terminal::detect(std::slice::from_ref(event), None));
        };

        let Some(expectation) = self.store.record_sub_job(job_id, sub_job).await? else {
            // Variant label on a single-part job: the event itself decides.
            return Ok(terminal::detect(std::slice::from_ref(event), None));
        };

        let state = terminal::detect(&[], Some(&expectation));
        if let Some(ref state) = state {
            tracing::info!(
                job_id = %job_id,
                completed = state.is_completed(),
                sub_jobs = expectation.sub_jobs.len(),
                "Multi-part job resolved"
            );
            self.broadcaster
                .publish(job_id, Frame::resolved(job_id, state, &expectation));
        }
        Ok(state)
    }
}

fn failed_event(mapping: &ExternalIdMapping, error: String) -> NewEvent {
    let key = terminal_dedupe_key(
        &mapping.internal_job_id,
        mapping.variant.as_deref(),
        EventKind::Failed,
    );
    let mut new = NewEvent::new(mapping, EventKind::Failed, key);
    new.error_message = Some(error);
    new
}

/// Map provider status vocabulary onto event kinds. Unknown is progress.
pub fn classify(status: ProviderStatus) -> EventKind {
    match status {
        ProviderStatus::Completed => EventKind::Completed,
        ProviderStatus::Failed => EventKind::Failed,
        ProviderStatus::Pending | ProviderStatus::InProgress | ProviderStatus::Unknown => {
            EventKind::Progress
        }
    }
}
