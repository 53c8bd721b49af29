//! Job, mapping and event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized event kind recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Completed,
    Failed,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "progress" => Some(Self::Progress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Internal job row, written when a generation is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub prompt: String,
    /// Number of sub-jobs for multi-part requests; `None` for single-part jobs.
    pub expected_count: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            expected_count: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_expected_count(mut self, count: usize) -> Self {
        self.expected_count = Some(count);
        self
    }

    pub fn is_multi_part(&self) -> bool {
        self.expected_count.is_some()
    }
}

/// Provider-issued id -> internal job id. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalIdMapping {
    pub external_job_id: String,
    pub internal_job_id: String,
    /// Sub-job type (e.g. "side") when the external job is one part of a multi-part job.
    pub variant: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExternalIdMapping {
    pub fn new(external_job_id: impl Into<String>, internal_job_id: impl Into<String>) -> Self {
        Self {
            external_job_id: external_job_id.into(),
            internal_job_id: internal_job_id.into(),
            variant: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }
}

/// Event waiting to be appended. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub internal_job_id: String,
    pub external_job_id: String,
    pub variant: Option<String>,
    pub kind: EventKind,
    pub progress: Option<u8>,
    pub preview_url: Option<String>,
    pub result_urls: Vec<String>,
    pub upscaled_urls: Vec<String>,
    pub error_message: Option<String>,
    pub dedupe_key: String,
    pub raw_payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(mapping: &ExternalIdMapping, kind: EventKind, dedupe_key: String) -> Self {
        Self {
            internal_job_id: mapping.internal_job_id.clone(),
            external_job_id: mapping.external_job_id.clone(),
            variant: mapping.variant.clone(),
            kind,
            progress: None,
            preview_url: None,
            result_urls: Vec::new(),
            upscaled_urls: Vec::new(),
            error_message: None,
            dedupe_key,
            raw_payload: serde_json::Value::Null,
        }
    }
}

/// A recorded event-log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub internal_job_id: String,
    pub external_job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub result_urls: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub upscaled_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip)]
    pub dedupe_key: String,
    #[serde(skip)]
    pub raw_payload: serde_json::Value,
    #[serde(skip)]
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn from_new(id: i64, new: NewEvent) -> Self {
        Self {
            id,
            internal_job_id: new.internal_job_id,
            external_job_id: new.external_job_id,
            variant: new.variant,
            kind: new.kind,
            progress: new.progress,
            preview_url: new.preview_url,
            result_urls: new.result_urls,
            upscaled_urls: new.upscaled_urls,
            error_message: new.error_message,
            dedupe_key: new.dedupe_key,
            raw_payload: new.raw_payload,
            processed: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Dedupe key for terminal events: one per `(job, variant, kind)`.
pub fn terminal_dedupe_key(internal_job_id: &str, variant: Option<&str>, kind: EventKind) -> String {
    format!("{}:{}:{}", internal_job_id, variant.unwrap_or(""), kind.as_str())
}

/// Generate a fresh internal job id.
pub fn generate_job_id() -> String {
    format!("job_{}", uuid::Uuid::new_v4().simple())
}
