//! Terminal-state detection.
//!
//! A single-part job is terminal once the event log holds a `completed` or
//! `failed` event. A multi-part job is terminal only when every expected
//! sub-job has reported in and none is still pending: comparing the observed
//! count to the expected count keeps a partial set of finished sub-jobs from
//! being read as "all done".

use serde::{Deserialize, Serialize};

use crate::job::{Event, EventKind, JobRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubJobStatus {
    Pending,
    Completed,
    Failed,
}

impl SubJobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One independently resolving part of a multi-part job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubJob {
    #[serde(rename = "type")]
    pub sub_job_type: String,
    pub status: SubJobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubJob {
    pub fn pending(sub_job_type: impl Into<String>) -> Self {
        Self {
            sub_job_type: sub_job_type.into(),
            status: SubJobStatus::Pending,
            url: None,
            error: None,
        }
    }

    pub fn completed(sub_job_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            sub_job_type: sub_job_type.into(),
            status: SubJobStatus::Completed,
            url: Some(url.into()),
            error: None,
        }
    }

    pub fn failed(sub_job_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            sub_job_type: sub_job_type.into(),
            status: SubJobStatus::Failed,
            url: None,
            error: Some(error.into()),
        }
    }

    /// Build the sub-job entry a terminal event resolves, if the event belongs to one.
    pub fn from_event(event: &Event) -> Option<Self> {
        let variant = event.variant.as_deref()?;
        match event.kind {
            EventKind::Completed => Some(Self::completed(
                variant,
                event.result_urls.first().cloned().unwrap_or_default(),
            )),
            EventKind::Failed => Some(Self::failed(
                variant,
                event
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Generation failed".to_string()),
            )),
            EventKind::Progress => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubJobExpectation {
    pub internal_job_id: String,
    pub expected_count: usize,
    pub sub_jobs: Vec<SubJob>,
}

impl SubJobExpectation {
    pub fn new(internal_job_id: impl Into<String>, expected_count: usize) -> Self {
        Self {
            internal_job_id: internal_job_id.into(),
            expected_count,
            sub_jobs: Vec::new(),
        }
    }

    /// Insert or update the entry for `sub.sub_job_type`.
    ///
    /// A resolved entry is never moved back to pending or flipped to the
    /// other terminal status. Returns whether anything changed.
    pub fn record(&mut self, sub: SubJob) -> bool {
        match self
            .sub_jobs
            .iter_mut()
            .find(|s| s.sub_job_type == sub.sub_job_type)
        {
            Some(existing) if existing.status.is_terminal() => false,
            Some(existing) => {
                let changed = *existing != sub;
                *existing = sub;
                changed
            }
            None => {
                self.sub_jobs.push(sub);
                true
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sub_jobs.len() >= self.expected_count
            && self.sub_jobs.iter().all(|s| s.status.is_terminal())
    }

    pub fn completed(&self) -> impl Iterator<Item = &SubJob> {
        self.sub_jobs
            .iter()
            .filter(|s| s.status == SubJobStatus::Completed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &SubJob> {
        self.sub_jobs
            .iter()
            .filter(|s| s.status == SubJobStatus::Failed)
    }
}

/// Final payload of a job that has reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalState {
    Completed { result_urls: Vec<String> },
    Failed { error: String },
}

impl TerminalState {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Decide whether a job is terminal.
///
/// `events` must be in insertion order. `expectation` is consulted instead of
/// the terminal events when the job is multi-part.
pub fn detect(events: &[Event], expectation: Option<&SubJobExpectation>) -> Option<TerminalState> {
    if let Some(expectation) = expectation {
        if !expectation.is_resolved() {
            return None;
        }
        let urls: Vec<String> = expectation
            .completed()
            .filter_map(|s| s.url.clone())
            .collect();
        if expectation.completed().next().is_some() {
            return Some(TerminalState::Completed { result_urls: urls });
        }
        let errors: Vec<String> = expectation
            .failed()
            .map(|s| {
                format!(
                    "{}: {}",
                    s.sub_job_type,
                    s.error.as_deref().unwrap_or("Generation failed")
                )
            })
            .collect();
        return Some(TerminalState::Failed {
            error: errors.join("; "),
        });
    }

    events.iter().find(|e| e.is_terminal()).map(|e| match e.kind {
        EventKind::Completed => TerminalState::Completed {
            result_urls: e.result_urls.clone(),
        },
        _ => TerminalState::Failed {
            error: e
                .error_message
                .clone()
                .unwrap_or_else(|| "Generation failed".to_string()),
        },
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobPhase {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Latest known state of a job, synthesized from the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub status: JobPhase,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variants: Option<Vec<SubJob>>,
}

impl JobSummary {
    pub fn build(
        job: &JobRecord,
        events: &[Event],
        expectation: Option<&SubJobExpectation>,
    ) -> Self {
        let progress = events
            .iter()
            .filter_map(|e| e.progress)
            .max()
            .unwrap_or(0);
        let preview_url = events.iter().rev().find_map(|e| e.preview_url.clone());
        let variants = expectation.map(|x| x.sub_jobs.clone());

        let (status, progress, result_urls, error) = match detect(events, expectation) {
            Some(TerminalState::Completed { result_urls }) => {
                (JobPhase::Completed, 100, Some(result_urls), None)
            }
            Some(TerminalState::Failed { error }) => (JobPhase::Failed, progress, None, Some(error)),
            None if events.is_empty() => (JobPhase::Pending, 0, None, None),
            None => (JobPhase::InProgress, progress, None, None),
        };

        Self {
            id: job.id.clone(),
            status,
            progress,
            preview_url,
            result_urls,
            error,
            variants,
        }
    }
}
