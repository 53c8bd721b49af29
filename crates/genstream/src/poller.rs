//! Polling fallback for providers that never call back.
//!
//! Each loop polls one external job on a fixed interval and feeds every
//! response through [`Ingestor::ingest`]. It ends on a terminal report, on the
//! maximum duration, or when its cancellation token fires; cancellation stops
//! further provider requests immediately.
//!
//! Loops started through [`Poller::acquire`] are shared: one loop per external
//! id, kept alive while any [`PollLease`] for it is held.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::ingest::{IngestOutcome, Ingestor};
use crate::provider::Provider;

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_duration: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_duration: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Terminal,
    TimedOut,
    Cancelled,
}

struct ActivePoll {
    id: u64,
    cancel: CancellationToken,
    done: CancellationToken,
    holders: usize,
}

type ActivePolls = Arc<DashMap<String, ActivePoll>>;

#[derive(Clone)]
pub struct Poller {
    provider: Arc<dyn Provider>,
    ingestor: Arc<Ingestor>,
    config: PollConfig,
    active: ActivePolls,
    next_id: Arc<AtomicU64>,
}

impl Poller {
    pub fn new(provider: Arc<dyn Provider>, ingestor: Arc<Ingestor>, config: PollConfig) -> Self {
        Self {
            provider,
            ingestor,
            config,
            active: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Number of shared loops currently running.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Join the shared loop for `external_job_id`, starting it under `parent`
    /// if none is running. The loop is cancelled once every lease is dropped.
    pub fn acquire(&self, external_job_id: &str, parent: &CancellationToken) -> PollLease {
        let mut started = None;
        let (id, done) = match self.active.entry(external_job_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let active = entry.get_mut();
                active.holders += 1;
                (active.id, active.done.clone())
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let cancel = parent.child_token();
                let done = CancellationToken::new();
                entry.insert(ActivePoll {
                    id,
                    cancel: cancel.clone(),
                    done: done.clone(),
                    holders: 1,
                });
                started = Some((cancel, done.clone()));
                (id, done)
            }
        };

        if let Some((cancel, done)) = started {
            let poller = self.clone();
            let external_job_id = external_job_id.to_string();
            tokio::spawn(async move {
                poller.run(&external_job_id, cancel).await;
                poller.active.remove_if(&external_job_id, |_, a| a.id == id);
                done.cancel();
            });
        } else {
            tracing::debug!(external_id = %external_job_id, "Joined running poll loop");
        }

        PollLease {
            active: Arc::clone(&self.active),
            external_job_id: external_job_id.to_string(),
            id,
            done,
        }
    }

    /// Poll `external_job_id` until it settles, times out, or `cancel` fires.
    pub async fn run(&self, external_job_id: &str, cancel: CancellationToken) -> PollOutcome {
        let deadline = Instant::now() + self.config.max_duration;
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(external_id = %external_job_id, "Poll loop started");

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break PollOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break PollOutcome::TimedOut,
                _ = tick.tick() => {}
            }

            if self.poll_once(external_job_id).await {
                break PollOutcome::Terminal;
            }
        };

        match outcome {
            PollOutcome::TimedOut => tracing::warn!(
                external_id = %external_job_id,
                max_secs = self.config.max_duration.as_secs(),
                "Poll loop reached max duration without a terminal state"
            ),
            _ => tracing::debug!(external_id = %external_job_id, outcome = ?outcome, "Poll loop ended"),
        }
        outcome
    }

    /// One provider round trip. Returns true once nothing more is expected.
    async fn poll_once(&self, external_job_id: &str) -> bool {
        let image = match self.provider.status(external_job_id).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(external_id = %external_job_id, error = %e, "Provider poll failed, retrying next tick");
                return false;
            }
        };

        let raw = serde_json::to_value(&image).unwrap_or(serde_json::Value::Null);
        match self.ingestor.ingest(&image, raw).await {
            Ok(outcome) if outcome.is_settled() => true,
            // Already terminal on another path.
            Ok(IngestOutcome::Duplicate) => crate::ingest::classify(image.status).is_terminal(),
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(external_id = %external_job_id, error = %e, "Failed to ingest polled status");
                false
            }
        }
    }
}

/// Share of a running poll loop. Dropping the last lease cancels the loop.
pub struct PollLease {
    active: ActivePolls,
    external_job_id: String,
    id: u64,
    done: CancellationToken,
}

impl PollLease {
    pub fn external_job_id(&self) -> &str {
        &self.external_job_id
    }

    /// Resolves when the loop ends for any reason.
    pub async fn finished(&self) {
        self.done.cancelled().await;
    }
}

impl Drop for PollLease {
    fn drop(&mut self) {
        let Entry::Occupied(mut entry) = self.active.entry(self.external_job_id.clone()) else {
            return;
        };
        // A newer loop for the same id is not ours to release.
        if entry.get().id != self.id {
            return;
        }
        entry.get_mut().holders -= 1;
        if entry.get().holders == 0 {
            entry.remove().cancel.cancel();
        }
    }
}
