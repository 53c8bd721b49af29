//! Live update broadcaster.
//!
//! Process-local registry of output sinks keyed by channel key (an internal
//! job id or a client-chosen session id). Publishing to a key with no sink
//! caches the frame so the next subscriber gets it on connect.
//!
//! A single-process registry only. Streams stay correct across processes
//! because they also tail the event log; see [`crate::stream`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::job::{Event, EventKind};
use crate::terminal::{SubJobExpectation, TerminalState};

/// Named event on the client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Connected,
    Progress,
    /// One sub-job of a multi-part job completed.
    Variant,
    Complete,
    AllComplete,
    /// One sub-job of a multi-part job failed.
    Error,
    Failed,
    Timeout,
    Heartbeat,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Progress => "progress",
            Self::Variant => "variant",
            Self::Complete => "complete",
            Self::AllComplete => "all_complete",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Frames after which the job has nothing more to say.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::AllComplete | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub data: serde_json::Value,
    /// Event log id the frame was built from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
}

impl Frame {
    pub fn new(kind: FrameKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            event_id: None,
        }
    }

    pub fn connected(key: &str) -> Self {
        Self::new(FrameKind::Connected, serde_json::json!({ "key": key }))
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, serde_json::Value::Null)
    }

    pub fn timeout(key: &str, after: Duration) -> Self {
        Self::new(
            FrameKind::Timeout,
            serde_json::json!({
                "key": key,
                "message": "Stream timed out, check the job status",
                "afterSecs": after.as_secs(),
            }),
        )
    }

    /// Frame for a recorded event. Sub-job events map to `variant`/`error`.
    pub fn from_event(event: &Event) -> Self {
        let kind = match (event.kind, event.variant.is_some()) {
            (EventKind::Progress, _) => FrameKind::Progress,
            (EventKind::Completed, false) => FrameKind::Complete,
            (EventKind::Completed, true) => FrameKind::Variant,
            (EventKind::Failed, false) => FrameKind::Failed,
            (EventKind::Failed, true) => FrameKind::Error,
        };
        let data = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        Self {
            kind,
            data,
            event_id: Some(event.id),
        }
    }

    /// Aggregate frame for a multi-part job that has resolved.
    pub fn resolved(
        internal_job_id: &str,
        state: &TerminalState,
        expectation: &SubJobExpectation,
    ) -> Self {
        match state {
            TerminalState::Completed { result_urls } => Self::new(
                FrameKind::AllComplete,
                serde_json::json!({
                    "internalJobId": internal_job_id,
                    "resultUrls": result_urls,
                    "variants": expectation.sub_jobs,
                }),
            ),
            TerminalState::Failed { error } => Self::new(
                FrameKind::Failed,
                serde_json::json!({
                    "internalJobId": internal_job_id,
                    "errorMessage": error,
                    "variants": expectation.sub_jobs,
                }),
            ),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// How long a frame cached for an absent listener is kept.
    pub cache_ttl: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
        }
    }
}

struct CachedFrame {
    frame: Frame,
    cached_at: Instant,
}

pub struct Broadcaster {
    channels: DashMap<String, HashMap<u64, mpsc::Sender<Frame>>>,
    cache: DashMap<String, CachedFrame>,
    next_sink_id: AtomicU64,
    config: BroadcastConfig,
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            cache: DashMap::new(),
            next_sink_id: AtomicU64::new(1),
            config,
        })
    }

    /// Register a sink under `key`. A frame cached for the key is delivered
    /// immediately and removed from the cache.
    pub fn subscribe(self: &Arc<Self>, key: &str, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink_id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);

        if let Some((_, cached)) = self.cache.remove(key)
            && cached.cached_at.elapsed() <= self.config.cache_ttl
        {
            let _ = tx.try_send(cached.frame);
        }

        self.channels
            .entry(key.to_string())
            .or_default()
            .insert(sink_id, tx);

        tracing::debug!(key = %key, sink_id, "Channel registered");

        Subscription {
            key: key.to_string(),
            sink_id,
            rx,
            broadcaster: Arc::clone(self),
        }
    }

    /// Deliver `frame` to every sink under `key`, or cache it if there are none.
    ///
    /// Returns the number of sinks the frame was written to.
    pub fn publish(&self, key: &str, frame: Frame) -> usize {
        let mut delivered = 0;

        if let Some(mut sinks) = self.channels.get_mut(key) {
            sinks.retain(|sink_id, tx| match tx.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow reader: it will catch up from the event log.
                    tracing::debug!(key = %key, sink_id, "Channel full, frame skipped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(key = %key, sink_id, "Channel write failed, removing sink");
                    false
                }
            });
        }
        self.channels.remove_if(key, |_, sinks| sinks.is_empty());

        if delivered == 0 {
            self.cache.insert(
                key.to_string(),
                CachedFrame {
                    frame,
                    cached_at: Instant::now(),
                },
            );
        }
        delivered
    }

    fn unsubscribe(&self, key: &str, sink_id: u64) {
        if let Some(mut sinks) = self.channels.get_mut(key) {
            sinks.remove(&sink_id);
        }
        self.channels.remove_if(key, |_, sinks| sinks.is_empty());
        tracing::debug!(key = %key, sink_id, "Channel deregistered");
    }

    /// Number of open sinks across all keys.
    pub fn channel_count(&self) -> usize {
        self.channels.iter().map(|e| e.value().len()).sum()
    }

    pub fn has_listeners(&self, key: &str) -> bool {
        self.channels.get(key).is_some_and(|s| !s.is_empty())
    }

    pub fn cached(&self, key: &str) -> Option<Frame> {
        self.cache.get(key).map(|c| c.frame.clone())
    }

    /// Drop cached frames older than the TTL. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let before = self.cache.len();
        let ttl = self.config.cache_ttl;
        self.cache.retain(|_, c| c.cached_at.elapsed() <= ttl);
        before - self.cache.len()
    }

    /// Sweep the cache every `ttl / 2` until `shutdown` fires.
    pub fn spawn_janitor(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        let period = (self.config.cache_ttl / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let dropped = broadcaster.sweep_expired();
                        if dropped > 0 {
                            tracing::debug!(dropped, "Expired cached frames");
                        }
                    }
                }
            }
        })
    }
}

/// Receiving end of a registered sink. Deregisters on drop.
pub struct Subscription {
    key: String,
    sink_id: u64,
    rx: mpsc::Receiver<Frame>,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(&self.key, self.sink_id);
    }
}
