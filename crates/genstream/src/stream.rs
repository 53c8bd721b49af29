//! Stream lifecycle: one [`LiveChannel`] per client connection.
//!
//! A channel merges two sources: frames pushed by the in-process
//! [`Broadcaster`] and rows tailed from the event log on a fixed interval.
//! Either alone is enough for correctness; push only lowers latency. Frames
//! built from log rows are delivered once per event id.
//!
//! ```text
//! Opening -> Open -> ClosingNormal            -> Closed
//!                 -> ClosingTimeout           -> Closed
//!                 -> ClosingClientDisconnect  -> Closed
//! ```
//!
//! Dropping a channel deregisters its sink, releases its timers and drops its
//! leases on the shared provider poll loops.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, Frame, FrameKind, Subscription};
use crate::poller::{PollLease, Poller};
use crate::store::{JobStore, StoreError};
use crate::terminal;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub heartbeat: Duration,
    pub max_duration: Duration,
    /// Delay between delivering a terminal frame and closing.
    pub terminal_grace: Duration,
    pub log_poll_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            max_duration: Duration::from_secs(300),
            terminal_grace: Duration::from_secs(1),
            log_poll_interval: Duration::from_secs(2),
            channel_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    ClosingNormal,
    ClosingTimeout,
    ClosingClientDisconnect,
    Closed,
}

impl ChannelState {
    fn is_closing(&self) -> bool {
        matches!(
            self,
            Self::ClosingNormal | Self::ClosingTimeout | Self::ClosingClientDisconnect
        )
    }
}

/// Opens live channels. Shares one broadcaster and store across channels.
#[derive(Clone)]
pub struct StreamManager {
    store: Arc<dyn JobStore>,
    broadcaster: Arc<Broadcaster>,
    poller: Option<Poller>,
    config: StreamConfig,
    shutdown: CancellationToken,
}

impl StreamManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        broadcaster: Arc<Broadcaster>,
        config: StreamConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            broadcaster,
            poller: None,
            config,
            shutdown,
        }
    }

    /// Keep a provider poll loop running per external id while a channel is open.
    pub fn with_poller(mut self, poller: Poller) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Open a channel for `key`. Events with `id <= last_event_id` are
    /// treated as already delivered.
    pub async fn open(
        &self,
        key: &str,
        last_event_id: Option<i64>,
    ) -> Result<LiveChannel, StoreError> {
        // Register before reading the log so nothing published in between is lost.
        let subscription = self
            .broadcaster
            .subscribe(key, self.config.channel_capacity);
        let cancel = self.shutdown.child_token();

        let job = self.store.job(key).await?;
        let multi_part = job.as_ref().is_some_and(|j| j.is_multi_part());

        let polls = match (&job, &self.poller) {
            (Some(_), Some(poller)) => self.lease_polls(key, poller).await?,
            _ => Vec::new(),
        };

        let now = Instant::now();
        let mut heartbeat =
            tokio::time::interval_at(now + self.config.heartbeat, self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut log_tick = tokio::time::interval(self.config.log_poll_interval);
        log_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(key = %key, job = job.is_some(), resume_after = ?last_event_id, "Channel opened");

        Ok(LiveChannel {
            key: key.to_string(),
            job_id: job.map(|j| j.id),
            multi_part,
            state: ChannelState::Opening,
            opened_at: now,
            last_activity_at: now,
            deadline: now + self.config.max_duration,
            closing_at: None,
            subscription: Some(subscription),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            cancel,
            polls,
            heartbeat,
            log_tick,
            resume_after: last_event_id.unwrap_or(0),
            log_cursor: last_event_id.unwrap_or(0),
            seen: HashSet::new(),
            terminal_seen: false,
            pending: VecDeque::new(),
        })
    }

    async fn lease_polls(&self, job_id: &str, poller: &Poller) -> Result<Vec<PollLease>, StoreError> {
        let events = self.store.events_for_job(job_id, 0).await?;
        let leases = self
            .store
            .mappings_for_job(job_id)
            .await?
            .into_iter()
            .filter(|mapping| {
                !mapping.external_job_id.is_empty()
                    && !events
                        .iter()
                        .any(|e| e.is_terminal() && e.variant == mapping.variant)
            })
            .map(|mapping| poller.acquire(&mapping.external_job_id, &self.shutdown))
            .collect();
        Ok(leases)
    }
}

pub struct LiveChannel {
    key: String,
    job_id: Option<String>,
    multi_part: bool,
    state: ChannelState,
    opened_at: Instant,
    last_activity_at: Instant,
    deadline: Instant,
    closing_at: Option<Instant>,
    subscription: Option<Subscription>,
    store: Arc<dyn JobStore>,
    config: StreamConfig,
    cancel: CancellationToken,
    polls: Vec<PollLease>,
    heartbeat: Interval,
    log_tick: Interval,
    resume_after: i64,
    log_cursor: i64,
    seen: HashSet<i64>,
    terminal_seen: bool,
    pending: VecDeque<Frame>,
}

impl LiveChannel {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    /// Next frame for the client, or `None` once the channel has closed.
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            match self.state {
                ChannelState::Opening => {
                    self.state = ChannelState::Open;
                    self.last_activity_at = Instant::now();
                    return Some(Frame::connected(&self.key));
                }
                ChannelState::Closed => return None,
                state if state.is_closing() => {
                    self.close();
                    return None;
                }
                _ => {}
            }

            if let Some(frame) = self.pending.pop_front() {
                self.delivered(&frame).await;
                return Some(frame);
            }

            let closing_at = self.closing_at;
            let tail_log = self.job_id.is_some() && !self.terminal_seen;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.state = ChannelState::ClosingClientDisconnect;
                }
                _ = tokio::time::sleep_until(closing_at.unwrap_or(self.deadline)), if closing_at.is_some() => {
                    self.state = ChannelState::ClosingNormal;
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    if self.terminal_seen {
                        self.state = ChannelState::ClosingNormal;
                    } else {
                        self.state = ChannelState::ClosingTimeout;
                        tracing::info!(key = %self.key, max_secs = self.config.max_duration.as_secs(), "Channel reached max duration");
                        return Some(Frame::timeout(&self.key, self.config.max_duration));
                    }
                }
                _ = self.heartbeat.tick() => return Some(Frame::heartbeat()),
                frame = recv(&mut self.subscription), if !self.terminal_seen => {
                    match frame {
                        Some(frame) => self.accept(frame),
                        // Sink gone; the log tail still covers this channel.
                        None => self.subscription = None,
                    }
                }
                _ = self.log_tick.tick(), if tail_log => {
                    self.tail().await;
                }
            }
        }
    }

    /// Consume the channel as a stream of frames.
    pub fn into_stream(self) -> impl Stream<Item = Frame> + Send {
        futures::stream::unfold(self, |mut channel| async move {
            channel.next().await.map(|frame| (frame, channel))
        })
    }

    /// Queue a frame unless it was already delivered or the job already ended.
    fn accept(&mut self, frame: Frame) {
        if let Some(id) = frame.event_id
            && (id <= self.resume_after || !self.seen.insert(id))
        {
            return;
        }
        if frame.is_terminal() {
            if self.terminal_seen {
                return;
            }
            self.terminal_seen = true;
        }
        self.pending.push_back(frame);
    }

    async fn delivered(&mut self, frame: &Frame) {
        let now = Instant::now();
        self.last_activity_at = now;

        if frame.is_terminal() && self.closing_at.is_none() {
            self.closing_at = Some(now + self.config.terminal_grace);
        }

        let settles_event = matches!(
            frame.kind,
            FrameKind::Complete | FrameKind::Failed | FrameKind::Variant | FrameKind::Error
        );
        if settles_event
            && let Some(id) = frame.event_id
            && let Err(e) = self.store.mark_processed(id).await
        {
            tracing::warn!(key = %self.key, event_id = id, error = %e, "Failed to mark event processed");
        }
    }

    async fn tail(&mut self) {
        let Some(job_id) = self.job_id.clone() else {
            return;
        };
        let events = match self.store.events_for_job(&job_id, self.log_cursor).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to read event log");
                return;
            }
        };

        for event in &events {
            self.log_cursor = self.log_cursor.max(event.id);
            self.accept(Frame::from_event(event));
        }

        // The aggregate has no event id and the sub-job row can land after the
        // variant event, so re-check on every tick until it resolves.
        if self.multi_part && !self.terminal_seen {
            match self.store.expectation(&job_id).await {
                Ok(Some(expectation)) => {
                    if let Some(state) = terminal::detect(&[], Some(&expectation)) {
                        self.accept(Frame::resolved(&job_id, &state, &expectation));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to read sub-job expectation");
                }
            }
        }
    }

    fn close(&mut self) {
        let reason = self.state;
        self.state = ChannelState::Closed;
        self.subscription.take();
        self.polls.clear();
        self.cancel.cancel();
        tracing::debug!(
            key = %self.key,
            reason = ?reason,
            open_ms = self.opened_at.elapsed().as_millis() as u64,
            "Channel closed"
        );
    }
}

async fn recv(subscription: &mut Option<Subscription>) -> Option<Frame> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        if self.state != ChannelState::Closed {
            tracing::debug!(key = %self.key, state = ?self.state, "Channel dropped by client");
        }
        // Subscription and poll leases release themselves.
        self.cancel.cancel();
    }
}
