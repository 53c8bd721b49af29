//! genstream: job tracking and live updates for asynchronous image generation.

mod job;
mod terminal;
mod version;

pub mod broadcast;
pub mod ingest;
pub mod mapping;
pub mod poller;
pub mod provider;
pub mod service;
pub mod storage;
pub mod store;
pub mod stream;
pub mod transport;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use job::{
    Event, EventKind, ExternalIdMapping, JobRecord, NewEvent, generate_job_id,
    terminal_dedupe_key,
};
pub use terminal::{
    JobPhase, JobSummary, SubJob, SubJobExpectation, SubJobStatus, TerminalState, detect,
};

pub use broadcast::{BroadcastConfig, Broadcaster, Frame, FrameKind, Subscription};
pub use ingest::{IngestConfig, IngestError, IngestOutcome, Ingestor, ProgressPolicy};
pub use mapping::{IdMapper, MappingError};
pub use poller::{PollConfig, PollOutcome, Poller};
pub use provider::{ImagineClient, Provider, ProviderError, ProviderImage, ProviderStatus};
pub use service::{
    GenerationRequest, GenerationService, HealthSnapshot, ServiceConfig, SubmitError, Submission,
    WebhookAck,
};
pub use storage::{HttpObjectStore, MemoryObjectStore, ObjectStore, StorageError};
pub use store::{JobStore, MemoryStore, SqliteStore, StoreError};
pub use stream::{ChannelState, LiveChannel, StreamConfig, StreamManager};
pub use version::{GENSTREAM_VERSION, VersionInfo};
