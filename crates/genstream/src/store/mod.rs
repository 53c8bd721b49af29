//! Durable job store: job rows, external id mappings, the event log and
//! sub-job expectations.
//!
//! The event log is append-only. Every row carries a dedupe key and the store
//! rejects a second row with the same key (insert, ignore conflict), so two
//! ingestion paths racing on the same terminal event record it once.

mod memory;
mod sqlite;

use async_trait::async_trait;

use crate::job::{Event, ExternalIdMapping, JobRecord, NewEvent};
use crate::terminal::{SubJob, SubJobExpectation};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("external id {external_job_id} is already mapped to {existing}")]
    Conflict {
        external_job_id: String,
        existing: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn job(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Write a mapping. Idempotent when the external id already maps to the
    /// same internal id; `StoreError::Conflict` when it maps elsewhere.
    async fn insert_mapping(&self, mapping: &ExternalIdMapping) -> Result<(), StoreError>;

    async fn resolve_external(
        &self,
        external_job_id: &str,
    ) -> Result<Option<ExternalIdMapping>, StoreError>;

    async fn mappings_for_job(
        &self,
        internal_job_id: &str,
    ) -> Result<Vec<ExternalIdMapping>, StoreError>;

    /// Append an event. Returns `None` if a row with the same dedupe key, or a
    /// terminal row for the same `(job, variant, kind)`, already exists.
    async fn append_event(&self, event: NewEvent) -> Result<Option<Event>, StoreError>;

    /// Events for a job with `id > after_id`, in insertion order.
    async fn events_for_job(
        &self,
        internal_job_id: &str,
        after_id: i64,
    ) -> Result<Vec<Event>, StoreError>;

    async fn mark_processed(&self, event_id: i64) -> Result<(), StoreError>;

    /// Upsert a sub-job entry. A resolved entry is never overwritten.
    ///
    /// Returns `None` for jobs that are not multi-part.
    async fn record_sub_job(
        &self,
        internal_job_id: &str,
        sub_job: SubJob,
    ) -> Result<Option<SubJobExpectation>, StoreError>;

    async fn expectation(
        &self,
        internal_job_id: &str,
    ) -> Result<Option<SubJobExpectation>, StoreError>;
}
