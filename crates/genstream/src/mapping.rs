//! External id mapper: provider job id -> internal job id.
//!
//! Mappings are written at submission time, before the submission returns,
//! and read by every later webhook or poll.

use std::sync::Arc;

use crate::job::ExternalIdMapping;
use crate::store::{JobStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("external id {external_job_id} is already mapped to {existing}")]
    Conflict {
        external_job_id: String,
        existing: String,
    },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for MappingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict {
                external_job_id,
                existing,
            } => Self::Conflict {
                external_job_id,
                existing,
            },
            other => Self::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct IdMapper {
    store: Arc<dyn JobStore>,
}

impl IdMapper {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        external_job_id: &str,
        internal_job_id: &str,
        variant: Option<&str>,
    ) -> Result<ExternalIdMapping, MappingError> {
        let mut mapping = ExternalIdMapping::new(external_job_id, internal_job_id);
        if let Some(v) = variant {
            mapping = mapping.with_variant(v);
        }
        self.store.insert_mapping(&mapping).await?;
        tracing::debug!(
            external_id = %external_job_id,
            job_id = %internal_job_id,
            variant = ?variant,
            "External id mapped"
        );
        Ok(mapping)
    }

    /// `None` when the provider id is unknown.
    pub async fn resolve(
        &self,
        external_job_id: &str,
    ) -> Result<Option<ExternalIdMapping>, MappingError> {
        Ok(self.store.resolve_external(external_job_id).await?)
    }

    pub async fn external_ids(
        &self,
        internal_job_id: &str,
    ) -> Result<Vec<ExternalIdMapping>, MappingError> {
        Ok(self.store.mappings_for_job(internal_job_id).await?)
    }
}
