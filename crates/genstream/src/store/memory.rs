//! In-process store backed by concurrent maps.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{JobStore, StoreError};
use crate::job::{Event, ExternalIdMapping, JobRecord, NewEvent, terminal_dedupe_key};
use crate::terminal::{SubJob, SubJobExpectation};

#[derive(Default)]
struct EventTable {
    rows: Vec<Event>,
    keys: HashSet<String>,
    next_id: i64,
}

/// Ephemeral store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    jobs: DashMap<String, JobRecord>,
    mappings: DashMap<String, ExternalIdMapping>,
    events: Mutex<EventTable>,
    sub_jobs: DashMap<String, SubJobExpectation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        if let Some(expected) = job.expected_count {
            self.sub_jobs
                .entry(job.id.clone())
                .or_insert_with(|| SubJobExpectation::new(job.id.clone(), expected));
        }
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.get(id).map(|j| j.clone()))
    }

    async fn insert_mapping(&self, mapping: &ExternalIdMapping) -> Result<(), StoreError> {
        match self.mappings.entry(mapping.external_job_id.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().internal_job_id == mapping.internal_job_id {
                    Ok(())
                } else {
                    Err(StoreError::Conflict {
                        external_job_id: mapping.external_job_id.clone(),
                        existing: existing.get().internal_job_id.clone(),
                    })
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(mapping.clone());
                Ok(())
            }
        }
    }

    async fn resolve_external(
        &self,
        external_job_id: &str,
    ) -> Result<Option<ExternalIdMapping>, StoreError> {
        Ok(self.mappings.get(external_job_id).map(|m| m.clone()))
    }

    async fn mappings_for_job(
        &self,
        internal_job_id: &str,
    ) -> Result<Vec<ExternalIdMapping>, StoreError> {
        let mut found: Vec<ExternalIdMapping> = self
            .mappings
            .iter()
            .filter(|m| m.internal_job_id == internal_job_id)
            .map(|m| m.clone())
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn append_event(&self, event: NewEvent) -> Result<Option<Event>, StoreError> {
        let mut table = self.events.lock().unwrap_or_else(PoisonError::into_inner);

        let terminal_key = event.kind.is_terminal().then(|| {
            terminal_dedupe_key(
                &event.internal_job_id,
                event.variant.as_deref(),
                event.kind,
            )
        });
        if table.keys.contains(&event.dedupe_key)
            || terminal_key.as_ref().is_some_and(|k| table.keys.contains(k))
        {
            return Ok(None);
        }

        table.next_id += 1;
        let id = table.next_id;
        table.keys.insert(event.dedupe_key.clone());
        if let Some(key) = terminal_key {
            table.keys.insert(key);
        }
        let row = Event::from_new(id, event);
        table.rows.push(row.clone());
        Ok(Some(row))
    }

    async fn events_for_job(
        &self,
        internal_job_id: &str,
        after_id: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let table = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(table
            .rows
            .iter()
            .filter(|e| e.internal_job_id == internal_job_id && e.id > after_id)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, event_id: i64) -> Result<(), StoreError> {
        let mut table = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(row) = table.rows.iter_mut().find(|e| e.id == event_id) {
            row.processed = true;
        }
        Ok(())
    }

    async fn record_sub_job(
        &self,
        internal_job_id: &str,
        sub_job: SubJob,
    ) -> Result<Option<SubJobExpectation>, StoreError> {
        Ok(self.sub_jobs.get_mut(internal_job_id).map(|mut x| {
            x.record(sub_job);
            x.clone()
        }))
    }

    async fn expectation(
        &self,
        internal_job_id: &str,
    ) -> Result<Option<SubJobExpectation>, StoreError> {
        Ok(self.sub_jobs.get(internal_job_id).map(|x| x.clone()))
    }
}
