//! SQLite-backed store.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};

use super::{JobStore, StoreError};
use crate::job::{Event, EventKind, ExternalIdMapping, JobRecord, NewEvent};
use crate::terminal::{SubJob, SubJobExpectation, SubJobStatus};

const EVENT_COLUMNS: &str = "id, internal_job_id, external_job_id, variant, kind, progress, \
     preview_url, result_urls, upscaled_urls, error_message, dedupe_key, raw_payload, \
     processed, created_at";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!("Job store migrations applied");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn mapping_from_row(row: &SqliteRow) -> Result<ExternalIdMapping, StoreError> {
    Ok(ExternalIdMapping {
        external_job_id: row.try_get("external_job_id")?,
        internal_job_id: row.try_get("internal_job_id")?,
        variant: row.try_get("variant")?,
        created_at: row.try_get("created_at")?,
    })
}

fn urls_from_column(row: &SqliteRow, column: &str) -> Result<Vec<String>, StoreError> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn event_from_row(row: &SqliteRow) -> Result<Event, StoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = EventKind::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown event kind '{kind}'")))?;
    let progress: Option<i64> = row.try_get("progress")?;
    let raw_payload: String = row.try_get("raw_payload")?;

    Ok(Event {
        id: row.try_get("id")?,
        internal_job_id: row.try_get("internal_job_id")?,
        external_job_id: row.try_get("external_job_id")?,
        variant: row.try_get("variant")?,
        kind,
        progress: progress.map(|p| p.clamp(0, 100) as u8),
        preview_url: row.try_get("preview_url")?,
        result_urls: urls_from_column(row, "result_urls")?,
        upscaled_urls: urls_from_column(row, "upscaled_urls")?,
        error_message: row.try_get("error_message")?,
        dedupe_key: row.try_get("dedupe_key")?,
        raw_payload: serde_json::from_str(&raw_payload).unwrap_or(serde_json::Value::Null),
        processed: row.try_get("processed")?,
        created_at: row.try_get("created_at")?,
    })
}

fn sub_job_from_row(row: &SqliteRow) -> Result<SubJob, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(SubJob {
        sub_job_type: row.try_get("type")?,
        status: SubJobStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown sub-job status '{status}'")))?,
        url: row.try_get("url")?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobs (id, prompt, expected_count, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&job.id)
        .bind(&job.prompt)
        .bind(job.expected_count.map(|c| c as i64))
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT id, prompt, expected_count, created_at FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| -> Result<JobRecord, StoreError> {
            let expected: Option<i64> = r.try_get("expected_count")?;
            Ok(JobRecord {
                id: r.try_get("id")?,
                prompt: r.try_get("prompt")?,
                expected_count: expected.map(|c| c.max(0) as usize),
                created_at: r.try_get::<DateTime<Utc>, _>("created_at")?,
            })
        })
        .transpose()
    }

    async fn insert_mapping(&self, mapping: &ExternalIdMapping) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO external_ids (external_job_id, internal_job_id, variant, created_at) \
             VALUES (?, ?, ?, ?) ON CONFLICT (external_job_id) DO NOTHING",
        )
        .bind(&mapping.external_job_id)
        .bind(&mapping.internal_job_id)
        .bind(&mapping.variant)
        .bind(mapping.created_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(());
        }

        match self.resolve_external(&mapping.external_job_id).await? {
            Some(existing) if existing.internal_job_id == mapping.internal_job_id => Ok(()),
            Some(existing) => Err(StoreError::Conflict {
                external_job_id: mapping.external_job_id.clone(),
                existing: existing.internal_job_id,
            }),
            None => Err(StoreError::Corrupt(format!(
                "mapping for {} neither inserted nor found",
                mapping.external_job_id
            ))),
        }
    }

    async fn resolve_external(
        &self,
        external_job_id: &str,
    ) -> Result<Option<ExternalIdMapping>, StoreError> {
        let row = sqlx::query(
            "SELECT external_job_id, internal_job_id, variant, created_at \
             FROM external_ids WHERE external_job_id = ?",
        )
        .bind(external_job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn mappings_for_job(
        &self,
        internal_job_id: &str,
    ) -> Result<Vec<ExternalIdMapping>, StoreError> {
        let rows = sqlx::query(
            "SELECT external_job_id, internal_job_id, variant, created_at \
             FROM external_ids WHERE internal_job_id = ? ORDER BY created_at, rowid",
        )
        .bind(internal_job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(mapping_from_row).collect()
    }

    async fn append_event(&self, event: NewEvent) -> Result<Option<Event>, StoreError> {
        let result_urls = serde_json::to_string(&event.result_urls)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let upscaled_urls = serde_json::to_string(&event.upscaled_urls)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let raw_payload = event.raw_payload.to_string();
        let created_at = Utc::now();

        let row = sqlx::query(
            "INSERT INTO events (internal_job_id, external_job_id, variant, kind, progress, \
             preview_url, result_urls, upscaled_urls, error_message, dedupe_key, raw_payload, \
             processed, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?) \
             ON CONFLICT DO NOTHING \
             RETURNING id",
        )
        .bind(&event.internal_job_id)
        .bind(&event.external_job_id)
        .bind(&event.variant)
        .bind(event.kind.as_str())
        .bind(event.progress.map(i64::from))
        .bind(&event.preview_url)
        .bind(result_urls)
        .bind(upscaled_urls)
        .bind(&event.error_message)
        .bind(&event.dedupe_key)
        .bind(raw_payload)
        .bind(created_at)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;
        let mut recorded = Event::from_new(id, event);
        recorded.created_at = created_at;
        Ok(Some(recorded))
    }

    async fn events_for_job(
        &self,
        internal_job_id: &str,
        after_id: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE internal_job_id = ? AND id > ? ORDER BY id"
        ))
        .bind(internal_job_id)
        .bind(after_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn mark_processed(&self, event_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE events SET processed = 1 WHERE id = ?")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_sub_job(
        &self,
        internal_job_id: &str,
        sub_job: SubJob,
    ) -> Result<Option<SubJobExpectation>, StoreError> {
        let Some(job) = self.job(internal_job_id).await? else {
            return Ok(None);
        };
        if !job.is_multi_part() {
            return Ok(None);
        }

        sqlx::query(
            "INSERT INTO sub_jobs (internal_job_id, type, status, url, error, position) \
             VALUES (?1, ?2, ?3, ?4, ?5, \
                     (SELECT COUNT(*) FROM sub_jobs WHERE internal_job_id = ?1)) \
             ON CONFLICT (internal_job_id, type) DO UPDATE SET \
                 status = excluded.status, url = excluded.url, error = excluded.error \
             WHERE sub_jobs.status = 'pending'",
        )
        .bind(internal_job_id)
        .bind(&sub_job.sub_job_type)
        .bind(sub_job.status.as_str())
        .bind(&sub_job.url)
        .bind(&sub_job.error)
        .execute(&self.pool)
        .await?;

        self.expectation(internal_job_id).await
    }

    async fn expectation(
        &self,
        internal_job_id: &str,
    ) -> Result<Option<SubJobExpectation>, StoreError> {
        let Some(job) = self.job(internal_job_id).await? else {
            return Ok(None);
        };
        let Some(expected_count) = job.expected_count else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT type, status, url, error FROM sub_jobs \
             WHERE internal_job_id = ? ORDER BY position",
        )
        .bind(internal_job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(SubJobExpectation {
            internal_job_id: internal_job_id.to_string(),
            expected_count,
            sub_jobs: rows
                .iter()
                .map(sub_job_from_row)
                .collect::<Result<_, _>>()?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    fn completed(mapping: &ExternalIdMapping, key: &str) -> NewEvent {
        let mut event = NewEvent::new(mapping, EventKind::Completed, key.to_string());
        event.result_urls = vec!["https://cdn/x.png".to_string()];
        event.raw_payload = serde_json::json!({"status": "completed"});
        event
    }

    #[tokio::test]
    async fn job_roundtrip() {
        let store = store().await;
        store
            .insert_job(&JobRecord::new("job-1", "a red coat").with_expected_count(2))
            .await
            .unwrap();

        let job = store.job("job-1").await.unwrap().unwrap();
        assert_eq!(job.prompt, "a red coat");
        assert_eq!(job.expected_count, Some(2));
        assert!(store.job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mapping_conflict_and_idempotence() {
        let store = store().await;
        let mapping = ExternalIdMapping::new("ext-1", "job-1").with_variant("side");
        store.insert_mapping(&mapping).await.unwrap();
        store.insert_mapping(&mapping).await.unwrap();

        let err = store
            .insert_mapping(&ExternalIdMapping::new("ext-1", "job-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let resolved = store.resolve_external("ext-1").await.unwrap().unwrap();
        assert_eq!(resolved.internal_job_id, "job-1");
        assert_eq!(resolved.variant.as_deref(), Some("side"));
        assert_eq!(store.mappings_for_job("job-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_event_unique_by_constraint() {
        let store = store().await;
        let mapping = ExternalIdMapping::new("ext-1", "job-1");

        let first = store.append_event(completed(&mapping, "k1")).await.unwrap();
        let same_key = store.append_event(completed(&mapping, "k1")).await.unwrap();
        let other_key = store.append_event(completed(&mapping, "k2")).await.unwrap();

        assert!(first.is_some());
        assert!(same_key.is_none());
        assert!(other_key.is_none());
        assert_eq!(store.events_for_job("job-1", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_events_per_variant_are_independent() {
        let store = store().await;
        let side = ExternalIdMapping::new("ext-side", "job-1").with_variant("side");
        let back = ExternalIdMapping::new("ext-back", "job-1").with_variant("back");

        assert!(store.append_event(completed(&side, "s")).await.unwrap().is_some());
        assert!(store.append_event(completed(&back, "b")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn events_roundtrip_columns_in_order() {
        let store = store().await;
        let mapping = ExternalIdMapping::new("ext-1", "job-1");
        let mut progress = NewEvent::new(&mapping, EventKind::Progress, "p".to_string());
        progress.progress = Some(50);
        progress.preview_url = Some("https://provider/preview.png".to_string());
        store.append_event(progress).await.unwrap();
        store.append_event(completed(&mapping, "c")).await.unwrap();

        let events = store.events_for_job("job-1", 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].id < events[1].id);
        assert_eq!(events[0].progress, Some(50));
        assert_eq!(events[1].kind, EventKind::Completed);
        assert_eq!(events[1].result_urls, vec!["https://cdn/x.png".to_string()]);
        assert_eq!(events[1].raw_payload["status"], "completed");
        assert!(!events[1].processed);

        store.mark_processed(events[1].id).await.unwrap();
        let tail = store.events_for_job("job-1", events[0].id).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(tail[0].processed);
    }

    #[tokio::test]
    async fn sub_job_upsert_keeps_resolved_entries() {
        let store = store().await;
        store
            .insert_job(&JobRecord::new("job-1", "p").with_expected_count(2))
            .await
            .unwrap();

        store
            .record_sub_job("job-1", SubJob::pending("side"))
            .await
            .unwrap();
        store
            .record_sub_job("job-1", SubJob::completed("side", "https://cdn/side.png"))
            .await
            .unwrap();
        let x = store
            .record_sub_job("job-1", SubJob::failed("side", "late"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(x.sub_jobs.len(), 1);
        assert_eq!(x.sub_jobs[0].status, SubJobStatus::Completed);
        assert!(!x.is_resolved());

        let x = store
            .record_sub_job("job-1", SubJob::failed("back", "blocked"))
            .await
            .unwrap()
            .unwrap();
        assert!(x.is_resolved());
        assert_eq!(x.sub_jobs[1].sub_job_type, "back");
    }

    #[tokio::test]
    async fn single_part_job_has_no_expectation() {
        let store = store().await;
        store.insert_job(&JobRecord::new("job-1", "p")).await.unwrap();
        assert!(store.expectation("job-1").await.unwrap().is_none());
        assert!(
            store
                .record_sub_job("job-1", SubJob::completed("side", "u"))
                .await
                .unwrap()
                .is_none()
        );
    }
}
