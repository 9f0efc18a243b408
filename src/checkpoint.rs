//! Durable checkpoint store: `jobs` and `checkpoints` tables with a foreign
//! key cascade delete, backing resume and the no-duplicate-work invariant.
//!
//! Presence of a checkpoint row for `(job_id, chunk_index)` means that chunk
//! is permanently completed and shall never be re-translated.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, Result};
use crate::model::{ChunkingConfig, JobStats, JobStatus, PromptOptions, TranslationJob};
use crate::provider::ProviderConfig;

/// One persisted chunk translation, keyed by `(job_id, chunk_index)`.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub job_id: String,
    pub chunk_index: u64,
    pub translated_text: String,
    pub persisted_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl CheckpointStore {
    /// Open or create the checkpoint database at `path`, initializing the
    /// schema if absent.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(EngineError::Store)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS jobs (
                 job_id TEXT PRIMARY KEY,
                 input_path TEXT NOT NULL,
                 output_path TEXT NOT NULL,
                 source_lang TEXT NOT NULL,
                 target_lang TEXT NOT NULL,
                 provider_config_json TEXT NOT NULL,
                 chunking_config_json TEXT NOT NULL DEFAULT '{}',
                 prompt_options_json TEXT NOT NULL DEFAULT '{}',
                 status TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 stats_json TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS checkpoints (
                 job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
                 chunk_index INTEGER NOT NULL,
                 translated_text TEXT NOT NULL,
                 persisted_at TEXT NOT NULL,
                 PRIMARY KEY (job_id, chunk_index)
             );
             CREATE INDEX IF NOT EXISTS idx_checkpoints_job ON checkpoints(job_id);",
        )
        .map_err(EngineError::Store)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::InputInvalid("checkpoint store lock poisoned".into()))
    }

    /// Insert or replace a job row. Called on submit and on every status transition.
    pub fn upsert_job(&self, job: &TranslationJob) -> Result<()> {
        let conn = self.lock()?;
        let provider_json = serde_json::to_string(&job.provider_config).map_err(EngineError::Json)?;
        let chunking_json = serde_json::to_string(&job.chunking_config).map_err(EngineError::Json)?;
        let prompt_json = serde_json::to_string(&job.prompt_options).map_err(EngineError::Json)?;
        let stats_json = serde_json::to_string(&job.stats).map_err(EngineError::Json)?;
        conn.execute(
            "INSERT INTO jobs (job_id, input_path, output_path, source_lang, target_lang,
                                provider_config_json, chunking_config_json, prompt_options_json,
                                status, created_at, updated_at, stats_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(job_id) DO UPDATE SET
                 output_path = excluded.output_path,
                 status = excluded.status,
                 updated_at = excluded.updated_at,
                 stats_json = excluded.stats_json",
            params![
                job.job_id,
                job.input_path,
                job.output_path,
                job.source_lang,
                job.target_lang,
                provider_json,
                chunking_json,
                prompt_json,
                status_str(job.status),
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                stats_json,
            ],
        )
        .map_err(EngineError::Store)?;
        Ok(())
    }

    /// Atomically persist one completed chunk's translation. A write must
    /// complete before the orchestrator begins the next chunk, per the
    /// checkpointing contract.
    pub fn write_checkpoint(&self, job_id: &str, chunk_index: u64, translated_text: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO checkpoints (job_id, chunk_index, translated_text, persisted_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_id, chunk_index) DO UPDATE SET
                 translated_text = excluded.translated_text,
                 persisted_at = excluded.persisted_at",
            params![job_id, chunk_index as i64, translated_text, Utc::now().to_rfc3339()],
        )
        .map_err(EngineError::Store)?;
        Ok(())
    }

    /// Range scan over `chunk_index` for one job, used to rebuild completed
    /// chunk state on resume.
    pub fn checkpoints_for_job(&self, job_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT job_id, chunk_index, translated_text, persisted_at
                 FROM checkpoints WHERE job_id = ?1 ORDER BY chunk_index",
            )
            .map_err(EngineError::Store)?;

        let rows = stmt
            .query_map(params![job_id], |row| {
                let chunk_index: i64 = row.get(1)?;
                let persisted_at: String = row.get(3)?;
                Ok(Checkpoint {
                    job_id: row.get(0)?,
                    chunk_index: chunk_index as u64,
                    translated_text: row.get(2)?,
                    persisted_at: DateTime::parse_from_rfc3339(&persisted_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(EngineError::Store)?;

        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row.map_err(EngineError::Store)?);
        }
        Ok(checkpoints)
    }

    /// Fetch a job row, reconstructing `TranslationJob` from its persisted columns.
    pub fn get_job(&self, job_id: &str) -> Result<Option<TranslationJob>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT job_id, input_path, output_path, source_lang, target_lang,
                        provider_config_json, chunking_config_json, prompt_options_json,
                        status, created_at, updated_at, stats_json
                 FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| {
                    let provider_json: String = row.get(5)?;
                    let chunking_json: String = row.get(6)?;
                    let prompt_json: String = row.get(7)?;
                    let status_str: String = row.get(8)?;
                    let created_at: String = row.get(9)?;
                    let updated_at: String = row.get(10)?;
                    let stats_json: String = row.get(11)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        provider_json,
                        chunking_json,
                        prompt_json,
                        status_str,
                        created_at,
                        updated_at,
                        stats_json,
                    ))
                },
            )
            .optional()
            .map_err(EngineError::Store)?;

        let Some((job_id, input_path, output_path, source_lang, target_lang, provider_json, chunking_json, prompt_json, status_str, created_at, updated_at, stats_json)) = row else {
            return Ok(None);
        };

        let provider_config: ProviderConfig = serde_json::from_str(&provider_json).map_err(EngineError::Json)?;
        let chunking_config: ChunkingConfig = serde_json::from_str(&chunking_json).map_err(EngineError::Json)?;
        let prompt_options: PromptOptions = serde_json::from_str(&prompt_json).map_err(EngineError::Json)?;
        let stats: JobStats = serde_json::from_str(&stats_json).map_err(EngineError::Json)?;

        Ok(Some(TranslationJob {
            job_id,
            input_path,
            output_path,
            source_lang,
            target_lang,
            provider_config,
            chunking_config,
            prompt_options,
            status: parse_status(&status_str),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            stats,
            last_error: None,
        }))
    }

    /// Delete a job and cascade-delete its checkpoints.
    pub fn delete_job(&self, job_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])
            .map_err(EngineError::Store)?;
        Ok(changed > 0)
    }

    pub fn list_job_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT job_id FROM jobs ORDER BY created_at")
            .map_err(EngineError::Store)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(EngineError::Store)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(EngineError::Store)?);
        }
        Ok(ids)
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Error => "error",
        JobStatus::Interrupted => "interrupted",
    }
}

fn parse_status(s: &str) -> JobStatus {
    match s {
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "error" => JobStatus::Error,
        "interrupted" => JobStatus::Interrupted,
        _ => JobStatus::Queued,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChunkingConfig;
    use crate::provider::ProviderKind;
    use tempfile::TempDir;

    fn test_store() -> (CheckpointStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(&dir.path().join("checkpoints.db")).unwrap();
        (store, dir)
    }

    fn test_job(id: &str) -> TranslationJob {
        TranslationJob::new(
            id.to_string(),
            "in.txt".into(),
            "out.txt".into(),
            "ja".into(),
            "en".into(),
            ProviderConfig {
                kind: ProviderKind::Ollama,
                endpoint: "http://localhost:11434".into(),
                api_key: None,
                model: "llama3".into(),
                timeout_secs: 900,
                context_window_hint: None,
                extra_headers: vec![],
            },
            ChunkingConfig::default(),
            Default::default(),
        )
    }

    #[test]
    fn write_and_read_checkpoints_round_trip() {
        let (store, _dir) = test_store();
        let job = test_job("job-1");
        store.upsert_job(&job).unwrap();
        store.write_checkpoint("job-1", 0, "hello").unwrap();
        store.write_checkpoint("job-1", 1, "world").unwrap();

        let checkpoints = store.checkpoints_for_job("job-1").unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].chunk_index, 0);
        assert_eq!(checkpoints[1].translated_text, "world");
    }

    #[test]
    fn get_job_round_trips_status() {
        let (store, _dir) = test_store();
        let mut job = test_job("job-2");
        job.transition_to(JobStatus::Running).unwrap();
        store.upsert_job(&job).unwrap();

        let fetched = store.get_job("job-2").unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Running);
        assert_eq!(fetched.source_lang, "ja");
    }

    #[test]
    fn deleting_job_cascades_to_checkpoints() {
        let (store, _dir) = test_store();
        let job = test_job("job-3");
        store.upsert_job(&job).unwrap();
        store.write_checkpoint("job-3", 0, "x").unwrap();

        assert!(store.delete_job("job-3").unwrap());
        let checkpoints = store.checkpoints_for_job("job-3").unwrap();
        assert!(checkpoints.is_empty());
    }

    #[test]
    fn unknown_job_returns_none() {
        let (store, _dir) = test_store();
        assert!(store.get_job("nonexistent").unwrap().is_none());
    }

    #[test]
    fn list_job_ids_returns_all_jobs() {
        let (store, _dir) = test_store();
        store.upsert_job(&test_job("a")).unwrap();
        store.upsert_job(&test_job("b")).unwrap();
        let ids = store.list_job_ids().unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn rewriting_same_chunk_index_overwrites_not_duplicates() {
        let (store, _dir) = test_store();
        let job = test_job("job-4");
        store.upsert_job(&job).unwrap();
        store.write_checkpoint("job-4", 0, "first").unwrap();
        store.write_checkpoint("job-4", 0, "second").unwrap();

        let checkpoints = store.checkpoints_for_job("job-4").unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].translated_text, "second");
    }
}
