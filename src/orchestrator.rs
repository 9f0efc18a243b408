//! Job Orchestrator: owns one `TranslationJob`'s lifecycle from submission
//! through a terminal state. Chunks within a job run strictly sequentially in
//! ascending index order so the previous translated chunk can be injected as
//! in-context example text; multiple jobs run concurrently as independent
//! `tokio::task`s with otherwise independent state.
//!
//! The checkpoint store's `jobs` row is the durable source of truth for a
//! job's status; the in-memory `JobHandle` map only tracks jobs this process
//! is actively driving, so it can offer cancellation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use crate::checkpoint::CheckpointStore;
use crate::chunk_translator::{self, JobContext};
use crate::chunker::Chunker;
use crate::codec;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::model::{
    ChunkStatus, ChunkingConfig, JobId, JobStats, JobStatus, PromptOptions, TranslationJob,
};
use crate::provider::{ProviderClient, ProviderConfig};
use crate::resilience::{CircuitBreaker, RateLimiter};

/// One event published by a running job. Within one job, events are emitted
/// in strictly ascending `chunk_index` order; no ordering is guaranteed
/// across jobs. The bus is bounded and lossy-on-slow-subscriber: the
/// checkpoint store, not the bus, is authoritative.
#[derive(Debug, Clone)]
pub struct Event {
    pub job_id: JobId,
    pub chunk_index: Option<u64>,
    pub timestamp: chrono::DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    ChunkStarted,
    ChunkProgress(String),
    ChunkCompleted,
    ChunkFailed { error_kind: String },
    JobCompleted,
    JobFailed { error: String },
    JobInterrupted,
    CheckpointWritten,
}

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub stats: JobStats,
    pub last_error: Option<String>,
}

/// Per-job runtime handle. Only jobs this process is actively driving have
/// one; a cooperative cancel flag is checked before dispatching each chunk,
/// never mid-HTTP-call, so an in-flight request always completes and its
/// checkpoint is never lost.
struct JobHandle {
    cancel_requested: AtomicBool,
}

pub struct Orchestrator {
    store: CheckpointStore,
    events_tx: broadcast::Sender<Event>,
    active: Mutex<HashMap<JobId, Arc<JobHandle>>>,
}

impl Orchestrator {
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let store = CheckpointStore::open(&config.checkpoint_db_path)?;
        let (events_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Ok(Arc::new(Self {
            store,
            events_tx,
            active: Mutex::new(HashMap::new()),
        }))
    }

    /// Subscribe to the progress event bus. Capacity is bounded; a slow
    /// subscriber silently drops the oldest unread events rather than
    /// blocking publishers.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Submit a new document for translation. Returns the job id immediately;
    /// the translation proceeds on a background task.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit(
        self: &Arc<Self>,
        input_path: String,
        output_path: String,
        source_lang: String,
        target_lang: String,
        provider_config: ProviderConfig,
        chunking_config: ChunkingConfig,
        prompt_options: PromptOptions,
    ) -> Result<JobId> {
        let job_id = generate_job_id();
        let job = TranslationJob::new(
            job_id.clone(),
            input_path,
            output_path,
            source_lang,
            target_lang,
            provider_config,
            chunking_config,
            prompt_options,
        );
        self.store.upsert_job(&job)?;
        self.spawn_run(job, 0).await;
        Ok(job_id)
    }

    /// Current status of a job, read from the checkpoint store (the
    /// authoritative record) rather than any in-memory state.
    pub fn status(&self, job_id: &str) -> Result<Option<JobStatusView>> {
        let job = self.store.get_job(job_id)?;
        Ok(job.map(|j| JobStatusView {
            status: j.status,
            stats: j.stats,
            last_error: j.last_error,
        }))
    }

    /// Request cooperative cancellation of a job this process is driving.
    /// The in-flight chunk is allowed to finish so its checkpoint is not
    /// lost; the job transitions to `interrupted` once it returns.
    pub async fn interrupt(&self, job_id: &str) -> Result<()> {
        let active = self.active.lock().await;
        match active.get(job_id) {
            Some(handle) => {
                handle.cancel_requested.store(true, Ordering::Release);
                Ok(())
            }
            None => Err(EngineError::InputInvalid(format!(
                "job {job_id} is not actively running in this process"
            ))),
        }
    }

    /// Resume a job whose `job_id` already has a row in the checkpoint store.
    /// A completed job is a no-op that re-emits the output artifact with zero
    /// Provider Client calls; an interrupted or errored job restarts the
    /// sequential loop from the first index lacking a checkpoint.
    pub async fn resume(self: &Arc<Self>, job_id: &str) -> Result<()> {
        let Some(mut job) = self.store.get_job(job_id)? else {
            return Err(EngineError::InputInvalid(format!("unknown job {job_id}")));
        };

        if job.status == JobStatus::Running {
            return Err(EngineError::InputInvalid(format!(
                "job {job_id} is already running"
            )));
        }

        if job.status == JobStatus::Completed {
            self.reemit_completed(&job)?;
            return Ok(());
        }

        let checkpoints = self.store.checkpoints_for_job(job_id)?;
        let resume_from = checkpoints.len() as u64;

        if job.status != JobStatus::Queued {
            job.transition_to(JobStatus::Queued)?;
            self.store.upsert_job(&job)?;
        }
        self.spawn_run(job, resume_from).await;
        Ok(())
    }

    /// Jobs whose persisted status is `queued` or `running` — the canonical,
    /// cross-process notion of "active" per the checkpoint store's authority.
    pub fn list_active(&self) -> Result<Vec<JobId>> {
        let mut out = Vec::new();
        for id in self.store.list_job_ids()? {
            if let Some(job) = self.store.get_job(&id)? {
                if matches!(job.status, JobStatus::Queued | JobStatus::Running) {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    /// Re-run the document codec's reassembly step from persisted checkpoints
    /// without making any Provider Client calls, for the no-op-completed-job
    /// resume path.
    fn reemit_completed(&self, job: &TranslationJob) -> Result<()> {
        let parsed = codec::read(std::path::Path::new(&job.input_path))?;
        let checkpoints = self.store.checkpoints_for_job(&job.job_id)?;
        let translated: Vec<String> = checkpoints.into_iter().map(|c| c.translated_text).collect();
        codec::write(
            std::path::Path::new(&job.output_path),
            &parsed.origin,
            &translated,
        )
    }

    async fn spawn_run(self: &Arc<Self>, job: TranslationJob, resume_from: u64) {
        let handle = Arc::new(JobHandle {
            cancel_requested: AtomicBool::new(false),
        });
        self.active
            .lock()
            .await
            .insert(job.job_id.clone(), handle.clone());

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_job(job, resume_from, handle).await;
        });
    }

    fn publish(&self, job_id: &str, chunk_index: Option<u64>, kind: EventKind) {
        let _ = self.events_tx.send(Event {
            job_id: job_id.to_string(),
            chunk_index,
            timestamp: Utc::now(),
            kind,
        });
    }

    async fn run_job(self: Arc<Self>, mut job: TranslationJob, resume_from: u64, handle: Arc<JobHandle>) {
        let job_id = job.job_id.clone();
        let result = self.drive_job(&mut job, resume_from, &handle).await;

        self.active.lock().await.remove(&job_id);

        match result {
            Ok(JobOutcome::Completed) => {
                let _ = job.transition_to(JobStatus::Completed);
                let _ = self.store.upsert_job(&job);
                self.publish(&job_id, None, EventKind::JobCompleted);
            }
            Ok(JobOutcome::Interrupted) => {
                let _ = job.transition_to(JobStatus::Interrupted);
                let _ = self.store.upsert_job(&job);
                self.publish(&job_id, None, EventKind::JobInterrupted);
            }
            Err(e) => {
                job.last_error = Some(e.to_string());
                let _ = job.transition_to(JobStatus::Error);
                let _ = self.store.upsert_job(&job);
                self.publish(&job_id, None, EventKind::JobFailed { error: e.to_string() });
            }
        }
    }

    /// The sequential per-job chunk loop. Returns `Ok` with the terminal
    /// outcome on a clean stop (completed or cooperative interrupt), or `Err`
    /// when a chunk is job-fatal (`chunk_exhausted` / `placeholder_mismatch`,
    /// or any chunk failure — the chunk translator has already exhausted its
    /// own retries by the time it reports `Failed`).
    async fn drive_job(
        &self,
        job: &mut TranslationJob,
        resume_from: u64,
        handle: &JobHandle,
    ) -> Result<JobOutcome> {
        job.transition_to(JobStatus::Running)?;
        self.store.upsert_job(job)?;

        let parsed = codec::read(std::path::Path::new(&job.input_path))?;
        let chunk_kind = parsed.origin.chunk_kind();
        let chunker = Chunker::new(&job.chunking_config);
        let (mut chunks, chunker_stats) = chunker.chunk_units(&parsed.units, chunk_kind);
        job.stats.total_chunks = chunks.len() as u64;
        tracing::info!(
            job_id = %job.job_id,
            total_chunks = job.stats.total_chunks,
            avg_size = chunker_stats.avg_size,
            oversized = chunker_stats.oversized_count,
            "chunked document"
        );

        if chunks.is_empty() {
            codec::write(std::path::Path::new(&job.output_path), &parsed.origin, &[])?;
            return Ok(JobOutcome::Completed);
        }

        let runtime_config = crate::config::load_config();
        let context_k = runtime_config.context_chunks_k;

        let checkpoints = self.store.checkpoints_for_job(&job.job_id)?;
        // `get_job` already restored `completed_chunks`/`failed_chunks` from
        // the persisted stats_json; the reload below is the single source of
        // truth for how many chunks are actually checkpointed, so reset both
        // counters first rather than double-counting on top of the restore.
        job.stats.completed_chunks = 0;
        job.stats.failed_chunks = 0;
        let mut context_buffer: VecDeque<(String, String)> = VecDeque::new();
        for checkpoint in &checkpoints {
            if let Some(chunk) = chunks.get_mut(checkpoint.chunk_index as usize) {
                chunk.complete_with(checkpoint.translated_text.clone());
                job.stats.completed_chunks += 1;
                push_context(
                    &mut context_buffer,
                    chunk.source_text.clone(),
                    checkpoint.translated_text.clone(),
                    context_k,
                );
            }
        }

        let client = ProviderClient::new(job.provider_config.clone())?;
        let circuit_breaker = CircuitBreaker::new(&runtime_config.resilience);
        let rate_limiter = RateLimiter::new();
        let max_attempts = runtime_config.max_attempts;
        let max_placeholder_correction_attempts = runtime_config.max_placeholder_correction_attempts;

        for index in resume_from..chunks.len() as u64 {
            if handle.cancel_requested.load(Ordering::Acquire) {
                return Ok(JobOutcome::Interrupted);
            }

            let idx = index as usize;
            self.publish(&job.job_id, Some(index), EventKind::ChunkStarted);

            let previous_pairs: Vec<(String, String)> = context_buffer.iter().cloned().collect();
            let ctx = JobContext {
                source_lang: &job.source_lang,
                target_lang: &job.target_lang,
                prompt_options: &job.prompt_options,
                max_attempts,
                max_placeholder_correction_attempts,
                previous_pairs: &previous_pairs,
            };

            let progress_job_id = job.job_id.clone();
            let on_progress = |message: String| {
                self.publish(&progress_job_id, Some(index), EventKind::ChunkProgress(message));
            };

            let translated = chunk_translator::translate_chunk(
                &client,
                &mut chunks[idx],
                &ctx,
                &runtime_config.resilience,
                &circuit_breaker,
                &rate_limiter,
                Some(&on_progress),
            )
            .await;

            match translated.status {
                ChunkStatus::Completed => {
                    let text = translated.translated_text.unwrap_or_default();
                    chunks[idx].complete_with(text.clone());
                    job.stats.completed_chunks += 1;
                    job.stats.tokens_in += translated.tokens_in;
                    job.stats.tokens_out += translated.tokens_out;

                    // Write the checkpoint before publishing progress, and
                    // before the next chunk begins: the worst-case lost work
                    // on an abrupt stop is one in-flight chunk.
                    self.store
                        .write_checkpoint(&job.job_id, index, &text)?;
                    self.publish(&job.job_id, Some(index), EventKind::CheckpointWritten);
                    self.store.upsert_job(job)?;
                    self.publish(&job.job_id, Some(index), EventKind::ChunkCompleted);

                    push_context(
                        &mut context_buffer,
                        chunks[idx].source_text.clone(),
                        text,
                        context_k,
                    );
                }
                ChunkStatus::Failed => {
                    // A cancel requested while this chunk was retrying still
                    // resolves to interrupted, not failed: the chunk translator
                    // only reports Failed after exhausting its own retries, by
                    // which point the job may already have been asked to stop.
                    if handle.cancel_requested.load(Ordering::Acquire) {
                        return Ok(JobOutcome::Interrupted);
                    }
                    job.stats.failed_chunks += 1;
                    let kind = translated
                        .error_kind
                        .map(|k| k.as_str().to_string())
                        .unwrap_or_else(|| "chunk_exhausted".to_string());
                    self.publish(
                        &job.job_id,
                        Some(index),
                        EventKind::ChunkFailed {
                            error_kind: kind.clone(),
                        },
                    );
                    return Err(EngineError::ChunkExhausted {
                        chunk_index: index,
                        attempts: max_attempts,
                    });
                }
                _ => unreachable!("translate_chunk only returns Completed or Failed"),
            }
        }

        let translated_texts: Vec<String> = chunks
            .iter()
            .map(|c| c.translated_text.clone().unwrap_or_default())
            .collect();
        codec::write(
            std::path::Path::new(&job.output_path),
            &parsed.origin,
            &translated_texts,
        )?;

        Ok(JobOutcome::Completed)
    }
}

enum JobOutcome {
    Completed,
    Interrupted,
}

/// Push a freshly completed (source, translation) pair into the ring buffer,
/// evicting the oldest entry once it exceeds `k`.
fn push_context(buffer: &mut VecDeque<(String, String)>, source: String, translation: String, k: u32) {
    if k == 0 {
        return;
    }
    buffer.push_back((source, translation));
    while buffer.len() > k as usize {
        buffer.pop_front();
    }
}

fn generate_job_id() -> JobId {
    let bytes: [u8; 16] = std::array::from_fn(|_| fastrand::u8(..));
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("job-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.checkpoint_db_path = dir.path().join("checkpoints.db");
        config
    }

    fn stub_provider(scenario: &str) -> ProviderConfig {
        ProviderConfig {
            kind: ProviderKind::Stub,
            endpoint: format!("stub://{scenario}"),
            api_key: None,
            model: "test-model".into(),
            timeout_secs: 30,
            context_window_hint: None,
            extra_headers: vec![],
        }
    }

    fn write_input(dir: &TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn wait_for_terminal(orchestrator: &Arc<Orchestrator>, job_id: &str) -> JobStatusView {
        for _ in 0..200 {
            if let Some(view) = orchestrator.status(job_id).unwrap() {
                if matches!(
                    view.status,
                    JobStatus::Completed | JobStatus::Error | JobStatus::Interrupted
                ) {
                    return view;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not reach a terminal state in time");
    }

    #[tokio::test]
    async fn small_plain_text_completes_with_one_checkpoint() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let orchestrator = Orchestrator::new(&config).unwrap();

        let input = write_input(&dir, "in.txt", "Hello.\n\nWorld.");
        let output = dir.path().join("out.txt").to_string_lossy().into_owned();

        let job_id = orchestrator
            .submit(
                input,
                output.clone(),
                "en".into(),
                "fr".into(),
                stub_provider("echo"),
                ChunkingConfig {
                    token_budget: 1000,
                    ..ChunkingConfig::default()
                },
                PromptOptions::default(),
            )
            .await
            .unwrap();

        let view = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.stats.completed_chunks, 1);

        let contents = std::fs::read_to_string(&output).unwrap();
        assert_eq!(contents, "\u{ab}Hello.\u{bb}\n\n\u{ab}World.\u{bb}");
    }

    #[tokio::test]
    async fn resuming_completed_job_makes_no_provider_calls() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let orchestrator = Orchestrator::new(&config).unwrap();

        let input = write_input(&dir, "in.txt", "Hello.");
        let output = dir.path().join("out.txt").to_string_lossy().into_owned();

        let job_id = orchestrator
            .submit(
                input,
                output.clone(),
                "en".into(),
                "fr".into(),
                stub_provider("echo"),
                ChunkingConfig {
                    token_budget: 1000,
                    ..ChunkingConfig::default()
                },
                PromptOptions::default(),
            )
            .await
            .unwrap();
        wait_for_terminal(&orchestrator, &job_id).await;

        // A fail-always scenario would surface a provider error if resume
        // called the provider again; since resume on a completed job is a
        // no-op, using it here proves zero calls were made.
        orchestrator.resume(&job_id).await.unwrap();
        let view = orchestrator.status(&job_id).unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn job_fatal_error_after_retries_exhausted_sets_error_status() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let orchestrator = Orchestrator::new(&config).unwrap();

        let input = write_input(&dir, "in.txt", "Hello.");
        let output = dir.path().join("out.txt").to_string_lossy().into_owned();

        std::env::set_var("MAX_ATTEMPTS", "2");
        let job_id = orchestrator
            .submit(
                input,
                output,
                "en".into(),
                "fr".into(),
                stub_provider("fail-times/10"),
                ChunkingConfig {
                    token_budget: 1000,
                    ..ChunkingConfig::default()
                },
                PromptOptions::default(),
            )
            .await
            .unwrap();

        let view = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(view.status, JobStatus::Error);
        assert!(view.last_error.is_some());
        std::env::remove_var("MAX_ATTEMPTS");
    }

    #[tokio::test]
    async fn empty_input_completes_immediately_with_empty_output() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let orchestrator = Orchestrator::new(&config).unwrap();

        let input = write_input(&dir, "in.txt", "");
        let output = dir.path().join("out.txt").to_string_lossy().into_owned();

        let job_id = orchestrator
            .submit(
                input,
                output.clone(),
                "en".into(),
                "fr".into(),
                stub_provider("echo"),
                ChunkingConfig::default(),
                PromptOptions::default(),
            )
            .await
            .unwrap();

        let view = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.stats.total_chunks, 0);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "");
    }

    #[tokio::test]
    async fn interrupt_lets_in_flight_chunk_finish_then_stops() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let orchestrator = Orchestrator::new(&config).unwrap();

        let input = write_input(&dir, "in.txt", "Alpha.\n\nBeta.\n\nGamma.\n\nDelta.");
        let output = dir.path().join("out.txt").to_string_lossy().into_owned();

        let job_id = orchestrator
            .submit(
                input,
                output,
                "en".into(),
                "fr".into(),
                stub_provider("slow/150"),
                ChunkingConfig {
                    token_budget: 1,
                    ..ChunkingConfig::default()
                },
                PromptOptions::default(),
            )
            .await
            .unwrap();

        // Give chunk 0 time to be dispatched but not to finish, then request
        // cancellation while it is still in flight.
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        orchestrator.interrupt(&job_id).await.unwrap();

        let view = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(view.status, JobStatus::Interrupted);
        // The in-flight chunk was allowed to complete; nothing past it was
        // dispatched, so the job stops well short of all four chunks.
        assert!(view.stats.completed_chunks >= 1);
        assert!(view.stats.completed_chunks < 4);
    }

    #[tokio::test]
    async fn interrupt_during_failing_chunk_retries_resolves_to_interrupted() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let orchestrator = Orchestrator::new(&config).unwrap();

        let input = write_input(&dir, "in.txt", "Hello.");
        let output = dir.path().join("out.txt").to_string_lossy().into_owned();

        // Always fails, so the chunk translator retries (with backoff delay
        // between attempts) until max_attempts is exhausted and reports Failed.
        std::env::set_var("MAX_ATTEMPTS", "5");
        let job_id = orchestrator
            .submit(
                input,
                output,
                "en".into(),
                "fr".into(),
                stub_provider("fail-times/1000"),
                ChunkingConfig {
                    token_budget: 1000,
                    ..ChunkingConfig::default()
                },
                PromptOptions::default(),
            )
            .await
            .unwrap();

        // Give the first attempt time to fail and enter its backoff sleep,
        // then request cancellation while the chunk is still retrying.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        orchestrator.interrupt(&job_id).await.unwrap();

        let view = wait_for_terminal(&orchestrator, &job_id).await;
        // A cancel requested mid-retry resolves to interrupted, not failed,
        // even though the chunk itself ultimately exhausts its retries.
        assert_eq!(view.status, JobStatus::Interrupted);
        std::env::remove_var("MAX_ATTEMPTS");
    }

    #[tokio::test]
    async fn resuming_an_interrupted_job_finishes_remaining_chunks_only() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let orchestrator = Orchestrator::new(&config).unwrap();

        let input = write_input(&dir, "in.txt", "Alpha.\n\nBeta.\n\nGamma.\n\nDelta.");
        let output = dir.path().join("out.txt").to_string_lossy().into_owned();

        let job_id = orchestrator
            .submit(
                input,
                output.clone(),
                "en".into(),
                "fr".into(),
                stub_provider("slow/150"),
                ChunkingConfig {
                    token_budget: 1,
                    ..ChunkingConfig::default()
                },
                PromptOptions::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        orchestrator.interrupt(&job_id).await.unwrap();
        let interrupted = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(interrupted.status, JobStatus::Interrupted);
        let completed_before_resume = interrupted.stats.completed_chunks;

        // Simulate a process restart: a fresh Orchestrator over the same
        // checkpoint database picks up the job rather than an in-memory handle.
        let restarted = Orchestrator::new(&config).unwrap();
        restarted.resume(&job_id).await.unwrap();
        let view = wait_for_terminal(&restarted, &job_id).await;

        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.stats.total_chunks, 4);
        assert_eq!(view.stats.completed_chunks, 4);
        assert!(completed_before_resume < 4);

        let contents = std::fs::read_to_string(&output).unwrap();
        assert_eq!(
            contents,
            "\u{ab}Alpha.\u{bb}\n\n\u{ab}Beta.\u{bb}\n\n\u{ab}Gamma.\u{bb}\n\n\u{ab}Delta.\u{bb}"
        );
    }

    #[tokio::test]
    async fn epub_round_trip_preserves_inline_markup_through_placeholder_restore() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let orchestrator = Orchestrator::new(&config).unwrap();

        let fixture = crate::codec::epub::EpubDocument {
            metadata: crate::codec::epub::EpubMetadata {
                title: "Fixture".into(),
                author: None,
                language: "en".into(),
            },
            chapters: vec![crate::codec::epub::EpubChapter {
                title: "Chapter 1".into(),
                units: vec!["<p>Hello <em>world</em>.</p>".to_string()],
            }],
        };
        let input = dir.path().join("book.epub");
        crate::codec::epub::write(&input, &fixture, &fixture.chapters[0].units).unwrap();
        let output = dir.path().join("book.out.epub");

        let job_id = orchestrator
            .submit(
                input.to_string_lossy().into_owned(),
                output.to_string_lossy().into_owned(),
                "en".into(),
                "fr".into(),
                stub_provider("echo"),
                ChunkingConfig {
                    token_budget: 1000,
                    ..ChunkingConfig::default()
                },
                PromptOptions::default(),
            )
            .await
            .unwrap();

        let view = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(view.status, JobStatus::Completed);

        let translated = crate::codec::epub::read(&output).unwrap();
        assert_eq!(translated.chapters.len(), 1);
        let unit = &translated.chapters[0].units[0];
        // The inline <em> element survives the tokenize/restore round trip
        // and no placeholder token leaks into the final text.
        assert!(unit.contains("<em>world</em>"));
        assert!(unit.contains("Hello"));
        assert!(!crate::placeholder::has_stray_tokens(unit));
    }

    #[tokio::test]
    async fn srt_batch_translates_all_cues_in_one_call_and_keeps_timecodes() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let orchestrator = Orchestrator::new(&config).unwrap();

        let srt = "1\n00:00:01,000 --> 00:00:02,000\nHello.\n\n\
                   2\n00:00:03,000 --> 00:00:04,000\nGoodbye.\n\n\
                   3\n00:00:05,000 --> 00:00:06,500\nSee you.\n";
        let input = write_input(&dir, "movie.srt", srt);
        let output = dir.path().join("movie.out.srt").to_string_lossy().into_owned();

        let job_id = orchestrator
            .submit(
                input,
                output.clone(),
                "en".into(),
                "fr".into(),
                stub_provider("echo"),
                ChunkingConfig {
                    token_budget: 1000,
                    ..ChunkingConfig::default()
                },
                PromptOptions::default(),
            )
            .await
            .unwrap();

        let view = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(view.status, JobStatus::Completed);
        // All three cues fit under one 1000-token budget, so the batch is one call.
        assert_eq!(view.stats.total_chunks, 1);

        let contents = std::fs::read_to_string(&output).unwrap();
        assert!(contents.contains("00:00:01,000 --> 00:00:02,000"));
        assert!(contents.contains("00:00:05,000 --> 00:00:06,500"));
        assert!(contents.contains("\u{ab}Hello.\u{bb}"));
        assert!(contents.contains("\u{ab}See you.\u{bb}"));
    }

    #[tokio::test]
    async fn list_active_excludes_completed_jobs() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let orchestrator = Orchestrator::new(&config).unwrap();

        let input = write_input(&dir, "in.txt", "Hello.");
        let output = dir.path().join("out.txt").to_string_lossy().into_owned();
        let job_id = orchestrator
            .submit(
                input,
                output,
                "en".into(),
                "fr".into(),
                stub_provider("echo"),
                ChunkingConfig::default(),
                PromptOptions::default(),
            )
            .await
            .unwrap();
        wait_for_terminal(&orchestrator, &job_id).await;

        let active = orchestrator.list_active().unwrap();
        assert!(!active.contains(&job_id));
    }
}
