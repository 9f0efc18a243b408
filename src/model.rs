//! Core data model shared by the chunker, orchestrator, and document codecs.
//!
//! Mirrors the entities in the engine's data model: a `TranslationJob` owns a
//! sequence of `Chunk`s; `JobStats` are the derived counters surfaced through
//! `status()`; `PromptOptions`/`ChunkingConfig` are the per-job knobs the
//! orchestrator threads through to the chunk translator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::placeholder::PlaceholderMap;
use crate::provider::ProviderConfig;

/// Opaque job identifier. Callers supply or receive these from `submit`.
pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Error,
    Interrupted,
}

impl JobStatus {
    /// Whether `self -> next` is a legal transition per the lifecycle invariant:
    /// `running -> queued` is forbidden, `completed`/`error` are terminal except for
    /// explicit resume out of `error`, and `interrupted` may resume to `running`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Running) => true,
            (Running, Completed) | (Running, Error) | (Running, Interrupted) => true,
            (Interrupted, Running) | (Interrupted, Queued) => true,
            (Error, Queued) => true,
            (Completed, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    EpubFragment,
    SrtBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One LLM invocation's worth of input, addressed by a stable index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u64,
    pub kind: ChunkKind,
    pub source_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder_map: Option<PlaceholderMap>,
    pub attempt_count: u32,
    pub status: ChunkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
}

impl Chunk {
    pub fn new(index: u64, kind: ChunkKind, source_text: String) -> Self {
        Self {
            index,
            kind,
            source_text,
            placeholder_map: None,
            attempt_count: 0,
            status: ChunkStatus::Pending,
            translated_text: None,
        }
    }

    /// Mark this chunk completed from a stored checkpoint or a fresh translation.
    /// Invariant: `status = Completed` implies `translated_text` is non-empty.
    pub fn complete_with(&mut self, translated_text: String) {
        debug_assert!(!translated_text.is_empty() || self.source_text.is_empty());
        self.translated_text = Some(translated_text);
        self.status = ChunkStatus::Completed;
    }
}

/// Optional prompt-shaping knobs, threaded from job submission through to the
/// chunk translator's prompt assembly step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptOptions {
    /// Fix OCR artefacts (broken lines, stray hyphens, typographic quotes) before translating.
    #[serde(default)]
    pub text_cleanup: bool,
    /// Run a second refine pass over the first translation.
    #[serde(default)]
    pub refine: bool,
    /// Free-form instruction text appended verbatim to the system prompt.
    #[serde(default)]
    pub custom_instructions: Option<String>,
    /// Engine/session identifiers sent as provenance headers, not part of the prompt text.
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingConfig {
    pub token_budget: u32,
    #[serde(default)]
    pub abbreviations: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            token_budget: 400,
            abbreviations: crate::chunker::default_abbreviations(),
        }
    }
}

/// Derived counters. `tokens_in`/`tokens_out` sum both the primary translation
/// call and, when `prompt_options.refine` is set, the refine pass — see the
/// accounting note on the refine pass in the chunk translator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub failed_chunks: u64,
    pub elapsed_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_estimate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationJob {
    pub job_id: JobId,
    pub input_path: String,
    pub output_path: String,
    pub source_lang: String,
    pub target_lang: String,
    pub provider_config: ProviderConfig,
    pub chunking_config: ChunkingConfig,
    pub prompt_options: PromptOptions,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stats: JobStats,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl TranslationJob {
    pub fn new(
        job_id: JobId,
        input_path: String,
        output_path: String,
        source_lang: String,
        target_lang: String,
        provider_config: ProviderConfig,
        chunking_config: ChunkingConfig,
        prompt_options: PromptOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            input_path,
            output_path,
            source_lang,
            target_lang,
            provider_config,
            chunking_config,
            prompt_options,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            stats: JobStats::default(),
            last_error: None,
        }
    }

    /// Apply a status transition, refusing illegal ones per the lifecycle invariant.
    pub fn transition_to(&mut self, next: JobStatus) -> Result<(), crate::error::EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::EngineError::InputInvalid(format!(
                "illegal job transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_to_queued_forbidden() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn interrupted_resumes_to_running() {
        assert!(JobStatus::Interrupted.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn completed_is_terminal_except_self() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn chunk_complete_with_sets_status() {
        let mut chunk = Chunk::new(0, ChunkKind::Text, "hello".into());
        chunk.complete_with("«hello»".into());
        assert_eq!(chunk.status, ChunkStatus::Completed);
        assert_eq!(chunk.translated_text.as_deref(), Some("«hello»"));
    }
}
