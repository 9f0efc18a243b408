//! Builds the prompt for one chunk, calls the Provider Client, validates the
//! reply, retries per policy, and applies the placeholder decode. Never
//! throws: exhausted retries surface as a `TranslatedChunk` with
//! `status = Failed`, leaving the Orchestrator to decide whether the job
//! aborts.

use std::time::Duration;

use crate::config::ResilienceConfig;
use crate::error::{EngineError, ErrorKind, Result};
use crate::model::{Chunk, ChunkKind, ChunkStatus, PromptOptions};
use crate::placeholder::{self, DecodeOutcome};
use crate::provider::{ProviderClient, ProviderRequest};
use crate::resilience::{CircuitBreaker, RateLimiter};

/// Callback for sub-chunk progress narration (retry attempts, placeholder
/// correction rounds, refine pass) that the orchestrator forwards onto the
/// event bus as `ChunkProgress`. `None` when nobody is subscribed.
pub type ProgressFn<'a> = &'a (dyn Fn(String) + Send + Sync);

fn report(on_progress: Option<ProgressFn<'_>>, message: impl FnOnce() -> String) {
    if let Some(f) = on_progress {
        f(message());
    }
}

/// Context injected from the orchestrator's K-previous-chunk ring buffer, used
/// as in-context examples to keep terminology consistent across a sequential
/// job.
#[derive(Debug, Clone)]
pub struct JobContext<'a> {
    pub source_lang: &'a str,
    pub target_lang: &'a str,
    pub prompt_options: &'a PromptOptions,
    pub max_attempts: u32,
    pub max_placeholder_correction_attempts: u32,
    /// (source, translation) pairs of the last K completed chunks.
    pub previous_pairs: &'a [(String, String)],
}

#[derive(Debug, Clone)]
pub struct TranslatedChunk {
    pub index: u64,
    pub status: ChunkStatus,
    pub translated_text: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Translate one chunk end to end: placeholder encode (EPUB only), provider
/// call with retry, validation, placeholder decode with fallback, optional
/// refine pass.
pub async fn translate_chunk(
    client: &ProviderClient,
    chunk: &mut Chunk,
    ctx: &JobContext<'_>,
    resilience: &ResilienceConfig,
    cb: &CircuitBreaker,
    rl: &RateLimiter,
    on_progress: Option<ProgressFn<'_>>,
) -> TranslatedChunk {
    let (prompt_source, placeholder_map) = if chunk.kind == ChunkKind::EpubFragment {
        match placeholder::encode(&chunk.source_text) {
            Ok((encoded, map)) => (encoded, Some(map)),
            Err(e) => {
                return TranslatedChunk {
                    index: chunk.index,
                    status: ChunkStatus::Failed,
                    translated_text: None,
                    error_kind: Some(e.kind()),
                    tokens_in: 0,
                    tokens_out: 0,
                }
            }
        }
    } else {
        (chunk.source_text.clone(), None)
    };
    chunk.placeholder_map = placeholder_map.clone();

    let system = build_system_prompt(ctx, chunk.kind);
    let user = build_user_prompt(ctx, &prompt_source);

    let request = ProviderRequest {
        system: system.clone(),
        user,
        max_tokens: 2048,
        stop: vec![],
        provenance_headers: vec![
            ("X-Engine".to_string(), "longform-translate".to_string()),
            (
                "X-Session-Id".to_string(),
                ctx.prompt_options.session_id.clone().unwrap_or_default(),
            ),
        ],
    };

    let mut result = match call_with_retry(client, &request, ctx.max_attempts, resilience, cb, rl, on_progress).await {
        Ok(response) => response,
        Err(e) => {
            return TranslatedChunk {
                index: chunk.index,
                status: ChunkStatus::Failed,
                translated_text: None,
                error_kind: Some(e.kind()),
                tokens_in: 0,
                tokens_out: 0,
            }
        }
    };

    if let Err(e) = validate_response(&result.text, &system) {
        return TranslatedChunk {
            index: chunk.index,
            status: ChunkStatus::Failed,
            translated_text: None,
            error_kind: Some(e.kind()),
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
        };
    }

    let mut final_text = result.text.clone();
    if let Some(map) = &placeholder_map {
        final_text = resolve_placeholders(
            client, &system, &prompt_source, &result.text, map, ctx, resilience, cb, rl, on_progress,
        )
        .await;
    }

    let mut total_tokens_in = result.tokens_in;
    let mut total_tokens_out = result.tokens_out;

    if ctx.prompt_options.refine {
        report(on_progress, || "running refine pass".to_string());
        if let Ok(refined) = run_refine_pass(client, ctx, &prompt_source, &final_text, resilience, cb, rl, on_progress).await {
            total_tokens_in += refined.tokens_in;
            total_tokens_out += refined.tokens_out;
            final_text = refined.text;
        }
    }

    result.text = final_text;
    TranslatedChunk {
        index: chunk.index,
        status: ChunkStatus::Completed,
        translated_text: Some(result.text),
        error_kind: None,
        tokens_in: total_tokens_in,
        tokens_out: total_tokens_out,
    }
}

fn build_system_prompt(ctx: &JobContext<'_>, kind: ChunkKind) -> String {
    let mut prompt = format!(
        "You are a professional translator. Translate the user's text from {} to {}. \
         Preserve meaning, tone, and register. Output only the translation, with no \
         commentary, preamble, or quotation marks around the result.",
        ctx.source_lang, ctx.target_lang
    );

    if kind == ChunkKind::EpubFragment {
        prompt.push_str(
            " The text contains opaque placeholder tokens of the form \u{27e6}TAGnn\u{27e7}. \
             You must reproduce every token exactly, in the same relative position, \
             without translating, renaming, or dropping any of them.",
        );
    }

    if ctx.prompt_options.text_cleanup {
        prompt.push_str(
            " Before translating, silently correct OCR artefacts in the source: \
             rejoin broken lines, remove stray hyphenation, and normalize typographic quotes.",
        );
    }

    if let Some(custom) = &ctx.prompt_options.custom_instructions {
        prompt.push(' ');
        prompt.push_str(custom);
    }

    prompt
}

fn build_user_prompt(ctx: &JobContext<'_>, source_text: &str) -> String {
    let mut user = String::new();
    for (source, translation) in ctx.previous_pairs {
        user.push_str("Example source:\n");
        user.push_str(source);
        user.push_str("\n\nExample translation:\n");
        user.push_str(translation);
        user.push_str("\n\n---\n\n");
    }
    user.push_str("Translate:\n");
    user.push_str(source_text);
    user
}

/// Non-empty, no stray system-prompt leakage. EPUB placeholder-token parity is
/// checked separately in `resolve_placeholders` since a partial mismatch still
/// routes through the fallback protocol rather than failing the chunk.
fn validate_response(text: &str, system_prompt: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(EngineError::ProviderBadResponse("empty translation".into()));
    }
    if text.len() > 200 && system_prompt.len() > 40 && text.contains(&system_prompt[..40]) {
        return Err(EngineError::ProviderBadResponse(
            "reply appears to echo the system prompt verbatim".into(),
        ));
    }
    Ok(())
}

/// Retry policy: per-chunk exponential backoff with jitter over transient
/// failures, bounded by `max_attempts`. Non-transient failures abort after one
/// attempt. Circuit breaker and rate limiter are shared across chunks within
/// a job.
async fn call_with_retry(
    client: &ProviderClient,
    request: &ProviderRequest,
    max_attempts: u32,
    resilience: &ResilienceConfig,
    cb: &CircuitBreaker,
    rl: &RateLimiter,
    on_progress: Option<ProgressFn<'_>>,
) -> Result<crate::provider::ProviderResponse> {
    if !cb.allow_request() {
        return Err(EngineError::ProviderUnreachable(
            "circuit breaker open".into(),
        ));
    }

    let mut last_error = None;

    for attempt in 0..max_attempts.max(1) {
        rl.wait_if_needed().await;

        match client.call(request).await {
            Ok(response) => {
                cb.record_success();
                rl.record_success();
                return Ok(response);
            }
            Err(e) => {
                if let Some(retry_after) = e.retry_after_secs() {
                    rl.record_rate_limit(Some(retry_after));
                } else if e.kind() == ErrorKind::ProviderRateLimited {
                    rl.record_rate_limit(None);
                }

                let retryable = e.is_retryable();
                if !retryable || attempt + 1 == max_attempts.max(1) {
                    cb.record_failure();
                    return Err(e);
                }

                last_error = Some(e);
                let base_delay = resilience.retry_base_delay_ms * (1u64 << attempt);
                let jitter = fastrand::u64(0..100);
                report(on_progress, || {
                    format!("retrying after transient error (attempt {} of {})", attempt + 2, max_attempts.max(1))
                });
                tokio::time::sleep(Duration::from_millis(base_delay + jitter)).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| EngineError::ChunkExhausted { chunk_index: 0, attempts: max_attempts }))
}

/// Run the three-stage placeholder fallback protocol: ask-again, then
/// format-detect, then proportional distribution, per the codec's fallback
/// contract. The first clean or format-detected decode short-circuits.
#[allow(clippy::too_many_arguments)]
async fn resolve_placeholders(
    client: &ProviderClient,
    system: &str,
    source_text: &str,
    first_reply: &str,
    map: &crate::placeholder::PlaceholderMap,
    ctx: &JobContext<'_>,
    resilience: &ResilienceConfig,
    cb: &CircuitBreaker,
    rl: &RateLimiter,
    on_progress: Option<ProgressFn<'_>>,
) -> String {
    let (restored, outcome) = placeholder::decode(first_reply, map);
    if outcome != DecodeOutcome::ProportionalFallback {
        return restored;
    }

    // Ask-again: re-prompt with the original + defective reply, bounded by
    // max_placeholder_correction_attempts.
    let mut reply = first_reply.to_string();
    for round in 0..ctx.max_placeholder_correction_attempts {
        report(on_progress, || {
            format!("correcting placeholder tokens (round {} of {})", round + 1, ctx.max_placeholder_correction_attempts)
        });
        let correction_prompt = format!(
            "Your previous translation dropped or altered the placeholder tokens. \
             Original source:\n{source_text}\n\nYour reply:\n{reply}\n\n\
             Re-emit the full translation, reproducing every \u{27e6}TAGnn\u{27e7} token exactly."
        );
        let request = ProviderRequest {
            system: system.to_string(),
            user: correction_prompt,
            max_tokens: 2048,
            stop: vec![],
            provenance_headers: vec![],
        };
        match call_with_retry(client, &request, 1, resilience, cb, rl, on_progress).await {
            Ok(response) => {
                let (restored, outcome) = placeholder::decode(&response.text, map);
                if outcome != DecodeOutcome::ProportionalFallback {
                    return restored;
                }
                reply = response.text;
            }
            Err(_) => break,
        }
    }

    // Format-detect and proportional fallback both live inside `decode`; this
    // final call returns whichever of the two applies to the latest reply.
    placeholder::decode(&reply, map).0
}

/// Second pass where the model receives (source, first_translation) and
/// produces a polished version. Token counts from this call are summed into
/// `JobStats` alongside the primary pass (see the open-question decision
/// recorded in the design ledger).
async fn run_refine_pass(
    client: &ProviderClient,
    ctx: &JobContext<'_>,
    source_text: &str,
    first_translation: &str,
    resilience: &ResilienceConfig,
    cb: &CircuitBreaker,
    rl: &RateLimiter,
    on_progress: Option<ProgressFn<'_>>,
) -> Result<crate::provider::ProviderResponse> {
    let system = format!(
        "You are a professional editor polishing a translation from {} to {}. \
         Improve fluency and naturalness without changing meaning. Output only the \
         polished translation.",
        ctx.source_lang, ctx.target_lang
    );
    let user = format!(
        "Source:\n{source_text}\n\nFirst-pass translation:\n{first_translation}\n\n\
         Provide the polished version."
    );
    let request = ProviderRequest {
        system,
        user,
        max_tokens: 2048,
        stop: vec![],
        provenance_headers: vec![],
    };
    call_with_retry(client, &request, ctx.max_attempts, resilience, cb, rl, on_progress).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_response_rejects_empty() {
        assert!(validate_response("", "system prompt").is_err());
        assert!(validate_response("   ", "system").is_err());
    }

    #[test]
    fn validate_response_accepts_normal_translation() {
        assert!(validate_response("Bonjour le monde", "translate this").is_ok());
    }

    #[test]
    fn build_system_prompt_mentions_epub_tokens_only_for_epub_kind() {
        let opts = PromptOptions::default();
        let ctx = JobContext {
            source_lang: "en",
            target_lang: "fr",
            prompt_options: &opts,
            max_attempts: 2,
            max_placeholder_correction_attempts: 3,
            previous_pairs: &[],
        };
        let text_prompt = build_system_prompt(&ctx, ChunkKind::Text);
        let epub_prompt = build_system_prompt(&ctx, ChunkKind::EpubFragment);
        assert!(!text_prompt.contains("TAGnn"));
        assert!(epub_prompt.contains("TAGnn"));
    }

    #[test]
    fn build_user_prompt_includes_context_pairs() {
        let opts = PromptOptions::default();
        let pairs = vec![("Hello".to_string(), "Bonjour".to_string())];
        let ctx = JobContext {
            source_lang: "en",
            target_lang: "fr",
            prompt_options: &opts,
            max_attempts: 2,
            max_placeholder_correction_attempts: 3,
            previous_pairs: &pairs,
        };
        let prompt = build_user_prompt(&ctx, "World");
        assert!(prompt.contains("Hello"));
        assert!(prompt.contains("Bonjour"));
        assert!(prompt.contains("World"));
    }
}
