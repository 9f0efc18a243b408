use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const CONFIG_FILENAME: &str = ".longform-translate.json";

/// Engine-wide configuration, loaded from an optional JSON file and overridden
/// by the environment variables enumerated in the configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Token budget `B` for the chunker.
    #[serde(default = "default_max_tokens_per_chunk")]
    pub max_tokens_per_chunk: u32,

    /// Per-HTTP-call timeout, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries per chunk for transient provider failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Ask-again attempts for the placeholder fallback protocol.
    #[serde(default = "default_max_placeholder_correction_attempts")]
    pub max_placeholder_correction_attempts: u32,

    /// Previous completed chunks injected as in-context examples.
    #[serde(default = "default_context_chunks_k")]
    pub context_chunks_k: u32,

    #[serde(default = "default_source_language")]
    pub default_source_language: String,

    #[serde(default = "default_target_language")]
    pub default_target_language: String,

    #[serde(default)]
    pub llm_provider: Option<String>,

    #[serde(default)]
    pub api_endpoint: Option<String>,

    #[serde(default)]
    pub default_model: Option<String>,

    /// Whether to add attribution metadata to output artifacts.
    #[serde(default)]
    pub signature_enabled: bool,

    #[serde(default = "default_checkpoint_db_path")]
    pub checkpoint_db_path: PathBuf,

    #[serde(default)]
    pub resilience: ResilienceConfig,
}

/// Resilience configuration for retry, timeout, and circuit breaker behavior —
/// an ambient companion to the provider and chunking knobs above.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceConfig {
    /// Circuit breaker failure threshold before opening (default: 5).
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// Circuit breaker reset timeout in seconds (default: 60).
    #[serde(default = "default_circuit_breaker_reset_secs")]
    pub circuit_breaker_reset_secs: u64,

    /// Base delay for exponential backoff in milliseconds (default: 200).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper cap on backoff delay, in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

const DEFAULT_MAX_TOKENS_PER_CHUNK: u32 = 400;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 900;
const DEFAULT_MAX_ATTEMPTS: u32 = 2;
const DEFAULT_MAX_PLACEHOLDER_CORRECTION_ATTEMPTS: u32 = 3;
const DEFAULT_CONTEXT_CHUNKS_K: u32 = 1;
const DEFAULT_SOURCE_LANGUAGE: &str = "auto";
const DEFAULT_TARGET_LANGUAGE: &str = "en";
const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
const DEFAULT_CIRCUIT_BREAKER_RESET_SECS: u64 = 60;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

fn default_max_tokens_per_chunk() -> u32 {
    DEFAULT_MAX_TOKENS_PER_CHUNK
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_max_placeholder_correction_attempts() -> u32 {
    DEFAULT_MAX_PLACEHOLDER_CORRECTION_ATTEMPTS
}
fn default_context_chunks_k() -> u32 {
    DEFAULT_CONTEXT_CHUNKS_K
}
fn default_source_language() -> String {
    DEFAULT_SOURCE_LANGUAGE.into()
}
fn default_target_language() -> String {
    DEFAULT_TARGET_LANGUAGE.into()
}
fn default_checkpoint_db_path() -> PathBuf {
    PathBuf::from("./translation_checkpoints.db")
}
fn default_circuit_breaker_threshold() -> u32 {
    DEFAULT_CIRCUIT_BREAKER_THRESHOLD
}
fn default_circuit_breaker_reset_secs() -> u64 {
    DEFAULT_CIRCUIT_BREAKER_RESET_SECS
}
fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
            circuit_breaker_reset_secs: DEFAULT_CIRCUIT_BREAKER_RESET_SECS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: DEFAULT_MAX_TOKENS_PER_CHUNK,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_placeholder_correction_attempts: DEFAULT_MAX_PLACEHOLDER_CORRECTION_ATTEMPTS,
            context_chunks_k: DEFAULT_CONTEXT_CHUNKS_K,
            default_source_language: DEFAULT_SOURCE_LANGUAGE.into(),
            default_target_language: DEFAULT_TARGET_LANGUAGE.into(),
            llm_provider: None,
            api_endpoint: None,
            default_model: None,
            signature_enabled: false,
            checkpoint_db_path: default_checkpoint_db_path(),
            resilience: ResilienceConfig::default(),
        }
    }
}

/// Load configuration from file, applying environment variable overrides.
pub fn load_config() -> Config {
    let mut config: Config = find_config_file()
        .and_then(|path| {
            let content = std::fs::read_to_string(&path).ok()?;
            match serde_json::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "config parse error, using defaults");
                    None
                }
            }
        })
        .unwrap_or_default();

    if let Ok(val) = std::env::var("MAX_TOKENS_PER_CHUNK") {
        if let Ok(v) = val.parse() {
            config.max_tokens_per_chunk = v;
        }
    }
    if let Ok(val) = std::env::var("REQUEST_TIMEOUT") {
        if let Ok(v) = val.parse() {
            config.request_timeout_secs = v;
        }
    }
    if let Ok(val) = std::env::var("MAX_ATTEMPTS") {
        if let Ok(v) = val.parse() {
            config.max_attempts = v;
        }
    }
    if let Ok(val) = std::env::var("MAX_PLACEHOLDER_CORRECTION_ATTEMPTS") {
        if let Ok(v) = val.parse() {
            config.max_placeholder_correction_attempts = v;
        }
    }
    if let Ok(val) = std::env::var("CONTEXT_CHUNKS_K") {
        if let Ok(v) = val.parse() {
            config.context_chunks_k = v;
        }
    }
    if let Ok(val) = std::env::var("DEFAULT_SOURCE_LANGUAGE") {
        config.default_source_language = val;
    }
    if let Ok(val) = std::env::var("DEFAULT_TARGET_LANGUAGE") {
        config.default_target_language = val;
    }
    if let Ok(val) = std::env::var("LLM_PROVIDER") {
        config.llm_provider = Some(val);
    }
    if let Ok(val) = std::env::var("API_ENDPOINT") {
        config.api_endpoint = Some(val);
    }
    if let Ok(val) = std::env::var("DEFAULT_MODEL") {
        config.default_model = Some(val);
    }
    if let Ok(val) = std::env::var("SIGNATURE_ENABLED") {
        config.signature_enabled = val.to_lowercase() == "true" || val == "1";
    }
    if let Ok(val) = std::env::var("CHECKPOINT_DB_PATH") {
        config.checkpoint_db_path = PathBuf::from(val);
    }

    config
}

/// Search for config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    let search_paths = [
        std::env::current_dir().ok(),
        dirs::home_dir(),
        dirs::config_dir().map(|p| p.join("longform-translate")),
    ];

    for base in search_paths.into_iter().flatten() {
        let config_path = base.join(CONFIG_FILENAME);
        if config_path.exists() {
            return Some(config_path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.max_tokens_per_chunk, 400);
        assert_eq!(config.request_timeout_secs, 900);
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.max_placeholder_correction_attempts, 3);
        assert_eq!(config.context_chunks_k, 1);
        assert_eq!(config.default_target_language, "en");
        assert!(!config.signature_enabled);
    }

    #[test]
    fn deserialize_partial_uses_defaults() {
        let json = r#"{"maxTokensPerChunk": 800}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_tokens_per_chunk, 800);
        assert_eq!(config.max_attempts, 2);
    }

    #[test]
    fn resilience_config_defaults() {
        let config = ResilienceConfig::default();
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.circuit_breaker_reset_secs, 60);
        assert_eq!(config.retry_base_delay_ms, 200);
        assert_eq!(config.max_delay_ms, 30_000);
    }

    #[test]
    fn resilience_partial_override() {
        let json = r#"{"maxDelayMs": 5000}"#;
        let config: ResilienceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_delay_ms, 5000);
        assert_eq!(config.retry_base_delay_ms, 200);
    }
}
