//! Uniform request/response abstraction over heterogeneous LLM HTTP APIs.
//!
//! `ProviderConfig` is a discriminated union over the supported backends;
//! dispatch is a single `match` on `kind` rather than runtime polymorphism,
//! per the design note mandating an enum over trait-object dispatch.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ollama,
    OpenAiCompatible,
    Gemini,
    OpenRouter,
    /// Deterministic in-process backend for end-to-end tests. Never built into
    /// a release binary; stays a variant on the same enum rather than a trait
    /// object per the provider polymorphism design note.
    #[cfg(test)]
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub context_window_hint: Option<u32>,
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
}

fn default_timeout_secs() -> u64 {
    900
}

/// A logical request, independent of the wire format any particular backend expects.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub stop: Vec<String>,
    /// Provenance headers (engine name, session id) — not part of the prompt text.
    pub provenance_headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_estimate: Option<f64>,
}

pub struct ProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(EngineError::Http)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Translate the logical request into the concrete HTTP call this
    /// backend variant expects, and parse the response into the uniform
    /// `ProviderResponse` shape.
    pub async fn call(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        match self.config.kind {
            ProviderKind::Ollama => self.call_ollama(request).await,
            ProviderKind::OpenAiCompatible => self.call_openai_compatible(request).await,
            ProviderKind::Gemini => self.call_gemini(request).await,
            ProviderKind::OpenRouter => self.call_openrouter(request).await,
            #[cfg(test)]
            ProviderKind::Stub => stub::respond(&self.config.endpoint, request).await,
        }
    }

    fn build_request(&self, url: &str, body: serde_json::Value, extra_provenance: &[(String, String)]) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(url).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        for (k, v) in &self.config.extra_headers {
            builder = builder.header(k, v);
        }
        for (k, v) in extra_provenance {
            builder = builder.header(k, v);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::ProviderTimeout(Duration::from_secs(self.config.timeout_secs))
            } else if e.is_connect() {
                EngineError::ProviderUnreachable(e.to_string())
            } else {
                EngineError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(EngineError::from_status(status, retry_after));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| EngineError::ProviderBadResponse(e.to_string()))
    }

    async fn call_ollama(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let url = format!("{}/api/generate", self.config.endpoint.trim_end_matches('/'));
        let prompt = format!("{}\n\n{}", request.system, request.user);
        let body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "options": { "num_predict": request.max_tokens, "stop": request.stop },
        });
        let value = self
            .send(self.build_request(&url, body, &request.provenance_headers))
            .await?;

        let text = value
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::ProviderBadResponse("missing `response` field".into()))?
            .to_string();

        let tokens_in = value.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0);
        let tokens_out = value.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0);

        Ok(ProviderResponse { text, tokens_in, tokens_out, cost_estimate: None })
    }

    async fn call_openai_compatible(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let url = format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );
        let body = chat_completions_body(&self.config.model, request);
        let value = self
            .send(self.build_request(&url, body, &request.provenance_headers))
            .await?;
        parse_openai_compatible(&value)
    }

    async fn call_openrouter(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let url = format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );
        let body = chat_completions_body(&self.config.model, request);
        let mut provenance = request.provenance_headers.clone();
        provenance.push(("HTTP-Referer".to_string(), "https://longform-translate.local".to_string()));
        provenance.push(("X-Title".to_string(), "longform-translate".to_string()));
        let value = self.send(self.build_request(&url, body, &provenance)).await?;
        let mut parsed = parse_openai_compatible(&value)?;
        parsed.cost_estimate = value
            .get("usage")
            .and_then(|u| u.get("total_cost"))
            .and_then(|c| c.as_f64());
        Ok(parsed)
    }

    async fn call_gemini(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model,
            self.config.api_key.clone().unwrap_or_default()
        );
        let body = json!({
            "systemInstruction": { "parts": [{ "text": request.system }] },
            "contents": [{ "role": "user", "parts": [{ "text": request.user }] }],
            "generationConfig": { "maxOutputTokens": request.max_tokens, "stopSequences": request.stop },
        });
        let value = self.send(self.build_request(&url, body, &request.provenance_headers)).await?;

        let text = value
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("text"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| EngineError::ProviderBadResponse("missing candidates[0].content.parts[].text".into()))?
            .to_string();

        let usage = value.get("usageMetadata");
        let tokens_in = usage.and_then(|u| u.get("promptTokenCount")).and_then(|v| v.as_u64()).unwrap_or(0);
        let tokens_out = usage.and_then(|u| u.get("candidatesTokenCount")).and_then(|v| v.as_u64()).unwrap_or(0);

        Ok(ProviderResponse { text, tokens_in, tokens_out, cost_estimate: None })
    }
}

fn chat_completions_body(model: &str, request: &ProviderRequest) -> serde_json::Value {
    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": request.system },
            { "role": "user", "content": request.user },
        ],
        "max_tokens": request.max_tokens,
        "stop": request.stop,
    })
}

fn parse_openai_compatible(value: &serde_json::Value) -> Result<ProviderResponse> {
    let text = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| EngineError::ProviderBadResponse("missing choices[0].message.content".into()))?
        .to_string();

    let usage = value.get("usage");
    let tokens_in = usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
    let tokens_out = usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);

    Ok(ProviderResponse { text, tokens_in, tokens_out, cost_estimate: None })
}

/// Deterministic in-process backend used by end-to-end tests. Scenario is
/// selected by the `stub://` scheme in `ProviderConfig.endpoint` rather than a
/// dedicated config field, so `ProviderConfig` itself stays identical between
/// test and production builds.
#[cfg(test)]
mod stub {
    use super::*;
    use once_cell::sync::Lazy;
    use std::collections::HashMap;
    use std::sync::Mutex;

    static FAIL_COUNTS: Lazy<Mutex<HashMap<String, u32>>> = Lazy::new(|| Mutex::new(HashMap::new()));

    pub async fn respond(endpoint: &str, request: &ProviderRequest) -> Result<ProviderResponse> {
        let scenario = endpoint.strip_prefix("stub://").unwrap_or("echo");
        let payload = last_translate_payload(&request.user);

        if let Some(n) = scenario.strip_prefix("fail-times/") {
            let limit: u32 = n.parse().unwrap_or(0);
            let mut counts = FAIL_COUNTS.lock().unwrap();
            let count = counts.entry(endpoint.to_string()).or_insert(0);
            if *count < limit {
                *count += 1;
                return Err(EngineError::ProviderServerError {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                });
            }
            return Ok(echo_response(&payload, TokenTransform::Verbatim));
        }

        // Simulates an in-flight call that outlasts a cancellation request,
        // so tests can assert the orchestrator never aborts a dispatched chunk.
        if let Some(n) = scenario.strip_prefix("slow/") {
            let millis: u64 = n.parse().unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
            return Ok(echo_response(&payload, TokenTransform::Verbatim));
        }

        let transform = match scenario {
            "echo-simple-tokens" => TokenTransform::ToSimpleForm,
            "echo-no-tokens" => TokenTransform::Strip,
            _ => TokenTransform::Verbatim,
        };
        Ok(echo_response(&payload, transform))
    }

    enum TokenTransform {
        /// Leave any `⟦TAGn⟧` tokens untouched.
        Verbatim,
        /// Rewrite `⟦TAGn⟧` tokens to the simple `[n]` fallback form, simulating a
        /// model that drifted to the wrong placeholder syntax.
        ToSimpleForm,
        /// Drop tokens entirely, simulating a reply that destroyed them.
        Strip,
    }

    fn echo_response(payload: &str, transform: TokenTransform) -> ProviderResponse {
        let text = match transform {
            TokenTransform::Verbatim => wrap_paragraphs(payload),
            TokenTransform::ToSimpleForm => {
                wrap_paragraphs(&crate::placeholder::rewrite_to_simple_form(payload))
            }
            TokenTransform::Strip => wrap_paragraphs(&crate::placeholder::strip_tokens(payload)),
        };
        let tokens_in = payload.split_whitespace().count() as u64;
        let tokens_out = text.split_whitespace().count() as u64;
        ProviderResponse { text, tokens_in, tokens_out, cost_estimate: None }
    }

    /// Wrap each blank-line-separated paragraph in guillemets, the stub's
    /// stand-in for "translated".
    fn wrap_paragraphs(payload: &str) -> String {
        payload
            .split("\n\n")
            .map(|p| format!("\u{ab}{p}\u{bb}"))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// The chunk translator's user prompt prefixes in-context example pairs
    /// before the final `Translate:\n` marker; the stub only echoes the chunk
    /// actually being translated.
    fn last_translate_payload(user_prompt: &str) -> String {
        match user_prompt.rsplit_once("Translate:\n") {
            Some((_, payload)) => payload.to_string(),
            None => user_prompt.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_openai_compatible_extracts_content_and_usage() {
        let value = json!({
            "choices": [{ "message": { "content": "bonjour" } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 3 },
        });
        let parsed = parse_openai_compatible(&value).unwrap();
        assert_eq!(parsed.text, "bonjour");
        assert_eq!(parsed.tokens_in, 10);
        assert_eq!(parsed.tokens_out, 3);
    }

    #[test]
    fn parse_openai_compatible_missing_content_is_bad_response() {
        let value = json!({ "choices": [] });
        let err = parse_openai_compatible(&value).unwrap_err();
        assert_eq!(err.kind().as_str(), "provider_bad_response");
    }

    #[test]
    fn chat_completions_body_carries_system_and_user() {
        let request = ProviderRequest {
            system: "sys".into(),
            user: "usr".into(),
            max_tokens: 100,
            stop: vec![],
            provenance_headers: vec![],
        };
        let body = chat_completions_body("gpt-test", &request);
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(body["messages"][1]["content"], "usr");
    }
}
