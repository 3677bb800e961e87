//! External model providers.
//!
//! The pipeline only ever sees the `LlmProvider` capability; the
//! OpenRouter-compatible adapter below is the reference
//! implementation. Deep-research models ride the same interface with
//! longer timeouts. The web-search feed used by the sentiment stage is
//! a second, much smaller capability.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Capability types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct LlmUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LlmCallOutput {
    pub model: String,
    pub content: String,
    pub usage: LlmUsage,
    pub latency_ms: u64,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("api status {status}: {snippet}")]
    Api { status: u16, snippet: String },
    #[error("malformed response: {0}")]
    Protocol(String),
}

#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn ask(&self, req: &LlmRequest) -> Result<LlmCallOutput, LlmError>;
}

// ---------------------------------------------------------------------------
// OpenRouter-compatible chat adapter
// ---------------------------------------------------------------------------

/// Longest error-body slice worth carrying into an `LlmError::Api`.
const ERROR_SNIPPET_CHARS: usize = 400;

#[derive(Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    /// Optional attribution headers OpenRouter understands, keyed by
    /// header name.
    attribution: Vec<(&'static str, String)>,
}

impl OpenRouterClient {
    pub fn from_env(http: reqwest::Client) -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY missing (set env var)")?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("OPENROUTER_API_KEY empty"));
        }

        let base_url = std::env::var("OPENROUTER_BASE_URL")
            .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string());

        let mut attribution = Vec::new();
        for (header, var) in [
            ("HTTP-Referer", "OPENROUTER_HTTP_REFERER"),
            ("X-Title", "OPENROUTER_APP_TITLE"),
        ] {
            if let Some(value) = std::env::var(var).ok().filter(|v| !v.trim().is_empty()) {
                attribution.push((header, value));
            }
        }

        Ok(Self {
            http,
            base_url,
            api_key,
            attribution,
        })
    }

    /// POST the body and give back the parsed JSON reply, mapping
    /// every failure mode onto the error taxonomy.
    async fn send(&self, body: Value, timeout: Duration) -> Result<Value, LlmError> {
        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(timeout)
            .bearer_auth(&self.api_key)
            .json(&body);
        for (header, value) in &self.attribution {
            request = request.header(*header, value);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                snippet: clip_snippet(&text),
            });
        }
        serde_json::from_str(&text).map_err(|e| LlmError::Protocol(e.to_string()))
    }
}

fn clip_snippet(body: &str) -> String {
    body.chars().take(ERROR_SNIPPET_CHARS).collect()
}

/// First choice's message text, if the reply carries one.
fn content_of(reply: &Value) -> Option<&str> {
    reply
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
}

fn usage_of(reply: &Value) -> LlmUsage {
    let count = |field: &str| {
        reply
            .pointer(&format!("/usage/{field}"))
            .and_then(Value::as_u64)
    };
    LlmUsage {
        prompt_tokens: count("prompt_tokens"),
        completion_tokens: count("completion_tokens"),
        total_tokens: count("total_tokens"),
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenRouterClient {
    async fn ask(&self, req: &LlmRequest) -> Result<LlmCallOutput, LlmError> {
        let started = Instant::now();

        let body = json!({
            "model": req.model,
            "messages": [
                {"role": "system", "content": req.system},
                {"role": "user", "content": req.user},
            ],
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });

        let reply = self.send(body, req.timeout).await?;
        let content = content_of(&reply)
            .ok_or_else(|| LlmError::Protocol("reply carries no message content".into()))?
            .to_string();

        Ok(LlmCallOutput {
            model: req.model.clone(),
            content,
            usage: usage_of(&reply),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// Web-search feed (sentiment stage input)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchItem {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    /// Recent items for one instrument query, newest first.
    async fn recent_items(&self, query: &str, limit: usize) -> Result<Vec<SearchItem>, LlmError>;
}

/// File-backed feed for paper runs: a JSON object keyed by ticker.
#[derive(Debug, Clone, Default)]
pub struct FileSearchFeed {
    items: BTreeMap<String, Vec<SearchItem>>,
}

impl FileSearchFeed {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("read search feed {:?}", path.as_ref()))?;
        let items: BTreeMap<String, Vec<SearchItem>> =
            serde_json::from_str(&raw).context("parse search feed json")?;
        Ok(Self { items })
    }
}

#[async_trait::async_trait]
impl SearchProvider for FileSearchFeed {
    async fn recent_items(&self, query: &str, limit: usize) -> Result<Vec<SearchItem>, LlmError> {
        let key = query.trim().to_ascii_uppercase();
        Ok(self
            .items
            .get(&key)
            .map(|v| v.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
