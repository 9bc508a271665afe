//! Provider layer: uniform call/stream/cancel over heterogeneous LLM APIs.
//!
//! Two provider families are supported: a local-style API (host URL + model
//! name, JSON body, newline-delimited streaming — the Ollama shape) and an
//! OpenAI-compatible API (bearer auth, SSE streaming).  Settings arrive with
//! every call; nothing credential-shaped is retained between turns.
//!
//! Cancellation rides a `tokio::sync::watch` receiver: mid-stream, the read
//! loop races each chunk against the flag and drops the connection as soon
//! as it flips, returning whatever partial text accumulated with
//! `cancelled=true`.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

// ── Chat message types ───────────────────────────────────────────────────────

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

// ── Call-time configuration ──────────────────────────────────────────────────

/// Which provider family handles a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Ollama,
    OpenAiCompat,
}

/// Per-call provider settings.  Held only for the duration of one request —
/// the engine never stores credentials between turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    /// Request timeout; `None` means the client default (120 s).
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// Sampling and length controls forwarded to the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatControls {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stream: bool,
}

// ── Results ──────────────────────────────────────────────────────────────────

/// One streamed fragment: visible content and/or thinking text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamDelta {
    pub content: String,
    pub thinking: Option<String>,
}

/// Final payload of a completion, streamed or not.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub thinking: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// True when the call was cut short by the cancellation flag; `content`
    /// then holds whatever had accumulated.
    pub cancelled: bool,
}

// ── Provider trait ───────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn list_models(&self, settings: &ProviderSettings) -> Result<Vec<String>>;

    /// Cheap reachability probe for admin surfaces.
    async fn test_connection(&self, settings: &ProviderSettings) -> Result<bool>;

    async fn complete(
        &self,
        settings: &ProviderSettings,
        messages: &[ChatMessage],
        controls: &ChatControls,
        cancel: watch::Receiver<bool>,
    ) -> Result<Completion>;

    /// Stream deltas into `tx` as they arrive; the return value carries the
    /// accumulated text and usage.
    async fn stream(
        &self,
        settings: &ProviderSettings,
        messages: &[ChatMessage],
        controls: &ChatControls,
        cancel: watch::Receiver<bool>,
        tx: mpsc::Sender<StreamDelta>,
    ) -> Result<Completion>;
}

/// Maps a [`ProviderKind`] to a provider implementation.  The pipeline sees
/// only this seam, so hosts (and tests) can substitute their own providers.
pub trait ProviderSelector: Send + Sync {
    fn provider(&self, kind: ProviderKind) -> &dyn LlmProvider;
}

/// Routes a [`ProviderKind`] to its client.  Clients are stateless beyond
/// their connection pools, so one router serves every conversation.
#[derive(Debug, Clone, Default)]
pub struct ProviderRouter {
    ollama: OllamaClient,
    openai: OpenAiCompatClient,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProviderSelector for ProviderRouter {
    fn provider(&self, kind: ProviderKind) -> &dyn LlmProvider {
        match kind {
            ProviderKind::Ollama => &self.ollama,
            ProviderKind::OpenAiCompat => &self.openai,
        }
    }
}

/// Models suggested when an OpenAI-compatible endpoint does not expose a
/// listing the caller can reach.
const OPENAI_COMPAT_FALLBACK_MODELS: &[&str] = &[
    "gpt-4o-mini",
    "gpt-4o",
    "gpt-4.1-mini",
    "o4-mini",
];

// ── Shared helpers ───────────────────────────────────────────────────────────

fn http_client(settings: &ProviderSettings) -> Result<reqwest::Client> {
    let timeout = Duration::from_secs(settings.request_timeout_secs.unwrap_or(120));
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{path}", base_url.trim_end_matches('/'))
}

/// Resolves when the flag flips to `true`; never resolves if the sender is
/// gone (a dropped flag means "no one can cancel any more").
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Accumulates raw network chunks and hands back complete lines.
#[derive(Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

// ── Ollama-style client ──────────────────────────────────────────────────────

/// Local-style API: `POST {base}/api/chat` with newline-delimited JSON
/// streaming, `GET {base}/api/tags` for models.
#[derive(Debug, Clone, Default)]
pub struct OllamaClient;

fn ollama_payload(
    settings: &ProviderSettings,
    messages: &[ChatMessage],
    controls: &ChatControls,
    stream: bool,
) -> serde_json::Value {
    let mut options = serde_json::Map::new();
    if let Some(temperature) = controls.temperature {
        options.insert("temperature".into(), json!(temperature));
    }
    if let Some(max_tokens) = controls.max_tokens {
        options.insert("num_predict".into(), json!(max_tokens));
    }
    if !controls.stop.is_empty() {
        options.insert("stop".into(), json!(controls.stop));
    }

    let mut payload = json!({
        "model": settings.model,
        "messages": messages,
        "stream": stream,
    });
    if !options.is_empty() {
        payload["options"] = serde_json::Value::Object(options);
    }
    payload
}

/// One parsed line of an Ollama chat stream.
#[derive(Debug, Default, PartialEq)]
struct OllamaEvent {
    content: String,
    thinking: Option<String>,
    done: bool,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

fn parse_ollama_line(line: &str) -> Option<OllamaEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let body: serde_json::Value = serde_json::from_str(line).ok()?;
    let message = body.get("message");
    Some(OllamaEvent {
        content: message
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        thinking: message
            .and_then(|m| m.get("thinking"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(ToString::to_string),
        done: body.get("done").and_then(|v| v.as_bool()).unwrap_or(false),
        input_tokens: body.get("prompt_eval_count").and_then(|v| v.as_u64()),
        output_tokens: body.get("eval_count").and_then(|v| v.as_u64()),
    })
}

#[async_trait]
impl LlmProvider for OllamaClient {
    async fn list_models(&self, settings: &ProviderSettings) -> Result<Vec<String>> {
        let client = http_client(settings)?;
        let response = client.get(endpoint(&settings.base_url, "/api/tags")).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("model listing failed ({})", response.status()));
        }
        let body: serde_json::Value = response.json().await?;
        let mut models: Vec<String> = body
            .get("models")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("name").and_then(|v| v.as_str()))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        models.sort();
        models.dedup();
        Ok(models)
    }

    async fn test_connection(&self, settings: &ProviderSettings) -> Result<bool> {
        let client = http_client(settings)?;
        let response = client.get(endpoint(&settings.base_url, "/api/tags")).send().await?;
        Ok(response.status().is_success())
    }

    async fn complete(
        &self,
        settings: &ProviderSettings,
        messages: &[ChatMessage],
        controls: &ChatControls,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Completion> {
        let client = http_client(settings)?;
        let payload = ollama_payload(settings, messages, controls, false);
        let request = client
            .post(endpoint(&settings.base_url, "/api/chat"))
            .json(&payload)
            .send();

        let response = tokio::select! {
            response = request => response?,
            _ = cancelled(&mut cancel) => {
                return Ok(Completion { cancelled: true, ..Default::default() });
            }
        };

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!("provider error ({status}): {body}"));
        }

        let message = body.get("message");
        Ok(Completion {
            content: message
                .and_then(|m| m.get("content"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            thinking: message
                .and_then(|m| m.get("thinking"))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
            input_tokens: body.get("prompt_eval_count").and_then(|v| v.as_u64()),
            output_tokens: body.get("eval_count").and_then(|v| v.as_u64()),
            cancelled: false,
        })
    }

    async fn stream(
        &self,
        settings: &ProviderSettings,
        messages: &[ChatMessage],
        controls: &ChatControls,
        mut cancel: watch::Receiver<bool>,
        tx: mpsc::Sender<StreamDelta>,
    ) -> Result<Completion> {
        let client = http_client(settings)?;
        let payload = ollama_payload(settings, messages, controls, true);
        let mut response = client
            .post(endpoint(&settings.base_url, "/api/chat"))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await?;
            return Err(anyhow!("provider error ({status}): {body}"));
        }

        let mut out = Completion::default();
        let mut thinking = String::new();
        let mut buffer = LineBuffer::default();

        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk?,
                _ = cancelled(&mut cancel) => {
                    // Dropping `response` tears the connection down.
                    out.cancelled = true;
                    break;
                }
            };
            let Some(chunk) = chunk else { break };

            for line in buffer.push(&chunk) {
                let Some(event) = parse_ollama_line(&line) else { continue };
                if !event.content.is_empty() || event.thinking.is_some() {
                    out.content.push_str(&event.content);
                    if let Some(t) = &event.thinking {
                        thinking.push_str(t);
                    }
                    let _ = tx
                        .send(StreamDelta { content: event.content, thinking: event.thinking })
                        .await;
                }
                if event.done {
                    out.input_tokens = event.input_tokens;
                    out.output_tokens = event.output_tokens;
                }
            }
        }

        out.thinking = (!thinking.is_empty()).then_some(thinking);
        debug!(cancelled = out.cancelled, chars = out.content.len(), "ollama stream finished");
        Ok(out)
    }
}

// ── OpenAI-compatible client ─────────────────────────────────────────────────

/// OpenAI-compatible API: `POST {base}/chat/completions` with bearer auth and
/// SSE streaming, `GET {base}/models` for models.
#[derive(Debug, Clone, Default)]
pub struct OpenAiCompatClient;

fn openai_payload(
    settings: &ProviderSettings,
    messages: &[ChatMessage],
    controls: &ChatControls,
    stream: bool,
) -> serde_json::Value {
    let mut payload = json!({
        "model": settings.model,
        "messages": messages,
        "stream": stream,
    });
    if let Some(temperature) = controls.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = controls.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if !controls.stop.is_empty() {
        payload["stop"] = json!(controls.stop);
    }
    payload
}

/// One parsed SSE line of an OpenAI-compatible stream.
#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta { content: String, thinking: Option<String> },
    Done,
    Ignored,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
        return SseEvent::Ignored;
    };
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    let Ok(body) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseEvent::Ignored;
    };
    let delta = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"));
    let content = delta
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let thinking = delta
        .and_then(|d| d.get("reasoning").or_else(|| d.get("reasoning_content")))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);
    if content.is_empty() && thinking.is_none() {
        return SseEvent::Ignored;
    }
    SseEvent::Delta { content, thinking }
}

fn bearer(
    request: reqwest::RequestBuilder,
    settings: &ProviderSettings,
) -> reqwest::RequestBuilder {
    match settings.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatClient {
    async fn list_models(&self, settings: &ProviderSettings) -> Result<Vec<String>> {
        let client = http_client(settings)?;
        let request = bearer(client.get(endpoint(&settings.base_url, "/models")), settings);
        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            _ => {
                return Ok(OPENAI_COMPAT_FALLBACK_MODELS
                    .iter()
                    .map(ToString::to_string)
                    .collect());
            }
        };
        let body: serde_json::Value = response.json().await?;
        let mut models: Vec<String> = body
            .get("data")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("id").and_then(|v| v.as_str()))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        models.sort();
        models.dedup();
        if models.is_empty() {
            models = OPENAI_COMPAT_FALLBACK_MODELS.iter().map(ToString::to_string).collect();
        }
        Ok(models)
    }

    async fn test_connection(&self, settings: &ProviderSettings) -> Result<bool> {
        let client = http_client(settings)?;
        let request = bearer(client.get(endpoint(&settings.base_url, "/models")), settings);
        let response = request.send().await?;
        Ok(response.status().is_success())
    }

    async fn complete(
        &self,
        settings: &ProviderSettings,
        messages: &[ChatMessage],
        controls: &ChatControls,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Completion> {
        let client = http_client(settings)?;
        let payload = openai_payload(settings, messages, controls, false);
        let request = bearer(
            client.post(endpoint(&settings.base_url, "/chat/completions")),
            settings,
        )
        .json(&payload)
        .send();

        let response = tokio::select! {
            response = request => response?,
            _ = cancelled(&mut cancel) => {
                return Ok(Completion { cancelled: true, ..Default::default() });
            }
        };

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!("provider error ({status}): {body}"));
        }

        let message = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"));
        Ok(Completion {
            content: message
                .and_then(|m| m.get("content"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            thinking: message
                .and_then(|m| m.get("reasoning").or_else(|| m.get("reasoning_content")))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
            input_tokens: body
                .get("usage")
                .and_then(|u| u.get("prompt_tokens"))
                .and_then(|v| v.as_u64()),
            output_tokens: body
                .get("usage")
                .and_then(|u| u.get("completion_tokens"))
                .and_then(|v| v.as_u64()),
            cancelled: false,
        })
    }

    async fn stream(
        &self,
        settings: &ProviderSettings,
        messages: &[ChatMessage],
        controls: &ChatControls,
        mut cancel: watch::Receiver<bool>,
        tx: mpsc::Sender<StreamDelta>,
    ) -> Result<Completion> {
        let client = http_client(settings)?;
        let payload = openai_payload(settings, messages, controls, true);
        let mut response = bearer(
            client.post(endpoint(&settings.base_url, "/chat/completions")),
            settings,
        )
        .json(&payload)
        .send()
        .await?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await?;
            return Err(anyhow!("provider error ({status}): {body}"));
        }

        let mut out = Completion::default();
        let mut thinking = String::new();
        let mut buffer = LineBuffer::default();

        'read: loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk?,
                _ = cancelled(&mut cancel) => {
                    out.cancelled = true;
                    break 'read;
                }
            };
            let Some(chunk) = chunk else { break };

            for line in buffer.push(&chunk) {
                match parse_sse_line(&line) {
                    SseEvent::Delta { content, thinking: t } => {
                        out.content.push_str(&content);
                        if let Some(t) = &t {
                            thinking.push_str(t);
                        }
                        let _ = tx.send(StreamDelta { content, thinking: t }).await;
                    }
                    SseEvent::Done => break 'read,
                    SseEvent::Ignored => {}
                }
            }
        }

        out.thinking = (!thinking.is_empty()).then_some(thinking);
        debug!(cancelled = out.cancelled, chars = out.content.len(), "sse stream finished");
        Ok(out)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProviderSettings {
        ProviderSettings {
            base_url: "http://localhost:11434/".to_string(),
            api_key: None,
            model: "llama3.1:8b".to_string(),
            request_timeout_secs: None,
        }
    }

    // ── payload shaping ────────────────────────────────────────────────────

    #[test]
    fn ollama_payload_maps_controls_into_options() {
        let controls = ChatControls {
            temperature: Some(0.2),
            max_tokens: Some(128),
            stop: vec!["END".to_string()],
            stream: true,
        };
        let payload = ollama_payload(&settings(), &[ChatMessage::user("hi")], &controls, true);
        assert_eq!(payload["model"], "llama3.1:8b");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["options"]["temperature"], 0.2);
        assert_eq!(payload["options"]["num_predict"], 128);
        assert_eq!(payload["options"]["stop"][0], "END");
        assert_eq!(payload["messages"][0]["role"], "user");
    }

    #[test]
    fn ollama_payload_omits_empty_options() {
        let payload =
            ollama_payload(&settings(), &[ChatMessage::user("hi")], &ChatControls::default(), false);
        assert!(payload.get("options").is_none());
    }

    #[test]
    fn openai_payload_is_flat() {
        let controls = ChatControls {
            temperature: Some(0.7),
            max_tokens: Some(64),
            stop: vec![],
            stream: false,
        };
        let payload = openai_payload(
            &settings(),
            &[ChatMessage::system("sys"), ChatMessage::user("hi")],
            &controls,
            false,
        );
        assert_eq!(payload["temperature"], 0.7);
        assert_eq!(payload["max_tokens"], 64);
        assert!(payload.get("stop").is_none());
        assert_eq!(payload["messages"][0]["role"], "system");
    }

    // ── NDJSON parsing ─────────────────────────────────────────────────────

    #[test]
    fn parses_ollama_content_line() {
        let event = parse_ollama_line(r#"{"message":{"content":"Hel"},"done":false}"#).unwrap();
        assert_eq!(event.content, "Hel");
        assert!(!event.done);
    }

    #[test]
    fn parses_ollama_final_line_with_usage() {
        let event = parse_ollama_line(
            r#"{"message":{"content":""},"done":true,"prompt_eval_count":12,"eval_count":34}"#,
        )
        .unwrap();
        assert!(event.done);
        assert_eq!(event.input_tokens, Some(12));
        assert_eq!(event.output_tokens, Some(34));
    }

    #[test]
    fn parses_ollama_thinking_delta() {
        let event =
            parse_ollama_line(r#"{"message":{"content":"","thinking":"hmm"},"done":false}"#)
                .unwrap();
        assert_eq!(event.thinking.as_deref(), Some("hmm"));
    }

    #[test]
    fn garbage_ollama_lines_are_skipped() {
        assert!(parse_ollama_line("").is_none());
        assert!(parse_ollama_line("not json").is_none());
    }

    // ── SSE parsing ────────────────────────────────────────────────────────

    #[test]
    fn parses_sse_content_delta() {
        let event =
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#);
        assert_eq!(
            event,
            SseEvent::Delta { content: "Hi".to_string(), thinking: None }
        );
    }

    #[test]
    fn parses_sse_reasoning_delta() {
        let event =
            parse_sse_line(r#"data: {"choices":[{"delta":{"reasoning":"because"}}]}"#);
        assert_eq!(
            event,
            SseEvent::Delta { content: String::new(), thinking: Some("because".to_string()) }
        );
    }

    #[test]
    fn recognizes_done_marker_and_noise() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseEvent::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseEvent::Ignored);
        assert_eq!(parse_sse_line(""), SseEvent::Ignored);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{}}]}"#),
            SseEvent::Ignored
        );
    }

    // ── line buffering ─────────────────────────────────────────────────────

    #[test]
    fn line_buffer_reassembles_split_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"a\":").is_empty());
        let lines = buffer.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
        let lines = buffer.push(b":3}\n");
        assert_eq!(lines, vec![r#"{"c":3}"#]);
    }

    #[test]
    fn line_buffer_strips_crlf() {
        let mut buffer = LineBuffer::default();
        let lines = buffer.push(b"data: x\r\n");
        assert_eq!(lines, vec!["data: x"]);
    }

    // ── misc ───────────────────────────────────────────────────────────────

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            endpoint("http://localhost:11434/", "/api/chat"),
            "http://localhost:11434/api/chat"
        );
        assert_eq!(
            endpoint("http://localhost:11434", "/api/chat"),
            "http://localhost:11434/api/chat"
        );
    }

    #[tokio::test]
    async fn cancelled_helper_fires_on_raise() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            cancelled(&mut rx).await;
            true
        });
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap());
    }
}
