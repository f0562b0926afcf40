//! The vision-language model collaborator (spec §4.4): multimodal request
//! assembly, adaptive timeouts, retries, and `<think>/<answer>` extraction.
//!
//! Pinned to a single OpenAI-compatible chat-completions endpoint rather
//! than a multi-backend fallback chain. Errors are classified transient vs.
//! permanent (`Retryability`) so retry/backoff only fires where it can help,
//! and stray whitespace/smart-quote/BOM noise around the `<think>/<answer>`
//! envelope is tolerated rather than rejected outright.

mod parse;

use crate::config::ModelConfig;
use crate::errors::AgentError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex as SyncMutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use parse::sanitize_model_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub enum Content {
    Text(String),
    Multimodal { text: String, images_base64: Vec<String> },
}

impl Content {
    fn char_len(&self) -> usize {
        match self {
            Content::Text(t) => t.chars().count(),
            Content::Multimodal { text, .. } => text.chars().count(),
        }
    }

    fn image_count(&self) -> usize {
        match self {
            Content::Text(_) => 0,
            Content::Multimodal { images_base64, .. } => images_base64.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

#[derive(Debug, Clone)]
pub struct ModelReply {
    pub thought: String,
    pub action_text: String,
    pub raw: String,
    pub request_duration_ms: u64,
}

/// The public contract `Agent` depends on, so tests can stub it without
/// network I/O (grounded on the `other_examples` Minerva
/// `#[async_trait] trait DeviceController` pattern).
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn request(&self, messages: &[Message], cancel: &CancellationToken) -> Result<ModelReply, AgentError>;
}

struct TelemetryEntry {
    duration_ms: u64,
    payload_bytes: usize,
    timed_out: bool,
    success: bool,
}

const TELEMETRY_WINDOW: usize = 200;

pub struct ModelClient {
    config: ModelConfig,
    http: reqwest::Client,
    telemetry: SyncMutex<VecDeque<TelemetryEntry>>,
}

impl ModelClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            telemetry: SyncMutex::new(VecDeque::with_capacity(TELEMETRY_WINDOW)),
        }
    }

    fn adaptive_timeout(&self, messages: &[Message]) -> Duration {
        let total_chars: usize = messages.iter().map(|m| m.content.char_len()).sum();
        let image_count: usize = messages.iter().map(|m| m.content.image_count()).sum();
        let computed = self.config.base_timeout_ms as f64
            + self.config.content_factor_ms_per_char * total_chars as f64
            + self.config.image_factor_ms * image_count as f64;
        let capped = computed.min(self.config.max_timeout_ms as f64).max(1.0);
        Duration::from_millis(capped as u64)
    }

    fn record_telemetry(&self, duration_ms: u64, payload_bytes: usize, timed_out: bool, success: bool) {
        let mut window = self.telemetry.lock().expect("telemetry mutex poisoned");
        if window.len() >= TELEMETRY_WINDOW {
            window.pop_front();
        }
        window.push_back(TelemetryEntry {
            duration_ms,
            payload_bytes,
            timed_out,
            success,
        });
    }

    /// Timeout rate over the current sliding window, used by upper layers
    /// for observability; not consulted by the retry policy itself.
    pub fn timeout_rate(&self) -> f64 {
        let window = self.telemetry.lock().expect("telemetry mutex poisoned");
        if window.is_empty() {
            return 0.0;
        }
        let timeouts = window.iter().filter(|e| e.timed_out).count();
        timeouts as f64 / window.len() as f64
    }

    pub fn average_latency_ms(&self) -> f64 {
        let window = self.telemetry.lock().expect("telemetry mutex poisoned");
        if window.is_empty() {
            return 0.0;
        }
        window.iter().map(|e| e.duration_ms as f64).sum::<f64>() / window.len() as f64
    }

    fn body(&self, messages: &[Message]) -> serde_json::Value {
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                let content = match &m.content {
                    Content::Text(t) => serde_json::json!(t),
                    Content::Multimodal { text, images_base64 } => {
                        let mut parts = vec![serde_json::json!({"type": "text", "text": text})];
                        for img in images_base64 {
                            parts.push(serde_json::json!({
                                "type": "image_url",
                                "image_url": {"url": format!("data:image/png;base64,{}", img)}
                            }));
                        }
                        serde_json::json!(parts)
                    }
                };
                serde_json::json!({"role": role, "content": content})
            })
            .collect();

        serde_json::json!({
            "model": self.config.model,
            "messages": wire_messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "frequency_penalty": self.config.frequency_penalty,
        })
    }

    async fn attempt(&self, messages: &[Message], timeout: Duration, cancel: &CancellationToken) -> Result<String, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let url = format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'));
        let mut req = self.http.post(&url).json(&self.body(messages));
        if let Some(key) = &self.config.api_key {
            if !key.is_empty() {
                req = req.header("Authorization", format!("Bearer {key}"));
            }
        }

        let send = req.send();
        tokio::pin!(send);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            _ = tokio::time::sleep(timeout) => return Err(AgentError::Timeout { op: "model.request".into(), elapsed: timeout }),
            result = &mut send => result.map_err(|e| classify_transport_error(&e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::MalformedResponse(format!("invalid JSON body: {e}")))?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AgentError::MalformedResponse("response had no message content".into()))
    }
}

#[async_trait]
impl ModelBackend for ModelClient {
    async fn request(&self, messages: &[Message], cancel: &CancellationToken) -> Result<ModelReply, AgentError> {
        let payload_bytes = self.body(messages).to_string().len();
        let base_timeout = self.adaptive_timeout(messages);
        let mut timeout = base_timeout;
        let delays = &self.config.retry_delays_ms;
        let started = Instant::now();

        let mut last_err = None;
        for attempt in 0..=self.config.retry_count {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            match self.attempt(messages, timeout, cancel).await {
                Ok(raw) => {
                    let (thought, action_text) = parse::extract_think_answer(&raw)?;
                    let duration_ms = started.elapsed().as_millis() as u64;
                    self.record_telemetry(duration_ms, payload_bytes, false, true);
                    return Ok(ModelReply {
                        thought,
                        action_text,
                        raw,
                        request_duration_ms: duration_ms,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.config.retry_count => {
                    let timed_out = matches!(e, AgentError::Timeout { .. });
                    warn!(attempt, error = %e, "model request failed, retrying");
                    self.record_telemetry(started.elapsed().as_millis() as u64, payload_bytes, timed_out, false);
                    let delay = delays.get(attempt as usize).copied().unwrap_or_else(|| delays.last().copied().unwrap_or(1_000));
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    }
                    timeout = Duration::from_millis(
                        ((timeout.as_millis() as f64) * self.config.timeout_growth_factor)
                            .min(self.config.max_timeout_ms as f64) as u64,
                    );
                    last_err = Some(e);
                }
                Err(e) => {
                    self.record_telemetry(started.elapsed().as_millis() as u64, payload_bytes, matches!(e, AgentError::Timeout { .. }), false);
                    return Err(e);
                }
            }
        }
        Err(last_err.unwrap_or(AgentError::ModelTransient("retries exhausted".into())))
    }
}

fn classify_transport_error(e: &reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout { op: "model.request".into(), elapsed: Duration::default() }
    } else {
        AgentError::ModelTransient(e.to_string())
    }
}

fn classify_http_status(status: reqwest::StatusCode, body: &str) -> AgentError {
    let code = status.as_u16();
    if status.is_server_error() || code == 408 || code == 429 {
        AgentError::ModelTransient(format!("HTTP {code}: {body}"))
    } else {
        AgentError::ModelPermanent(format!("HTTP {code}: {body}"))
    }
}
