//! Talks to OpenAI-compatible or Anthropic-native APIs for chat calls,
//! and OpenAI-compatible APIs for embeddings.
//!
//! The rest of the crate only sees the `LlmGateway` trait: a cancellable
//! delta stream, batch embeddings, and a deterministic structured call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::error::MaisonError;

fn llm_err(msg: impl Into<String>) -> MaisonError {
    MaisonError::LlmBackend(msg.into())
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STRUCTURED_MAX_TOKENS: u32 = 4096;

/// Which LLM API wire format to use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Anthropic,
}

#[derive(Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub llm_url: String,
    pub llm_key: String,
    pub llm_model: String,
    pub embed_url: String,
    pub embed_key: String,
    pub embed_model: String,
    pub embedding_dim: usize,
    pub client: reqwest::Client,
}

impl LlmConfig {
    /// Returns `None` if `MAISON_LLM_URL` is not set.
    pub fn from_env(embedding_dim: usize) -> Option<Self> {
        let llm_url = std::env::var("MAISON_LLM_URL").ok()?;
        let llm_key = std::env::var("MAISON_LLM_KEY").unwrap_or_default();
        let llm_model =
            std::env::var("MAISON_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());

        let provider = match std::env::var("MAISON_LLM_PROVIDER")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "anthropic" | "claude" => LlmProvider::Anthropic,
            _ => LlmProvider::OpenAI,
        };

        let embed_url = std::env::var("MAISON_EMBED_URL").unwrap_or_else(|_| {
            // Only rewrite if this looks like a chat completions endpoint
            if llm_url.contains("/chat/completions") {
                llm_url.replace("/chat/completions", "/embeddings")
            } else {
                format!("{}/embeddings", llm_url.trim_end_matches('/'))
            }
        });
        let embed_key = std::env::var("MAISON_EMBED_KEY").unwrap_or_else(|_| llm_key.clone());
        let embed_model = std::env::var("MAISON_EMBED_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".into());

        // No total timeout on the client: streaming responses outlive any
        // sane fixed budget. Non-streaming calls set a per-request timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Some(Self {
            provider,
            llm_url,
            llm_key,
            llm_model,
            embed_url,
            embed_key,
            embed_model,
            embedding_dim,
            client,
        })
    }
}

// ---------------------------------------------------------------------------
// Stream surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Completed,
    Aborted,
    Error(String),
}

/// Cancellation capability for an in-flight stream. `abort()` is idempotent;
/// after it fires the stream emits no further deltas and resolves `Aborted`.
#[derive(Clone, Default)]
pub struct AbortHandle {
    cancel: Arc<Notify>,
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            self.cancel.notify_one();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once `abort()` has been called (immediately if it already
    /// was). Race this against production of the next delta.
    pub async fn cancelled(&self) {
        if self.is_aborted() {
            return;
        }
        self.cancel.notified().await;
    }
}

/// A live response stream: a finite sequence of deltas followed by exactly
/// one terminal event.
pub struct LlmStream {
    pub events: mpsc::Receiver<StreamEvent>,
    pub handle: AbortHandle,
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn stream_response(
        &self,
        prompt: &str,
        instructions: Option<&str>,
    ) -> Result<LlmStream, MaisonError>;

    /// `result.len() == texts.len()`, every vector at the configured dimension.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MaisonError>;

    /// Non-streaming single response at temperature 0.
    async fn generate_structured(&self, prompt: &str) -> Result<String, MaisonError>;
}

// ---------------------------------------------------------------------------
// OpenAI wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Anthropic wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

// ---------------------------------------------------------------------------
// HTTP gateway
// ---------------------------------------------------------------------------

pub struct HttpGateway {
    cfg: LlmConfig,
}

impl HttpGateway {
    pub fn new(cfg: LlmConfig) -> Self {
        Self { cfg }
    }

    fn add_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut b = builder;
        if !self.cfg.llm_key.is_empty() {
            match self.cfg.provider {
                LlmProvider::Anthropic => {
                    b = b
                        .header("x-api-key", &self.cfg.llm_key)
                        .header("anthropic-version", "2023-06-01");
                }
                LlmProvider::OpenAI => {
                    b = b.header("Authorization", format!("Bearer {}", self.cfg.llm_key));
                }
            }
        }
        b
    }

    fn chat_body(&self, prompt: &str, instructions: Option<&str>, stream: bool) -> serde_json::Value {
        match self.cfg.provider {
            LlmProvider::OpenAI => {
                let mut messages = Vec::new();
                if let Some(sys) = instructions {
                    messages.push(ChatMessage { role: "system".into(), content: sys.into() });
                }
                messages.push(ChatMessage { role: "user".into(), content: prompt.into() });
                serde_json::to_value(ChatRequest {
                    model: self.cfg.llm_model.clone(),
                    messages,
                    temperature: 0.0,
                    stream: stream.then_some(true),
                })
                .expect("chat request serializes")
            }
            LlmProvider::Anthropic => serde_json::to_value(AnthropicRequest {
                model: self.cfg.llm_model.clone(),
                max_tokens: STRUCTURED_MAX_TOKENS,
                system: instructions.map(str::to_string),
                messages: vec![ChatMessage { role: "user".into(), content: prompt.into() }],
                temperature: 0.0,
                stream: stream.then_some(true),
            })
            .expect("chat request serializes"),
        }
    }

    /// Pull the text delta out of one SSE `data:` payload, for either
    /// provider's stream format.
    fn sse_delta(provider: &LlmProvider, data: &str) -> Option<String> {
        let v: serde_json::Value = serde_json::from_str(data).ok()?;
        let pointer = match provider {
            LlmProvider::OpenAI => "/choices/0/delta/content",
            LlmProvider::Anthropic => "/delta/text",
        };
        v.pointer(pointer).and_then(|c| c.as_str()).map(str::to_string)
    }
}

#[async_trait]
impl LlmGateway for HttpGateway {
    async fn stream_response(
        &self,
        prompt: &str,
        instructions: Option<&str>,
    ) -> Result<LlmStream, MaisonError> {
        let body = self.chat_body(prompt, instructions, true);
        let builder = self.add_auth(self.cfg.client.post(&self.cfg.llm_url).json(&body));

        let resp = builder
            .send()
            .await
            .map_err(|e| llm_err(format!("LLM stream request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(llm_err(format!("LLM returned {status}: {body}")));
        }

        let (tx, rx) = mpsc::channel::<StreamEvent>(32);
        let handle = AbortHandle::new();
        let task_handle = handle.clone();
        let provider = self.cfg.provider.clone();

        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut pending = String::new();
            loop {
                tokio::select! {
                    _ = task_handle.cancelled() => {
                        let _ = tx.send(StreamEvent::Aborted).await;
                        return;
                    }
                    chunk = byte_stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            pending.push_str(&String::from_utf8_lossy(&bytes));
                            while let Some(pos) = pending.find('\n') {
                                let line = pending[..pos].trim_end_matches('\r').to_string();
                                pending.drain(..=pos);
                                let Some(data) = line.strip_prefix("data: ") else { continue };
                                if data == "[DONE]" {
                                    continue;
                                }
                                if let Some(delta) = Self::sse_delta(&provider, data) {
                                    if !delta.is_empty()
                                        && tx.send(StreamEvent::Delta(delta)).await.is_err()
                                    {
                                        return;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                            return;
                        }
                        None => {
                            let _ = tx.send(StreamEvent::Completed).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(LlmStream { events: rx, handle })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MaisonError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        #[derive(Serialize)]
        struct EmbedRequest<'a> {
            model: &'a str,
            input: &'a [String],
        }

        #[derive(Deserialize)]
        struct EmbedResponse {
            data: Vec<EmbedData>,
        }

        #[derive(Deserialize)]
        struct EmbedData {
            embedding: Vec<f32>,
        }

        let req = EmbedRequest { model: &self.cfg.embed_model, input: texts };
        let mut builder = self
            .cfg
            .client
            .post(&self.cfg.embed_url)
            .timeout(REQUEST_TIMEOUT)
            .json(&req);
        if !self.cfg.embed_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.cfg.embed_key));
        }

        let start = std::time::Instant::now();
        let resp = builder
            .send()
            .await
            .map_err(|e| llm_err(format!("embedding request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(llm_err(format!("embedding API returned {status}: {body}")));
        }

        let embed_resp: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| llm_err(format!("embedding response parse failed: {e}")))?;

        let embeddings: Vec<Vec<f32>> = embed_resp.data.into_iter().map(|d| d.embedding).collect();
        if embeddings.len() != texts.len() {
            return Err(llm_err(format!(
                "embedding count mismatch: sent {} texts, got {} embeddings",
                texts.len(),
                embeddings.len()
            )));
        }
        for emb in &embeddings {
            if emb.len() != self.cfg.embedding_dim {
                return Err(MaisonError::EmbeddingDim {
                    expected: self.cfg.embedding_dim,
                    got: emb.len(),
                });
            }
        }
        debug!(
            batch = texts.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "embed call complete"
        );
        Ok(embeddings)
    }

    async fn generate_structured(&self, prompt: &str) -> Result<String, MaisonError> {
        let body = self.chat_body(prompt, None, false);
        let builder = self
            .add_auth(self.cfg.client.post(&self.cfg.llm_url).timeout(REQUEST_TIMEOUT))
            .json(&body);

        let start = std::time::Instant::now();
        let resp = builder
            .send()
            .await
            .map_err(|e| llm_err(format!("LLM request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(llm_err(format!("LLM returned {status}: {body}")));
        }

        let content = match self.cfg.provider {
            LlmProvider::OpenAI => {
                let chat: ChatResponse = resp
                    .json()
                    .await
                    .map_err(|e| llm_err(format!("LLM response parse failed: {e}")))?;
                chat.choices
                    .first()
                    .and_then(|c| c.message.content.clone())
                    .unwrap_or_default()
            }
            LlmProvider::Anthropic => {
                let ar: AnthropicResponse = resp
                    .json()
                    .await
                    .map_err(|e| llm_err(format!("LLM response parse failed: {e}")))?;
                ar.content
                    .iter()
                    .filter(|b| b.block_type == "text")
                    .filter_map(|b| b.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            }
        };
        debug!(
            model = %self.cfg.llm_model,
            duration_ms = start.elapsed().as_millis() as u64,
            "structured call complete"
        );
        Ok(content)
    }
}

// ---------------------------------------------------------------------------
// Vector utilities
// ---------------------------------------------------------------------------

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (ai, bi) = (a[i] as f64, b[i] as f64);
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Serialize an f32 vector to bytes (little-endian) for SQLite BLOB storage.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize bytes back to an f32 vector.
pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("4 bytes");
            f32::from_le_bytes(arr)
        })
        .collect()
}
