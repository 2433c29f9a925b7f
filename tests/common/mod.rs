//! Shared test fixtures: a scripted gateway and an AppState wired to an
//! in-memory store.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use maison::auth::{AuthService, StaticTokenAuth};
use maison::config::Tuning;
use maison::connection_key::ConnectionKeyStore;
use maison::error::MaisonError;
use maison::extraction::queue::ExtractionQueue;
use maison::extraction::PipelineRunner;
use maison::llm::{AbortHandle, LlmGateway, LlmStream, StreamEvent};
use maison::memory::EmbedCache;
use maison::store::Store;
use maison::ws::maid::{ChatMaid, MaidHandler};
use maison::{AppState, SharedStore};

pub const DIM: usize = 4;

/// Deterministic unit-norm embedding derived from the text bytes.
pub fn hash_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    for (i, b) in text.bytes().enumerate() {
        v[i % DIM] += b as f32;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

pub struct StreamScript {
    pub deltas: Vec<String>,
    pub delay: Duration,
    pub end: StreamEvent,
}

impl StreamScript {
    pub fn completed(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|s| s.to_string()).collect(),
            delay: Duration::ZERO,
            end: StreamEvent::Completed,
        }
    }

    pub fn slow(deltas: &[&str], delay: Duration) -> Self {
        Self { delay, ..Self::completed(deltas) }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            deltas: vec![],
            delay: Duration::ZERO,
            end: StreamEvent::Error(message.into()),
        }
    }
}

/// Scripted gateway: structured responses and streams pop from queues,
/// embeddings are deterministic (or pinned per text).
#[derive(Default)]
pub struct MockGateway {
    pub structured: Mutex<VecDeque<String>>,
    pub structured_prompts: Mutex<Vec<String>>,
    pub stream_prompts: Mutex<Vec<String>>,
    pub pinned_embeddings: Mutex<HashMap<String, Vec<f32>>>,
    pub embed_calls: AtomicUsize,
    pub streams: Mutex<VecDeque<StreamScript>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_structured(&self, response: &str) {
        self.structured.lock().push_back(response.to_string());
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().push_back(script);
    }

    pub fn pin_embedding(&self, text: &str, embedding: Vec<f32>) {
        self.pinned_embeddings.lock().insert(text.to_string(), embedding);
    }
}

#[async_trait]
impl LlmGateway for MockGateway {
    async fn stream_response(
        &self,
        prompt: &str,
        _instructions: Option<&str>,
    ) -> Result<LlmStream, MaisonError> {
        self.stream_prompts.lock().push(prompt.to_string());
        let script = self
            .streams
            .lock()
            .pop_front()
            .unwrap_or_else(|| StreamScript::completed(&["ok"]));
        let (tx, rx) = mpsc::channel(16);
        let handle = AbortHandle::new();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            for delta in script.deltas {
                if !script.delay.is_zero() {
                    tokio::select! {
                        _ = task_handle.cancelled() => {
                            let _ = tx.send(StreamEvent::Aborted).await;
                            return;
                        }
                        _ = tokio::time::sleep(script.delay) => {}
                    }
                }
                if task_handle.is_aborted() {
                    let _ = tx.send(StreamEvent::Aborted).await;
                    return;
                }
                if tx.send(StreamEvent::Delta(delta)).await.is_err() {
                    return;
                }
            }
            if task_handle.is_aborted() {
                let _ = tx.send(StreamEvent::Aborted).await;
            } else {
                let _ = tx.send(script.end).await;
            }
        });
        Ok(LlmStream { events: rx, handle })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MaisonError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let pinned = self.pinned_embeddings.lock();
        Ok(texts
            .iter()
            .map(|t| pinned.get(t).cloned().unwrap_or_else(|| hash_embedding(t)))
            .collect())
    }

    async fn generate_structured(&self, prompt: &str) -> Result<String, MaisonError> {
        self.structured_prompts.lock().push(prompt.to_string());
        Ok(self
            .structured
            .lock()
            .pop_front()
            .unwrap_or_else(|| "NONE".to_string()))
    }
}

pub fn test_tuning() -> Tuning {
    Tuning {
        embedding_dim: DIM,
        ..Tuning::default()
    }
}

/// Full AppState over an in-memory store and the given gateway.
/// `debounce` controls how quickly signalled extraction actually runs.
pub fn test_state(gateway: Arc<MockGateway>, debounce: Duration) -> AppState {
    let tuning = Arc::new(test_tuning());
    let store: SharedStore = Arc::new(Store::open(":memory:", DIM).unwrap());
    let gateway: Arc<dyn LlmGateway> = gateway;
    let runner = Arc::new(PipelineRunner {
        store: store.clone(),
        gateway: gateway.clone(),
        tuning: tuning.clone(),
    });
    let queue = ExtractionQueue::new(runner, debounce, tuning.queue_attempts);
    let mut maids: HashMap<String, Arc<dyn MaidHandler>> = HashMap::new();
    maids.insert("chat".into(), Arc::new(ChatMaid));
    let auth: Arc<dyn AuthService> =
        Arc::new(StaticTokenAuth::new(vec![("tok-alice".into(), "alice".into())]));
    AppState {
        store,
        gateway,
        auth,
        keys: ConnectionKeyStore::new(60_000),
        queue,
        maids: Arc::new(maids),
        embed_cache: EmbedCache::new(16),
        tuning,
        started_at: std::time::Instant::now(),
    }
}
