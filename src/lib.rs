pub mod api;
pub mod auth;
pub mod config;
pub mod connection_key;
pub mod error;
pub mod extraction;
pub mod llm;
pub mod memory;
pub mod prompts;
pub mod session;
pub mod store;
pub mod util;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

pub type SharedStore = Arc<store::Store>;

/// Run a blocking store operation on tokio's blocking thread pool.
///
/// All synchronous Store calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn db_call<F, T>(store: &SharedStore, f: F) -> Result<T, error::MaisonError>
where
    F: FnOnce(&store::Store) -> T + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| error::MaisonError::Internal(e.to_string()))
}

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub gateway: Arc<dyn llm::LlmGateway>,
    pub auth: Arc<dyn auth::AuthService>,
    pub keys: connection_key::ConnectionKeyStore,
    pub queue: extraction::queue::ExtractionQueue,
    pub maids: Arc<HashMap<String, Arc<dyn ws::maid::MaidHandler>>>,
    pub embed_cache: memory::EmbedCache,
    pub tuning: Arc<config::Tuning>,
    pub started_at: std::time::Instant,
}

impl AppState {
    /// Per-user service pair used by socket runtimes and HTTP handlers.
    pub fn services_for(&self, user_id: &str) -> (session::SessionService, memory::MemoryService) {
        let sessions = session::SessionService::new(self.store.clone(), user_id.to_string());
        let memories = memory::MemoryService::new(
            self.store.clone(),
            self.gateway.clone(),
            self.queue.clone(),
            self.embed_cache.clone(),
            user_id.to_string(),
        );
        (sessions, memories)
    }
}
