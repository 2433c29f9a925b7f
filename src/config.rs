//! Numeric tuning knobs, read once at startup.

use std::str::FromStr;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Tuning {
    /// Quiet window before a signalled extraction actually runs.
    pub debounce_delay_ms: u64,
    /// Total attempts per extraction job (1 initial + retries).
    pub queue_attempts: usize,
    /// Cosine similarity floor for nearby-memory retrieval during extraction.
    pub extraction_threshold: f64,
    /// Candidates fetched per fact when building the reconciliation pool.
    pub extraction_top_k: usize,
    /// Total reconciliation LLM attempts when actions reference unknown IDs.
    pub extraction_retries: usize,
    /// Lifetime of a single-use WebSocket connection key.
    pub connection_key_ttl_ms: u64,
    /// Upper bound on draining background work at shutdown.
    pub shutdown_timeout_ms: u64,
    /// Fixed embedding dimension for this deployment.
    pub embedding_dim: usize,
    /// Messages pulled into a chat prompt.
    pub history_limit: usize,
    /// Memories pulled into a chat prompt.
    pub memory_limit: usize,
}

impl Tuning {
    pub fn from_env() -> Self {
        Self {
            debounce_delay_ms: env_or("MEMORY_QUEUE_DEBOUNCE_DELAY_MS", 3000),
            queue_attempts: env_or("MEMORY_QUEUE_ATTEMPTS", 3),
            extraction_threshold: env_or("MEMORY_EXTRACTION_THRESHOLD", 0.7),
            extraction_top_k: env_or("MEMORY_EXTRACTION_TOP_K", 5),
            extraction_retries: env_or("MEMORY_EXTRACTION_RETRIES", 3),
            connection_key_ttl_ms: env_or("WS_CONNECTION_KEY_TTL_MS", 60_000),
            shutdown_timeout_ms: env_or("APP_SHUTDOWN_TIMEOUT_MS", 10_000),
            embedding_dim: env_or("MEMORY_EMBEDDING_DIM", 1024),
            history_limit: env_or("CHAT_HISTORY_LIMIT", 20),
            memory_limit: env_or("CHAT_MEMORY_LIMIT", 20),
        }
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            debounce_delay_ms: 3000,
            queue_attempts: 3,
            extraction_threshold: 0.7,
            extraction_top_k: 5,
            extraction_retries: 3,
            connection_key_ttl_ms: 60_000,
            shutdown_timeout_ms: 10_000,
            embedding_dim: 1024,
            history_limit: 20,
            memory_limit: 20,
        }
    }
}
