//! maison — streaming chat backend with long-term user memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use maison::auth::{AuthService, StaticTokenAuth};
use maison::config::Tuning;
use maison::connection_key::ConnectionKeyStore;
use maison::extraction::queue::ExtractionQueue;
use maison::extraction::PipelineRunner;
use maison::llm::{HttpGateway, LlmConfig, LlmGateway};
use maison::memory::EmbedCache;
use maison::store::Store;
use maison::ws::maid::{ChatMaid, MaidHandler};
use maison::{api, AppState, SharedStore};

#[derive(Parser)]
#[command(name = "maison", version, about = "Streaming chat backend with long-term user memory")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3928", env = "PORT")]
    port: u16,

    /// SQLite database path
    #[arg(short, long, default_value = "maison.db", env = "MAISON_DB")]
    db: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let tuning = Arc::new(Tuning::from_env());

    let store: SharedStore =
        Arc::new(Store::open(&args.db, tuning.embedding_dim).expect("failed to open database"));

    let llm_cfg =
        LlmConfig::from_env(tuning.embedding_dim).expect("MAISON_LLM_URL must be set");
    let llm_model = llm_cfg.llm_model.clone();
    let embed_model = llm_cfg.embed_model.clone();
    let gateway: Arc<dyn LlmGateway> = Arc::new(HttpGateway::new(llm_cfg));

    let auth: Arc<dyn AuthService> = Arc::new(StaticTokenAuth::from_env());

    let runner = Arc::new(PipelineRunner {
        store: store.clone(),
        gateway: gateway.clone(),
        tuning: tuning.clone(),
    });
    let queue = ExtractionQueue::new(
        runner,
        Duration::from_millis(tuning.debounce_delay_ms),
        tuning.queue_attempts,
    );

    let mut maids: HashMap<String, Arc<dyn MaidHandler>> = HashMap::new();
    maids.insert("chat".into(), Arc::new(ChatMaid));

    let state = AppState {
        store,
        gateway,
        auth,
        keys: ConnectionKeyStore::new(tuning.connection_key_ttl_ms),
        queue: queue.clone(),
        maids: Arc::new(maids),
        embed_cache: EmbedCache::new(128),
        tuning: tuning.clone(),
        started_at: std::time::Instant::now(),
    };
    let app = api::router(state);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        db = %args.db,
        llm = %llm_model,
        embed = %embed_model,
        "maison starting"
    );

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Let in-flight extraction land before exit, within the configured bound.
    if !queue.drain(Duration::from_millis(tuning.shutdown_timeout_ms)).await {
        warn!("shutdown timeout reached with extraction jobs still pending");
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutting down");
}
