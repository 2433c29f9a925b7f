//! Per-connection socket runtime.
//!
//! Each socket owns a FIFO work deque drained by a single worker task, so
//! welcome/input turns serialize per connection. `abort` and `bye` bypass
//! the deque: the reader loop acts on shared state immediately — bumping
//! the turn epoch, clearing queued work and cancelling the active stream.
//!
//! The runtime core (`run_socket`) speaks channels, not sockets; the axum
//! upgrade handler adapts a real WebSocket onto them and tests drive the
//! state machine directly.

pub mod maid;
pub mod protocol;

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::config::Tuning;
use crate::error::MaisonError;
use crate::llm::{AbortHandle, LlmGateway};
use crate::memory::MemoryService;
use crate::session::SessionService;
use crate::AppState;
use maid::MaidHandler;
use protocol::{ClientMessage, Outbound, ServerMessage, CLOSE_NORMAL, CLOSE_POLICY};

/// Identity fixed at upgrade time.
#[derive(Debug, Clone)]
pub struct SocketParams {
    pub maid_id: String,
    pub user_id: String,
    pub session_id: Option<i64>,
}

/// What the reader feeds the runtime.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Closed,
}

#[derive(Debug)]
enum Job {
    Welcome,
    Input(String),
}

struct SocketState {
    jobs: VecDeque<Job>,
    stream: Option<AbortHandle>,
    closing: bool,
    /// Bumped on every abort/close; a turn whose epoch is stale stops
    /// before opening (or registering) a stream.
    epoch: u64,
    session_id: Option<i64>,
    session_created_sent: bool,
}

struct SocketShared {
    state: Mutex<SocketState>,
    wake: Notify,
    out: mpsc::Sender<Outbound>,
}

/// The capability set handlers get: send frames, manage the stream slot,
/// and reach the per-user services. Holds no back-pointer to the runtime.
pub struct TurnContext {
    pub user_id: String,
    pub maid_id: String,
    pub sessions: SessionService,
    pub memories: MemoryService,
    pub gateway: Arc<dyn LlmGateway>,
    pub tuning: Arc<Tuning>,
    session_provided: bool,
    shared: Arc<SocketShared>,
}

impl TurnContext {
    fn enqueue(&self, job: Job) {
        {
            let mut st = self.shared.state.lock();
            if st.closing {
                return;
            }
            st.jobs.push_back(job);
        }
        self.shared.wake.notify_one();
    }

    pub async fn send(&self, msg: ServerMessage) {
        // A slow or gone peer must not error into the pipeline.
        if self.shared.out.send(Outbound::Frame(msg)).await.is_err() {
            debug!(user_id = %self.user_id, "dropping frame for closed socket");
        }
    }

    /// Error frames are suppressed once the socket is closing.
    pub async fn send_error(&self, message: &str) {
        if self.is_closing() {
            return;
        }
        self.send(ServerMessage::Error { message: message.to_string() }).await;
    }

    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .shared
            .out
            .send(Outbound::Close { code, reason: reason.to_string() })
            .await;
    }

    pub fn is_closing(&self) -> bool {
        self.shared.state.lock().closing
    }

    pub fn current_epoch(&self) -> u64 {
        self.shared.state.lock().epoch
    }

    pub fn session_id(&self) -> Option<i64> {
        self.shared.state.lock().session_id
    }

    /// Record the turn's session. Returns true exactly once per socket,
    /// when a newly created session should be announced.
    pub fn adopt_session(&self, id: i64, created: bool) -> bool {
        let mut st = self.shared.state.lock();
        st.session_id = Some(id);
        if created && !st.session_created_sent {
            st.session_created_sent = true;
            true
        } else {
            false
        }
    }

    /// Park the active stream's cancel capability where abort/bye can reach
    /// it. Refused (false) when the turn was aborted while opening.
    pub fn register_stream(&self, handle: AbortHandle, epoch: u64) -> bool {
        let mut st = self.shared.state.lock();
        if st.closing || st.epoch != epoch {
            return false;
        }
        st.stream = Some(handle);
        true
    }

    pub fn clear_stream(&self) {
        self.shared.state.lock().stream = None;
    }

    /// Cancel the active stream (if any) and discard queued work.
    /// Safe no-op when idle.
    pub fn abort_active(&self) {
        let handle = {
            let mut st = self.shared.state.lock();
            st.epoch += 1;
            st.jobs.clear();
            st.stream.take()
        };
        if let Some(h) = handle {
            h.abort();
        }
    }

    fn begin_close(&self) {
        let handle = {
            let mut st = self.shared.state.lock();
            st.closing = true;
            st.epoch += 1;
            st.jobs.clear();
            st.stream.take()
        };
        if let Some(h) = handle {
            h.abort();
        }
        self.shared.wake.notify_one();
    }

    /// Graceful goodbye: mark closing, cancel everything, close 1000.
    pub async fn shutdown(&self, reason: &str) {
        self.begin_close();
        self.close(CLOSE_NORMAL, reason).await;
    }
}

// ---------------------------------------------------------------------------
// Runtime core
// ---------------------------------------------------------------------------

pub async fn run_socket(
    state: AppState,
    params: SocketParams,
    mut inbound: mpsc::Receiver<Inbound>,
    out: mpsc::Sender<Outbound>,
) {
    let Some(handler) = state.maids.get(&params.maid_id).cloned() else {
        let _ = out
            .send(Outbound::Frame(ServerMessage::Error {
                message: format!("unknown maidId: {}", params.maid_id),
            }))
            .await;
        let _ = out
            .send(Outbound::Close { code: CLOSE_POLICY, reason: "unknown maid".into() })
            .await;
        return;
    };

    let (sessions, memories) = state.services_for(&params.user_id);
    let shared = Arc::new(SocketShared {
        state: Mutex::new(SocketState {
            jobs: VecDeque::new(),
            stream: None,
            closing: false,
            epoch: 0,
            session_id: params.session_id,
            session_created_sent: false,
        }),
        wake: Notify::new(),
        out: out.clone(),
    });
    let ctx = Arc::new(TurnContext {
        user_id: params.user_id.clone(),
        maid_id: params.maid_id.clone(),
        sessions,
        memories,
        gateway: state.gateway.clone(),
        tuning: state.tuning.clone(),
        session_provided: params.session_id.is_some(),
        shared: shared.clone(),
    });

    let worker = {
        let ctx = ctx.clone();
        let handler = handler.clone();
        tokio::spawn(async move { worker_loop(ctx, handler).await })
    };

    while let Some(frame) = inbound.recv().await {
        match frame {
            Inbound::Text(text) => match protocol::parse_client_message(&text) {
                Ok(ClientMessage::Welcome) => ctx.enqueue(Job::Welcome),
                Ok(ClientMessage::Input { content }) => ctx.enqueue(Job::Input(content)),
                Ok(ClientMessage::Abort) => handler.on_abort(&ctx).await,
                Ok(ClientMessage::Bye) => {
                    handler.on_bye(&ctx).await;
                    break;
                }
                Err(reason) => ctx.send_error(&reason).await,
            },
            Inbound::Closed => break,
        }
    }

    // Transport close is an implicit abort + bye (without a close frame of
    // our own if the peer already went away).
    ctx.begin_close();
    if worker.await.is_err() {
        warn!(user_id = %params.user_id, "socket worker panicked");
    }
}

async fn worker_loop(ctx: Arc<TurnContext>, handler: Arc<dyn MaidHandler>) {
    loop {
        let job = {
            let mut st = ctx.shared.state.lock();
            if st.closing {
                return;
            }
            st.jobs.pop_front()
        };
        let Some(job) = job else {
            ctx.shared.wake.notified().await;
            continue;
        };

        let result = match job {
            Job::Welcome => handler.on_welcome(&ctx).await,
            Job::Input(content) => handler.on_input(&ctx, content).await,
        };

        if let Err(e) = result {
            match e {
                MaisonError::SessionNotFound(_) if ctx.session_provided => {
                    ctx.send_error(&e.to_string()).await;
                    ctx.close(CLOSE_POLICY, "session not found").await;
                    ctx.begin_close();
                    return;
                }
                e => {
                    warn!(
                        user_id = %ctx.user_id,
                        maid_id = %ctx.maid_id,
                        error = %e,
                        "turn failed"
                    );
                    ctx.send_error(&e.to_string()).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// axum adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "maidId")]
    pub maid_id: String,
    #[serde(rename = "connectionKey")]
    pub connection_key: Option<String>,
    /// Legacy alias: bearer token directly on the WS URL.
    pub token: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<i64>,
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, MaisonError> {
    let (user_id, key_session) = if let Some(key) = &q.connection_key {
        let entry = state.keys.consume(key).ok_or(MaisonError::Unauthorized)?;
        (entry.user_id, entry.session_id)
    } else if let Some(token) = &q.token {
        let user = state
            .auth
            .resolve_user(token)
            .await
            .ok_or(MaisonError::Unauthorized)?;
        (user, None)
    } else {
        return Err(MaisonError::Unauthorized);
    };

    let params = SocketParams {
        maid_id: q.maid_id,
        user_id,
        session_id: key_session.or(q.session_id),
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(state, params, socket)))
}

async fn handle_socket(state: AppState, params: SocketParams, socket: WebSocket) {
    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);
    let (in_tx, in_rx) = mpsc::channel::<Inbound>(64);

    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Frame(msg) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(t) => t,
                        Err(_) => continue,
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(error = %e, "websocket send failed");
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                }
            }
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(t)) => {
                    if in_tx.send(Inbound::Text(t.to_string())).await.is_err() {
                        return;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => {
                    let _ = in_tx.send(Inbound::Closed).await;
                    return;
                }
                // Binary, ping and pong frames are ignored.
                Ok(_) => {}
            }
        }
        let _ = in_tx.send(Inbound::Closed).await;
    });

    run_socket(state, params, in_rx, out_tx).await;

    // The writer drains remaining frames and exits once its channel closes;
    // the reader may still be parked on a dead socket.
    reader.abort();
    let _ = writer.await;
}
