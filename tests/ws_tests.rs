//! End-to-end socket scenarios, driven through the runtime's channel seam.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_state, MockGateway, StreamScript};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use maison::store::Role;
use maison::ws::protocol::{Outbound, ServerMessage};
use maison::ws::{run_socket, Inbound, SocketParams};
use maison::AppState;

const SLOW_DEBOUNCE: Duration = Duration::from_secs(60);

struct Socket {
    tx: mpsc::Sender<Inbound>,
    rx: mpsc::Receiver<Outbound>,
    task: JoinHandle<()>,
}

fn connect(state: &AppState, maid_id: &str, user_id: &str, session_id: Option<i64>) -> Socket {
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, out_rx) = mpsc::channel(64);
    let params = SocketParams {
        maid_id: maid_id.into(),
        user_id: user_id.into(),
        session_id,
    };
    let task = tokio::spawn(run_socket(state.clone(), params, in_rx, out_tx));
    Socket { tx: in_tx, rx: out_rx, task }
}

impl Socket {
    async fn send(&self, text: &str) {
        self.tx.send(Inbound::Text(text.to_string())).await.unwrap();
    }

    async fn recv(&mut self) -> Outbound {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("frame within 2s")
            .expect("socket still open")
    }

    async fn recv_frame(&mut self) -> ServerMessage {
        match self.recv().await {
            Outbound::Frame(msg) => msg,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    /// True if nothing arrives for the window.
    async fn silent_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.rx.recv()).await.is_err()
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

// --- S1: happy input turn, new session ---

#[tokio::test]
async fn input_turn_creates_session_and_streams() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::completed(&["pong"]));
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send(r#"{"type":"input","content":"Say exactly: \"pong\""}"#).await;

    let session_id = match sock.recv_frame().await {
        ServerMessage::SessionCreated { session_id } => session_id,
        other => panic!("expected session_created, got {other:?}"),
    };
    assert!(session_id > 0);
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamStart);
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamTextDelta { delta: "pong".into() });
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamDone { session_id });

    let store = state.store.clone();
    wait_for(
        || store.list_messages_by_session(session_id, 10).unwrap().len() == 2,
        "user + assistant persisted",
    )
    .await;
    let msgs = store.list_messages_by_session(session_id, 10).unwrap();
    assert_eq!(msgs[0].role, Role::Assistant);
    assert_eq!(msgs[0].content, "pong");
    assert_eq!(msgs[1].role, Role::User);
}

// --- S2: welcome turn, new session ---

#[tokio::test]
async fn welcome_turn_persists_only_assistant() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::completed(&["Hi", " again!"]));
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send(r#"{"type":"welcome"}"#).await;

    let session_id = match sock.recv_frame().await {
        ServerMessage::SessionCreated { session_id } => session_id,
        other => panic!("expected session_created, got {other:?}"),
    };
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamStart);
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamTextDelta { delta: "Hi".into() });
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamTextDelta { delta: " again!".into() });
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamDone { session_id });

    let store = state.store.clone();
    wait_for(
        || store.list_messages_by_session(session_id, 10).unwrap().len() == 1,
        "assistant message persisted",
    )
    .await;
    let msgs = store.list_messages_by_session(session_id, 10).unwrap();
    assert_eq!(msgs[0].role, Role::Assistant);
    assert_eq!(msgs[0].content, "Hi again!");
}

// --- S3: resume existing session ---

#[tokio::test]
async fn resumed_session_skips_session_created() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::completed(&["hello again"]));
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let sid = state.store.insert_session("alice").unwrap().id;
    let mut sock = connect(&state, "chat", "alice", Some(sid));

    sock.send(r#"{"type":"input","content":"Hello again"}"#).await;

    assert_eq!(sock.recv_frame().await, ServerMessage::StreamStart, "no session_created");
    assert_eq!(
        sock.recv_frame().await,
        ServerMessage::StreamTextDelta { delta: "hello again".into() }
    );
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamDone { session_id: sid });
}

// --- S4: abort mid-stream ---

#[tokio::test]
async fn abort_mid_stream_drops_the_turn() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::slow(
        &["one", "two", "three", "four"],
        Duration::from_millis(80),
    ));
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send(r#"{"type":"input","content":"write a long story"}"#).await;

    let session_id = match sock.recv_frame().await {
        ServerMessage::SessionCreated { session_id } => session_id,
        other => panic!("expected session_created, got {other:?}"),
    };
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamStart);
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamTextDelta { delta: "one".into() });

    sock.send(r#"{"type":"abort"}"#).await;

    // No stream_done, no error; at most a raced delta may still arrive.
    loop {
        match tokio::time::timeout(Duration::from_millis(400), sock.rx.recv()).await {
            Err(_) => break,
            Ok(Some(Outbound::Frame(ServerMessage::StreamTextDelta { .. }))) => continue,
            Ok(other) => panic!("unexpected after abort: {other:?}"),
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let msgs = state.store.list_messages_by_session(session_id, 10).unwrap();
    assert_eq!(msgs.len(), 1, "user message persisted, assistant not");
    assert_eq!(msgs[0].role, Role::User);
}

// --- abort while idle is a no-op ---

#[tokio::test]
async fn abort_when_idle_is_safe() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::completed(&["fine"]));
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send(r#"{"type":"abort"}"#).await;
    assert!(sock.silent_for(Duration::from_millis(150)).await);

    // The socket still works afterwards.
    sock.send(r#"{"type":"input","content":"still alive?"}"#).await;
    assert!(matches!(sock.recv_frame().await, ServerMessage::SessionCreated { .. }));
}

// --- S5: invalid JSON keeps the socket open ---

#[tokio::test]
async fn invalid_json_then_graceful_bye() {
    let gateway = MockGateway::new();
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send("not json at all").await;
    assert_eq!(
        sock.recv_frame().await,
        ServerMessage::Error { message: "invalid JSON".into() }
    );

    sock.send(r#"{"type":"bye"}"#).await;
    match sock.recv().await {
        Outbound::Close { code, .. } => assert_eq!(code, 1000),
        other => panic!("expected close, got {other:?}"),
    }
    let _ = sock.task.await;
}

#[tokio::test]
async fn schema_violation_names_the_field() {
    let gateway = MockGateway::new();
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send(r#"{"type":"input"}"#).await;
    match sock.recv_frame().await {
        ServerMessage::Error { message } => assert_eq!(message, "content: required"),
        other => panic!("expected error, got {other:?}"),
    }
}

// --- S6: unknown maid ---

#[tokio::test]
async fn unknown_maid_errors_and_closes_1008() {
    let gateway = MockGateway::new();
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "nonexistent", "alice", None);

    assert_eq!(
        sock.recv_frame().await,
        ServerMessage::Error { message: "unknown maidId: nonexistent".into() }
    );
    match sock.recv().await {
        Outbound::Close { code, reason } => {
            assert_eq!(code, 1008);
            assert_eq!(reason, "unknown maid");
        }
        other => panic!("expected close, got {other:?}"),
    }
}

// --- S7: session not found ---

#[tokio::test]
async fn foreign_session_errors_and_closes_1008() {
    let gateway = MockGateway::new();
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let sid = state.store.insert_session("bob").unwrap().id;
    let mut sock = connect(&state, "chat", "alice", Some(sid));

    sock.send(r#"{"type":"input","content":"hello"}"#).await;

    match sock.recv_frame().await {
        ServerMessage::Error { message } => assert!(message.contains("not found")),
        other => panic!("expected error, got {other:?}"),
    }
    match sock.recv().await {
        Outbound::Close { code, .. } => assert_eq!(code, 1008),
        other => panic!("expected close, got {other:?}"),
    }
}

// --- turn serialization: frames of turn N fully precede turn N+1 ---

#[tokio::test]
async fn queued_turns_do_not_interleave() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::slow(&["first"], Duration::from_millis(40)));
    gateway.push_stream(StreamScript::completed(&["second"]));
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send(r#"{"type":"input","content":"turn one"}"#).await;
    sock.send(r#"{"type":"input","content":"turn two"}"#).await;

    let mut frames = Vec::new();
    loop {
        let frame = sock.recv_frame().await;
        let done = matches!(&frame, ServerMessage::StreamDone { .. });
        frames.push(frame);
        if done && frames.iter().filter(|f| matches!(f, ServerMessage::StreamDone { .. })).count() == 2
        {
            break;
        }
    }

    let expect_deltas: Vec<String> = frames
        .iter()
        .filter_map(|f| match f {
            ServerMessage::StreamTextDelta { delta } => Some(delta.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(expect_deltas, vec!["first", "second"], "strict FIFO turn order");

    // stream_start / stream_done alternate, never nest.
    let mut open = false;
    for f in &frames {
        match f {
            ServerMessage::StreamStart => {
                assert!(!open, "stream_start while previous turn open");
                open = true;
            }
            ServerMessage::StreamDone { .. } => {
                assert!(open, "stream_done without stream_start");
                open = false;
            }
            _ => {}
        }
    }
}

// --- session_created emitted once, before the first stream_start ---

#[tokio::test]
async fn session_created_once_per_socket() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::completed(&["a"]));
    gateway.push_stream(StreamScript::completed(&["b"]));
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send(r#"{"type":"input","content":"one"}"#).await;
    sock.send(r#"{"type":"input","content":"two"}"#).await;

    let mut created = 0;
    let mut dones = 0;
    let mut saw_stream_start_before_created = false;
    let mut saw_any_start = false;
    while dones < 2 {
        match sock.recv_frame().await {
            ServerMessage::SessionCreated { .. } => {
                created += 1;
                if saw_any_start {
                    saw_stream_start_before_created = true;
                }
            }
            ServerMessage::StreamStart => saw_any_start = true,
            ServerMessage::StreamDone { .. } => dones += 1,
            _ => {}
        }
    }
    assert_eq!(created, 1);
    assert!(!saw_stream_start_before_created);
}

// --- input prompt excludes the just-saved message, carries memories block ---

#[tokio::test]
async fn input_prompt_layout() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::completed(&["sure"]));
    let state = test_state(gateway.clone(), SLOW_DEBOUNCE);
    let sid = state.store.insert_session("alice").unwrap().id;
    state.store.append_message(sid, Role::User, "earlier message", None).unwrap();
    let mut sock = connect(&state, "chat", "alice", Some(sid));

    sock.send(r#"{"type":"input","content":"what did I say before?"}"#).await;
    while !matches!(sock.recv_frame().await, ServerMessage::StreamDone { .. }) {}

    let prompts = gateway.stream_prompts.lock();
    let prompt = &prompts[0];
    assert!(prompt.contains("<memories>"));
    assert!(prompt.contains("<history>"));
    assert!(prompt.contains("[user]: earlier message"));
    assert!(prompt.ends_with("[user]: what did I say before?"));
    let history_block = prompt.split("<history>").nth(1).unwrap().split("</history>").next().unwrap();
    assert!(
        !history_block.contains("what did I say before?"),
        "just-saved message must not repeat in history"
    );
}

// --- llm failure surfaces an error frame, socket stays open ---

#[tokio::test]
async fn stream_error_emits_error_frame_and_keeps_socket() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::failing("upstream reset"));
    gateway.push_stream(StreamScript::completed(&["recovered"]));
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send(r#"{"type":"input","content":"first"}"#).await;
    let mut got_error = false;
    loop {
        match sock.recv_frame().await {
            ServerMessage::Error { message } => {
                assert!(message.contains("LLM backend error"));
                got_error = true;
                break;
            }
            ServerMessage::SessionCreated { .. } | ServerMessage::StreamStart => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(got_error);

    // Still usable for the next turn.
    sock.send(r#"{"type":"input","content":"second"}"#).await;
    loop {
        if matches!(sock.recv_frame().await, ServerMessage::StreamDone { .. }) {
            break;
        }
    }
}

// --- transport close mid-stream cancels without persistence ---

#[tokio::test]
async fn transport_close_acts_as_abort() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::slow(&["a", "b", "c"], Duration::from_millis(80)));
    let state = test_state(gateway, SLOW_DEBOUNCE);
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send(r#"{"type":"input","content":"long one"}"#).await;
    let session_id = match sock.recv_frame().await {
        ServerMessage::SessionCreated { session_id } => session_id,
        other => panic!("expected session_created, got {other:?}"),
    };
    assert_eq!(sock.recv_frame().await, ServerMessage::StreamStart);

    sock.tx.send(Inbound::Closed).await.unwrap();
    let _ = sock.task.await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    let msgs = state.store.list_messages_by_session(session_id, 10).unwrap();
    assert_eq!(msgs.len(), 1, "only the user message survives");
}

// --- full loop: turn completion signals extraction, memory appears ---

#[tokio::test]
async fn completed_turn_eventually_yields_memories() {
    let gateway = MockGateway::new();
    gateway.push_stream(StreamScript::completed(&["noted!"]));
    gateway.push_structured(r#"{"facts": ["is vegetarian"]}"#);
    gateway.push_structured(r#"{"memory": [{"id": "0", "text": "is vegetarian", "event": "ADD"}]}"#);
    let state = test_state(gateway, Duration::from_millis(50));
    let mut sock = connect(&state, "chat", "alice", None);

    sock.send(r#"{"type":"input","content":"I'm vegetarian by the way"}"#).await;
    while !matches!(sock.recv_frame().await, ServerMessage::StreamDone { .. }) {}

    let store = state.store.clone();
    wait_for(
        || {
            store
                .list_recent_memories("alice", 10)
                .map(|m| m.iter().any(|m| m.content == "is vegetarian"))
                .unwrap_or(false)
        },
        "extracted memory",
    )
    .await;
    wait_for(
        || store.list_pending_messages("alice").map(|p| p.is_empty()).unwrap_or(false),
        "messages marked extracted",
    )
    .await;
}
