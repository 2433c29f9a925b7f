//! Maid handlers: the pluggable per-connection event surface. The runtime
//! dispatches by `maidId` over a static table built at startup; polymorphism
//! is over these four methods only.

use async_trait::async_trait;
use tracing::warn;

use super::protocol::ServerMessage;
use super::TurnContext;
use crate::error::MaisonError;
use crate::llm::StreamEvent;
use crate::prompts;
use crate::store::Role;

#[async_trait]
pub trait MaidHandler: Send + Sync {
    async fn on_welcome(&self, ctx: &TurnContext) -> Result<(), MaisonError>;
    async fn on_input(&self, ctx: &TurnContext, content: String) -> Result<(), MaisonError>;

    /// Cancel current work. Bypasses the work queue.
    async fn on_abort(&self, ctx: &TurnContext) {
        ctx.abort_active();
    }

    /// Graceful close. Bypasses the work queue.
    async fn on_bye(&self, ctx: &TurnContext) {
        ctx.shutdown("bye").await;
    }
}

enum TurnKind {
    Welcome,
    Input { content: String },
}

enum StreamEnd {
    Completed,
    Aborted,
    Failed(String),
}

/// The standard conversational maid.
pub struct ChatMaid;

impl ChatMaid {
    /// Shared turn pipeline: resolve the session, optionally persist the
    /// user message, build a prompt, stream the response, persist the
    /// assistant message and signal extraction.
    async fn respond_with_stream(
        &self,
        ctx: &TurnContext,
        kind: TurnKind,
    ) -> Result<(), MaisonError> {
        let epoch = ctx.current_epoch();

        let (session, created) = ctx.sessions.ensure_session(ctx.session_id()).await?;
        if ctx.adopt_session(session.id, created) {
            ctx.send(ServerMessage::SessionCreated { session_id: session.id }).await;
        }

        if let TurnKind::Input { content } = &kind {
            ctx.sessions
                .save_message(session.id, Role::User, content, None)
                .await?;
        }

        let prompt = match &kind {
            TurnKind::Welcome => {
                let (history, memories) = tokio::try_join!(
                    ctx.sessions.list_recent(session.id, ctx.tuning.history_limit, false),
                    ctx.memories.recent_memories(ctx.tuning.memory_limit),
                )?;
                let mut history = history;
                history.reverse();
                prompts::welcome_prompt(&memories, &history)
            }
            TurnKind::Input { content } => {
                let (history, related) = tokio::try_join!(
                    ctx.sessions.list_recent(session.id, ctx.tuning.history_limit, true),
                    // Threshold 0: the nearest K regardless of similarity.
                    ctx.memories.related_memories(content, ctx.tuning.memory_limit, 0.0),
                )?;
                // The just-saved user message sits at index 0 of the
                // desc-ordered result; the prompt carries it separately.
                let mut history: Vec<_> = history.into_iter().skip(1).collect();
                history.reverse();
                prompts::input_prompt(&related, &history, content)
            }
        };

        // An abort that landed while we were gathering context cancels the
        // turn before anything is streamed.
        if ctx.current_epoch() != epoch || ctx.is_closing() {
            return Ok(());
        }

        ctx.send(ServerMessage::StreamStart).await;
        let mut stream = ctx.gateway.stream_response(&prompt, None).await?;
        if !ctx.register_stream(stream.handle.clone(), epoch) {
            stream.handle.abort();
        }

        let mut assistant_text = String::new();
        let end = loop {
            match stream.events.recv().await {
                Some(StreamEvent::Delta(delta)) => {
                    assistant_text.push_str(&delta);
                    ctx.send(ServerMessage::StreamTextDelta { delta }).await;
                }
                Some(StreamEvent::Completed) => break StreamEnd::Completed,
                Some(StreamEvent::Aborted) => break StreamEnd::Aborted,
                Some(StreamEvent::Error(e)) => break StreamEnd::Failed(e),
                None => break StreamEnd::Failed("stream ended without terminal event".into()),
            }
        };
        ctx.clear_stream();

        match end {
            StreamEnd::Completed => {
                ctx.send(ServerMessage::StreamDone { session_id: session.id }).await;
                let text = assistant_text.trim();
                if !text.is_empty() {
                    ctx.sessions
                        .save_message(session.id, Role::Assistant, text, None)
                        .await?;
                }
                ctx.memories.signal_extraction();
                Ok(())
            }
            // The abort path already ran its cleanup; no stream_done, no
            // assistant persistence, no extraction signal.
            StreamEnd::Aborted => Ok(()),
            StreamEnd::Failed(e) => {
                warn!(user_id = %ctx.user_id, error = %e, "llm stream failed");
                Err(MaisonError::LlmBackend(e))
            }
        }
    }
}

#[async_trait]
impl MaidHandler for ChatMaid {
    async fn on_welcome(&self, ctx: &TurnContext) -> Result<(), MaisonError> {
        self.respond_with_stream(ctx, TurnKind::Welcome).await
    }

    async fn on_input(&self, ctx: &TurnContext, content: String) -> Result<(), MaisonError> {
        self.respond_with_stream(ctx, TurnKind::Input { content }).await
    }
}
