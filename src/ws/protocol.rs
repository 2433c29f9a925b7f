//! JSON frame schema for the chat socket.

use serde::{Deserialize, Serialize};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY: u16 = 1008;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Welcome,
    Input { content: String },
    Abort,
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: i64,
    },
    StreamStart,
    StreamTextDelta {
        delta: String,
    },
    StreamDone {
        #[serde(rename = "sessionId")]
        session_id: i64,
    },
    Error {
        message: String,
    },
}

/// What the runtime hands to the socket writer.
#[derive(Debug, PartialEq, Eq)]
pub enum Outbound {
    Frame(ServerMessage),
    Close { code: u16, reason: String },
}

/// Parse and validate one client frame. Malformed JSON yields the literal
/// "invalid JSON"; schema violations yield "<path>: <message>".
pub fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| "invalid JSON".to_string())?;

    let msg: ClientMessage = serde_json::from_value(value).map_err(|e| {
        let raw = e.to_string();
        if let Some(rest) = raw.strip_prefix("missing field `") {
            let field = rest.split('`').next().unwrap_or("field");
            format!("{field}: required")
        } else if raw.starts_with("unknown variant") {
            format!("type: {raw}")
        } else {
            raw
        }
    })?;

    if let ClientMessage::Input { content } = &msg {
        if content.is_empty() {
            return Err("content: must contain at least 1 character".into());
        }
    }
    Ok(msg)
}
