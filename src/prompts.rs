//! Centralised prompt texts.
//!
//! Every LLM prompt lives here so it can be audited and tuned in one place.
//! The extraction prompts spell out BOTH accepted output shapes because
//! providers honor format hints inconsistently; the parsers in
//! `extraction::parse` accept either.

use crate::store::{Memory, Message, ScoredMemory};
use crate::util::truncate_chars;

// A runaway message or memory must not blow up the prompt; history entries
// get more room than memory lines.
const HISTORY_CONTENT_MAX: usize = 2000;
const MEMORY_CONTENT_MAX: usize = 400;

// ---------------------------------------------------------------------------
// extraction — fact derivation
// ---------------------------------------------------------------------------

pub const FACT_RULES: &str = r#"You are a memory extraction engine. Given a chat transcript, extract discrete facts about the USER worth remembering long-term: identity, preferences, decisions, relationships, constraints, plans.

Rules:
- Each fact must be self-contained (understandable without the transcript).
- Prefer concise facts (under 200 chars) over verbose ones.
- Skip transient states, debug output, pleasantries, and anything about the assistant itself.
- Zero facts is fine if nothing is worth remembering.

Output EXACTLY one of:
1. A JSON object: {"facts": ["...", "..."]}
2. One fact per line, each prefixed "FACT: "
3. The single word NONE if there is nothing to extract."#;

pub fn fact_prompt(transcript: &str) -> String {
    format!("{FACT_RULES}\n\nTranscript:\n{transcript}")
}

// ---------------------------------------------------------------------------
// extraction — reconciliation against existing memories
// ---------------------------------------------------------------------------

pub const RECONCILE_RULES: &str = r#"You maintain a user's long-term memory. Compare the NEW FACTS against the EXISTING memories and decide, for each memory and fact, one of:
- ADD: the fact is new knowledge; create a memory with a fresh id beyond the existing ones.
- UPDATE: an existing memory is stale or less complete; rewrite it. Keep the same id and put the previous text in old_memory.
- DELETE: an existing memory is contradicted by a new fact.
- NONE: the existing memory is still accurate; keep it unchanged.

Rules:
- Use ONLY the ids shown in EXISTING (plus fresh ids for ADD). Never invent other ids.
- Do not create duplicates: if a fact is already covered, the memory is NONE.
- Preserve specific names, numbers and dates; never vague them away.

Output EXACTLY one of:
1. A JSON object: {"memory": [{"id": "0", "text": "...", "event": "UPDATE", "old_memory": "..."}, ...]}
2. One action per line: EVENT|ID|TEXT|OLD_MEMORY (OLD_MEMORY only for UPDATE)."#;

pub fn reconcile_prompt(existing: &[(String, String)], facts: &[String]) -> String {
    let mut out = String::from(RECONCILE_RULES);
    out.push_str("\n\nEXISTING:\n");
    if existing.is_empty() {
        out.push_str("(none)\n");
    }
    for (id, text) in existing {
        out.push_str(&format!("{id}: {text}\n"));
    }
    out.push_str("\nNEW FACTS:\n");
    for fact in facts {
        out.push_str(&format!("- {fact}\n"));
    }
    out
}

// ---------------------------------------------------------------------------
// chat turns
// ---------------------------------------------------------------------------

pub const CHAT_PREAMBLE: &str = "You are a warm, attentive assistant. You remember what the user has told you before and weave it in naturally — never recite memories back verbatim, never mention that you keep memories.";

pub const WELCOME_CLOSING: &str = "Write a natural first message greeting the user. If the memories or history suggest something to pick up on, do so briefly; otherwise keep it simple and open.";

fn memories_block(lines: &[String]) -> String {
    if lines.is_empty() {
        "<memories>\n(none yet)\n</memories>".to_string()
    } else {
        format!("<memories>\n{}\n</memories>", lines.join("\n"))
    }
}

fn history_block(messages: &[Message]) -> String {
    if messages.is_empty() {
        "<history>\n(empty)\n</history>".to_string()
    } else {
        let lines: Vec<String> = messages
            .iter()
            .map(|m| {
                format!(
                    "[{}]: {}",
                    m.role.as_str(),
                    truncate_chars(&m.content, HISTORY_CONTENT_MAX)
                )
            })
            .collect();
        format!("<history>\n{}\n</history>", lines.join("\n"))
    }
}

/// Welcome turn: recent cross-session context, recently updated memories,
/// and an instruction to open the conversation.
pub fn welcome_prompt(memories: &[Memory], history: &[Message]) -> String {
    let lines: Vec<String> = memories
        .iter()
        .map(|m| format!("- {}", truncate_chars(&m.content, MEMORY_CONTENT_MAX)))
        .collect();
    format!(
        "{CHAT_PREAMBLE}\n\n{}\n\n{}\n\n{WELCOME_CLOSING}",
        memories_block(&lines),
        history_block(history),
    )
}

/// Input turn: same-session history, memories related to the user's message,
/// and the message itself as the trailing line.
pub fn input_prompt(related: &[ScoredMemory], history: &[Message], content: &str) -> String {
    let lines: Vec<String> = related
        .iter()
        .map(|m| format!("- {}", truncate_chars(&m.memory.content, MEMORY_CONTENT_MAX)))
        .collect();
    format!(
        "{CHAT_PREAMBLE}\n\n{}\n\n{}\n\n[user]: {content}",
        memories_block(&lines),
        history_block(history),
    )
}
