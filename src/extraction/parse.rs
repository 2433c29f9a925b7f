//! Lenient parsers for the extraction LLM's output.
//!
//! Providers honor format hints inconsistently, so every call site accepts
//! two shapes: a JSON object (possibly inside a fenced code block, possibly
//! surrounded by prose) and a plain line-delimited form.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEvent {
    Add,
    Update,
    Delete,
    None,
}

impl MemoryEvent {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "ADD" => Some(MemoryEvent::Add),
            "UPDATE" => Some(MemoryEvent::Update),
            "DELETE" => Some(MemoryEvent::Delete),
            "NONE" => Some(MemoryEvent::None),
            _ => Option::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryEvent::Add => "ADD",
            MemoryEvent::Update => "UPDATE",
            MemoryEvent::Delete => "DELETE",
            MemoryEvent::None => "NONE",
        }
    }
}

/// One reconciliation decision, keyed by a temp id ("0", "1", ...).
/// Real database ids never appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAction {
    pub id: String,
    pub text: String,
    pub event: MemoryEvent,
    pub old_memory: Option<String>,
}

/// Drop markdown fence lines, keeping whatever is between them.
fn strip_fences(raw: &str) -> String {
    if !raw.contains("```") {
        return raw.to_string();
    }
    raw.lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// First balanced `{...}` region, string-aware. Returns `None` when no
/// complete object exists.
fn balanced_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, fact: &str) {
    let fact = fact.trim();
    if !fact.is_empty() && seen.insert(fact.to_string()) {
        out.push(fact.to_string());
    }
}

/// Facts from either `{"facts": [...]}`, a bare JSON array, or `FACT:` lines.
/// The sole word `NONE` (and unparseable output) yields an empty set.
pub fn parse_facts(raw: &str) -> Vec<String> {
    let cleaned = strip_fences(raw);
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    if let Some(region) = balanced_json_object(&cleaned) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(region) {
            if let Some(arr) = v.get("facts").and_then(|f| f.as_array()) {
                for item in arr {
                    if let Some(s) = item.as_str() {
                        push_unique(&mut out, &mut seen, s);
                    }
                }
                return out;
            }
        }
    }

    // Bare JSON array of strings.
    let trimmed = cleaned.trim();
    if trimmed.starts_with('[') {
        if let Ok(arr) = serde_json::from_str::<Vec<String>>(trimmed) {
            for s in &arr {
                push_unique(&mut out, &mut seen, s);
            }
            return out;
        }
    }

    for line in cleaned.lines() {
        let line = line.trim();
        if line.eq_ignore_ascii_case("none") {
            return Vec::new();
        }
        if let Some(fact) = line.strip_prefix("FACT:") {
            push_unique(&mut out, &mut seen, fact);
        }
    }
    out
}

fn action_from_json(entry: &serde_json::Value) -> Option<MemoryAction> {
    let id = match entry.get("id") {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return None,
    };
    let event = MemoryEvent::from_token(entry.get("event")?.as_str()?)?;
    let text = entry
        .get("text")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();
    let old_memory = entry
        .get("old_memory")
        .and_then(|t| t.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(MemoryAction { id, text, event, old_memory })
}

fn action_from_line(line: &str) -> Option<MemoryAction> {
    let parts: Vec<&str> = line.split('|').map(str::trim).collect();
    if parts.len() < 2 {
        return None;
    }
    let event = MemoryEvent::from_token(parts[0])?;
    let id = parts[1];
    if id.is_empty() {
        return None;
    }
    let text = parts.get(2).copied().unwrap_or_default().to_string();
    let old_memory = parts
        .get(3)
        .copied()
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(MemoryAction { id: id.to_string(), text, event, old_memory })
}

/// Actions from either `{"memory": [...]}` or `EVENT|ID|TEXT|OLD_MEMORY`
/// lines. Unknown event tokens and missing ids are filtered out.
pub fn parse_actions(raw: &str) -> Vec<MemoryAction> {
    let cleaned = strip_fences(raw);

    if let Some(region) = balanced_json_object(&cleaned) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(region) {
            if let Some(arr) = v.get("memory").and_then(|m| m.as_array()) {
                return arr.iter().filter_map(action_from_json).collect();
            }
        }
    }

    cleaned
        .lines()
        .filter(|l| l.contains('|'))
        .filter_map(action_from_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facts_from_json_object() {
        let raw = r#"{"facts": ["likes tea", "lives in Kyoto", "likes tea"]}"#;
        assert_eq!(parse_facts(raw), vec!["likes tea", "lives in Kyoto"]);
    }

    #[test]
    fn facts_from_fenced_json_with_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"facts\": [\"owns a cat\"]}\n```\nHope that helps.";
        assert_eq!(parse_facts(raw), vec!["owns a cat"]);
    }

    #[test]
    fn facts_from_lines() {
        let raw = "FACT: plays piano\nirrelevant chatter\nFACT: allergic to peanuts";
        assert_eq!(parse_facts(raw), vec!["plays piano", "allergic to peanuts"]);
    }

    #[test]
    fn facts_none_is_empty() {
        assert!(parse_facts("NONE").is_empty());
        assert!(parse_facts("none").is_empty());
        assert!(parse_facts("").is_empty());
        assert!(parse_facts("no structured output here").is_empty());
    }

    #[test]
    fn facts_from_bare_array() {
        assert_eq!(parse_facts(r#"["a", "b"]"#), vec!["a", "b"]);
    }

    #[test]
    fn actions_round_trip_both_encodings() {
        let json = r#"{"memory": [
            {"id": "0", "text": "likes green tea", "event": "UPDATE", "old_memory": "likes tea"},
            {"id": "1", "text": "", "event": "DELETE"},
            {"id": "2", "text": "new fact", "event": "ADD"},
            {"id": "3", "text": "kept", "event": "NONE"}
        ]}"#;
        let lines = "UPDATE|0|likes green tea|likes tea\nDELETE|1\nADD|2|new fact\nNONE|3|kept";
        assert_eq!(parse_actions(json), parse_actions(lines));
    }

    #[test]
    fn actions_filter_unknown_events_and_missing_ids() {
        let raw = r#"{"memory": [
            {"id": "0", "text": "x", "event": "MERGE"},
            {"text": "no id", "event": "ADD"},
            {"id": "1", "text": "ok", "event": "ADD"}
        ]}"#;
        let actions = parse_actions(raw);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id, "1");
    }

    #[test]
    fn actions_accept_numeric_ids() {
        let raw = r#"{"memory": [{"id": 4, "text": "t", "event": "NONE"}]}"#;
        let actions = parse_actions(raw);
        assert_eq!(actions[0].id, "4");
    }

    #[test]
    fn actions_from_fenced_json() {
        let raw = "```\n{\"memory\": [{\"id\": \"0\", \"text\": \"t\", \"event\": \"ADD\"}]}\n```";
        assert_eq!(parse_actions(raw).len(), 1);
    }

    #[test]
    fn line_form_garbage_skipped() {
        let actions = parse_actions("WHAT|\nADD|\n|0|text\nDELETE|7");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].event, MemoryEvent::Delete);
        assert_eq!(actions[0].id, "7");
    }

    #[test]
    fn balanced_region_ignores_braces_in_strings() {
        let raw = r#"noise {"facts": ["uses {braces} daily"]} trailing"#;
        assert_eq!(parse_facts(raw), vec!["uses {braces} daily"]);
    }
}
