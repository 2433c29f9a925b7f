/// Cap a string at `max` characters, appending "…" when cut. Counts chars,
/// not bytes, so multi-byte content never splits.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}…")
    }
}

/// Canonical form used when comparing fact and memory texts: lowercase,
/// non-alphanumeric runs become single spaces, whitespace collapsed.
/// Idempotent — normalize(normalize(s)) == normalize(s).
pub fn normalize(s: &str) -> String {
    let lowered: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_passthrough() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }

    #[test]
    fn truncate_appends_ellipsis() {
        assert_eq!(truncate_chars("hello world", 5), "hello…");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("  Hello, World!!  ");
        assert_eq!(once, "hello world");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn normalize_case_and_punctuation_insensitive() {
        assert_eq!(normalize("User prefers DARK mode."), normalize("user prefers dark mode"));
        assert_eq!(normalize("a--b__c"), "a b c");
    }

    #[test]
    fn normalize_empty_and_symbols_only() {
        assert_eq!(normalize("!!! ???"), "");
        assert_eq!(normalize(""), "");
    }
}
