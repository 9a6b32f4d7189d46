//! Shared utility functions for the prforge crate.

use std::time::Duration;

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Delay schedule for retrying transient failures: exponential doubling
/// from `base`, one entry per retry. An operation allowed `max_attempts`
/// tries sleeps through at most `max_attempts - 1` of these.
pub fn backoff_delays(max_attempts: u32, base: Duration) -> Vec<Duration> {
    (0..max_attempts.saturating_sub(1))
        .map(|i| base * 2u32.saturating_pow(i))
        .collect()
}

/// Truncate a string with ellipsis.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!(
            "{}...",
            &s[..s.floor_char_boundary(max_len.saturating_sub(3))]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Fix login bug", 40), "fix-login-bug");
    }

    #[test]
    fn test_slugify_collapses_punctuation() {
        assert_eq!(slugify("Add  OAuth2 / SSO support!", 40), "add-oauth2-sso-support");
    }

    #[test]
    fn test_slugify_truncates_at_limit() {
        let slug = slugify("a very long ticket title that keeps going on", 10);
        assert!(slug.len() <= 10);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"result follows: {"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": 1}} trailing"#;
        assert_eq!(extract_json_object(text), Some(r#"{"outer": {"inner": 1}}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": 1"#), None);
    }

    #[test]
    fn test_backoff_delays_doubles() {
        let delays = backoff_delays(4, Duration::from_millis(500));
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
            ]
        );
    }

    #[test]
    fn test_backoff_delays_single_attempt_has_no_retries() {
        assert!(backoff_delays(1, Duration::from_secs(1)).is_empty());
        assert!(backoff_delays(0, Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a longer string", 8), "a lon...");
    }
}
