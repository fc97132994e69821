//! Shared utility functions used across the codebase.

use axum::http::StatusCode;

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Quote a value for safe interpolation into a POSIX shell command.
///
/// Every caller-supplied path, prompt or argument that ends up inside a
/// `bash -c` string must pass through here.
pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '=' | ',' | '+'))
    {
        return value.to_string();
    }
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Human-readable duration (`45s`, `2m`, `2m 15s`).
pub fn format_elapsed(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{}s", seconds);
    }
    let minutes = seconds / 60;
    let rest = seconds % 60;
    if rest == 0 {
        format!("{}m", minutes)
    } else {
        format!("{}m {}s", minutes, rest)
    }
}

/// Keep the head and tail of an oversized output, dropping the middle.
///
/// `keep` characters are kept from each end. Returns the input unchanged when
/// it is at most `limit` characters long.
pub fn truncate_middle(output: &str, limit: usize, keep: usize, notice: &str) -> String {
    let total = output.chars().count();
    if total <= limit {
        return output.to_string();
    }
    let head: String = output.chars().take(keep).collect();
    let tail: String = output.chars().skip(total.saturating_sub(keep)).collect();
    format!("{}{}{}", head, notice, tail)
}

pub fn internal_error<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_leaves_plain_words_alone() {
        assert_eq!(shell_quote("/home/assistant/file.txt"), "/home/assistant/file.txt");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn shell_quote_wraps_metacharacters() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$(rm -rf ~)"), "'$(rm -rf ~)'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn format_elapsed_variants() {
        assert_eq!(format_elapsed(45), "45s");
        assert_eq!(format_elapsed(120), "2m");
        assert_eq!(format_elapsed(135), "2m 15s");
    }

    #[test]
    fn truncate_middle_keeps_both_ends() {
        let input = "a".repeat(10) + &"b".repeat(10);
        let out = truncate_middle(&input, 12, 3, "...");
        assert_eq!(out, "aaa...bbb");
        assert_eq!(truncate_middle("short", 12, 3, "..."), "short");
    }
}
