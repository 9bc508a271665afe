//! Post-response trigger matching.
//!
//! Disambiguation, documented to module authors: a literal `*` always
//! matches; otherwise, if the pattern compiles as a regular expression it is
//! matched against the latest user message and assistant reply; only a
//! pattern that fails to compile falls back to a case-insensitive keyword
//! set (whitespace-separated, substring match).  Most single keywords are
//! themselves valid regexes, so the keyword path is effectively for
//! patterns with unbalanced metacharacters.

use regex::Regex;

pub fn trigger_matches(pattern: &str, user_message: &str, assistant_message: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }

    if let Ok(re) = Regex::new(pattern) {
        return re.is_match(user_message) || re.is_match(assistant_message);
    }

    let user = user_message.to_lowercase();
    let assistant = assistant_message.to_lowercase();
    pattern.split_whitespace().any(|keyword| {
        let keyword = keyword.to_lowercase();
        user.contains(&keyword) || assistant.contains(&keyword)
    })
}
