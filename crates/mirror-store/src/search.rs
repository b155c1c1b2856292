//! Search tokens.
//!
//! Tokens are derived from plaintext at write time and stored unencrypted so
//! lookups never decrypt. This trades some privacy (words are visible in the
//! database file) for search that works without the key.

use std::collections::HashSet;

pub const MAX_TOKEN_CHARS: usize = 64;

/// Lowercased alphanumeric runs, deduplicated in first-seen order.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase().chars().take(MAX_TOKEN_CHARS).collect::<String>())
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

/// Every query token is a substring of at least one record token.
#[must_use]
pub fn matches_all<Q, R>(query: &[Q], record: &[R]) -> bool
where
    Q: AsRef<str>,
    R: AsRef<str>,
{
    !query.is_empty()
        && query.iter().all(|needle| {
            record
                .iter()
                .any(|token| token.as_ref().contains(needle.as_ref()))
        })
}
