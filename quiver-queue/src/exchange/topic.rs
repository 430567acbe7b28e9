//! Routing keys and topic patterns.
//!
//! A routing key is one or more dot-separated words of ASCII alphanumerics,
//! `_` and `-`. A topic pattern may also use `*` for exactly one word and
//! `#` for zero or more words.

use crate::error::{QueueError, QueueResult};

fn valid_word(word: &str) -> bool {
    !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate a routing key.
pub fn validate_routing_key(key: &str) -> QueueResult<()> {
    if key.split('.').all(valid_word) {
        Ok(())
    } else {
        Err(QueueError::InvalidRoutingKey(key.to_string()))
    }
}

/// Validate a topic binding pattern.
pub fn validate_pattern(pattern: &str) -> QueueResult<()> {
    if pattern
        .split('.')
        .all(|word| word == "*" || word == "#" || valid_word(word))
    {
        Ok(())
    } else {
        Err(QueueError::InvalidRoutingKey(pattern.to_string()))
    }
}

/// Check a routing key against a topic pattern.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

/// Table-driven match: `reached[j]` holds when the pattern words seen so far
/// consume exactly the first `j` key words. Runs in `O(pattern * key)`.
fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    let mut reached = vec![false; key.len() + 1];
    reached[0] = true;
    for &word in pattern {
        if word == "#" {
            // zero or more words: once reachable, every later prefix is too
            if let Some(first) = reached.iter().position(|&r| r) {
                reached[first..].fill(true);
            }
            continue;
        }
        for j in (1..=key.len()).rev() {
            reached[j] = reached[j - 1] && (word == "*" || word == key[j - 1]);
        }
        reached[0] = false;
    }
    reached[key.len()]
}
