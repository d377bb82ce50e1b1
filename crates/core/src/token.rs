//! Token estimation utilities.
//!
//! Character-based heuristic: ~4 characters per token for Latin text and
//! ~1.5 characters per token for CJK scripts. Deterministic and monotonic in
//! input length, which is all size accounting in the pipeline relies on.

use crate::message::Message;

/// Fixed per-message cost for role name, delimiters, and wire formatting.
pub const MESSAGE_OVERHEAD: usize = 4;

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}'   // CJK unified ideographs
        | '\u{3040}'..='\u{309f}' // Hiragana
        | '\u{30a0}'..='\u{30ff}' // Katakana
        | '\u{ac00}'..='\u{d7af}' // Hangul syllables
    )
}

/// Estimate the token count for a string. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), c| {
        if is_cjk(c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    // cjk / 1.5 + other / 4, in twelfths to stay in integers
    (cjk * 8 + other * 3).div_ceil(12)
}

/// Estimate tokens for a single message including per-message overhead.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let payload = message
        .payload
        .as_ref()
        .and_then(|p| serde_json::to_string(p).ok())
        .map(|json| estimate_tokens(&json))
        .unwrap_or(0);
    MESSAGE_OVERHEAD + estimate_tokens(&message.content) + payload
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}
