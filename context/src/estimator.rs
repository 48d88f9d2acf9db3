//! Approximate token counting without a tokenizer.
//!
//! Counts are byte-length heuristics, not real tokenizer output. Code-heavy
//! text tokenizes denser than prose, so two ratios are used. Callers that
//! need exact counts should use a provider's counting endpoint; for compaction
//! thresholds an estimate within ~10% is enough.

use ember_types::Message;

/// Bytes per token for code-like text.
const CODE_BYTES_PER_TOKEN: f64 = 3.1;
/// Bytes per token for prose.
const PROSE_BYTES_PER_TOKEN: f64 = 3.5;

/// Fixed overhead per message for role markers and delimiters.
const PER_MESSAGE_OVERHEAD: usize = 4;

/// Estimate the token count of a text fragment.
#[must_use]
pub fn estimate_str_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let ratio = if looks_like_code(text) {
        CODE_BYTES_PER_TOKEN
    } else {
        PROSE_BYTES_PER_TOKEN
    };
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let tokens = (text.len() as f64 / ratio).ceil() as usize;
    tokens.max(1)
}

/// Estimate one message including its per-message overhead.
#[must_use]
pub fn estimate_message_tokens(message: &Message) -> usize {
    estimate_str_tokens(&message.content()) + PER_MESSAGE_OVERHEAD
}

/// Estimate a whole conversation window.
#[must_use]
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Cheap structural signal that a fragment is code rather than prose.
fn looks_like_code(text: &str) -> bool {
    let sample_len = text.len().min(2048);
    let mut end = sample_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let sample = &text[..end];

    let structural = sample
        .chars()
        .filter(|c| matches!(c, '{' | '}' | ';' | '(' | ')' | '<' | '>' | '=' | '_'))
        .count();
    // Prose rarely exceeds a couple percent of structural characters.
    structural * 100 > sample.chars().count() * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate_str_tokens(""), 0);
    }

    #[test]
    fn short_text_is_at_least_one_token() {
        assert_eq!(estimate_str_tokens("a"), 1);
    }

    #[test]
    fn code_estimates_more_tokens_than_prose_of_equal_length() {
        let code = "fn main() { let x = compute(); if x > 0 { emit(x); } }".repeat(10);
        let prose = "the quick brown fox jumps over the lazy dog once again".repeat(10);
        assert_eq!(code.len(), prose.len());
        assert!(estimate_str_tokens(&code) > estimate_str_tokens(&prose));
    }

    #[test]
    fn message_estimate_includes_overhead() {
        let msg = Message::try_user("hello").unwrap();
        assert_eq!(
            estimate_message_tokens(&msg),
            estimate_str_tokens("hello") + PER_MESSAGE_OVERHEAD
        );
    }

    #[test]
    fn window_estimate_is_sum_of_messages() {
        let msgs = vec![
            Message::try_user("one").unwrap(),
            Message::try_assistant("two").unwrap(),
        ];
        assert_eq!(
            estimate_messages_tokens(&msgs),
            estimate_message_tokens(&msgs[0]) + estimate_message_tokens(&msgs[1])
        );
    }
}
