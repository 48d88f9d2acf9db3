//! Conversation window management.
//!
//! Two pieces: a byte-ratio [token estimator](estimator) that never needs a
//! tokenizer vocabulary, and a [lossy compactor](compactor) that folds old
//! messages into summary markers once the estimated window crosses its
//! trigger threshold.

pub mod compactor;
pub mod estimator;

pub use compactor::{CompactionResult, CompactionTier, CompactorConfig, ConversationCompactor};
pub use estimator::{estimate_message_tokens, estimate_messages_tokens, estimate_str_tokens};
