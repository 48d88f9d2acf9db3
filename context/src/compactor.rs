//! Lossy conversation compaction.
//!
//! When the estimated window crosses the trigger threshold, old messages are
//! folded into [`Message::Summary`] markers through up to four escalating
//! tiers:
//!
//! 1. **Simple** - fold everything older than the recent window into one
//!    level-1 summary built from short per-message previews
//! 2. **Hierarchical** - once more than three summaries accumulate, collapse
//!    the older ones into a single higher-level summary, keeping the two
//!    newest intact
//! 3. **Aggressive** - if the result still sits above 95% of budget, shrink
//!    the retained recent window by successive factors and refold, until it
//!    drops below 85%
//! 4. **Emergency** - drop to the leading system message plus the last user
//!    message
//!
//! Compaction never grows the window and is a no-op below the trigger.

use ember_types::{Message, NonEmptyString};

use crate::estimator::estimate_messages_tokens;

/// Fraction of the budget at which compaction kicks in.
const TRIGGER_RATIO: f64 = 0.40;
/// Aggressive shrink starts above this fraction of budget.
const SHRINK_START_RATIO: f64 = 0.95;
/// Aggressive shrink stops once below this fraction.
const SHRINK_TARGET_RATIO: f64 = 0.85;
/// Successive recent-window retention factors for the aggressive tier.
const SHRINK_FACTORS: [f64; 3] = [0.5, 0.35, 0.2];

/// Minimum number of recent messages left untouched by the simple tier.
const MIN_RECENT_WINDOW: usize = 4;
/// Per-message preview length inside a level-1 summary.
const PREVIEW_CHARS: usize = 150;
/// Summaries kept intact when the hierarchical tier collapses the rest.
const SUMMARIES_KEPT: usize = 2;
/// Summary count that arms the hierarchical tier.
const MAX_FLAT_SUMMARIES: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct CompactorConfig {
    /// Model context window size in tokens.
    pub max_context_tokens: usize,
    /// Tokens reserved for the model's output.
    pub reserved_output_tokens: usize,
}

impl CompactorConfig {
    /// Tokens available for the conversation itself.
    #[must_use]
    pub fn budget(&self) -> usize {
        self.max_context_tokens
            .saturating_sub(self.reserved_output_tokens)
            .max(1)
    }
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 200_000,
            reserved_output_tokens: 8_192,
        }
    }
}

/// Highest tier a compaction pass reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTier {
    Simple,
    Hierarchical,
    Aggressive,
    Emergency,
}

#[derive(Debug)]
pub struct CompactionResult {
    pub messages: Vec<Message>,
    /// `None` when the window was below the trigger and left untouched.
    pub tier: Option<CompactionTier>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationCompactor {
    config: CompactorConfig,
}

impl ConversationCompactor {
    #[must_use]
    pub fn new(config: CompactorConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn should_compact(&self, messages: &[Message]) -> bool {
        ratio(estimate_messages_tokens(messages), self.config.budget()) > TRIGGER_RATIO
    }

    /// Run the tier ladder over `messages`.
    #[must_use]
    pub fn compact(&self, messages: Vec<Message>) -> CompactionResult {
        let tokens_before = estimate_messages_tokens(&messages);
        let budget = self.config.budget();

        if ratio(tokens_before, budget) <= TRIGGER_RATIO {
            return CompactionResult {
                messages,
                tier: None,
                tokens_before,
                tokens_after: tokens_before,
            };
        }

        let mut tier = CompactionTier::Simple;
        // Captured before folding; the emergency tier is defined over the
        // original conversation, not over whatever a fold left behind.
        let leading_system = messages.iter().find(|m| m.is_system()).cloned();
        let last_user = messages.iter().rev().find(|m| m.is_user()).cloned();
        let mut window = recent_window(&messages);
        let mut working = fold_with_window(messages, window);

        if summary_count(&working) > MAX_FLAT_SUMMARIES {
            working = collapse_summaries(working);
            tier = CompactionTier::Hierarchical;
        }

        let mut tokens_after = estimate_messages_tokens(&working);
        if ratio(tokens_after, budget) > SHRINK_START_RATIO {
            tier = CompactionTier::Aggressive;
            for factor in SHRINK_FACTORS {
                window = shrink_window(window, factor);
                working = fold_with_window(working, window);
                tokens_after = estimate_messages_tokens(&working);
                if ratio(tokens_after, budget) < SHRINK_TARGET_RATIO {
                    break;
                }
            }
        }

        if ratio(tokens_after, budget) >= 1.0 {
            tier = CompactionTier::Emergency;
            working = leading_system.into_iter().chain(last_user).collect();
            tokens_after = estimate_messages_tokens(&working);
            tracing::error!(
                tokens_before,
                tokens_after,
                budget,
                "conversation exceeded context budget, emergency compaction applied"
            );
        } else {
            tracing::info!(tokens_before, tokens_after, ?tier, "compacted conversation");
        }

        // Lossy folding must never make the window bigger.
        debug_assert!(tokens_after <= tokens_before);
        CompactionResult {
            messages: working,
            tier: Some(tier),
            tokens_before,
            tokens_after,
        }
    }
}

fn ratio(tokens: usize, budget: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let r = tokens as f64 / budget as f64;
    r
}

fn summary_count(messages: &[Message]) -> usize {
    messages.iter().filter(|m| m.is_summary()).count()
}

/// Recent messages kept verbatim by the first fold: 20% of the non-system
/// count, floored at [`MIN_RECENT_WINDOW`].
fn recent_window(messages: &[Message]) -> usize {
    let non_system = messages.iter().filter(|m| !m.is_system()).count();
    (non_system / 5).max(MIN_RECENT_WINDOW)
}

fn shrink_window(window: usize, factor: f64) -> usize {
    ((window as f64 * factor).ceil() as usize).max(1)
}

/// Preserve the leading system and summary run plus the last `window`
/// messages, fold the middle into one new summary of short previews.
/// Existing summaries stay in place so repeated passes accumulate them;
/// a stray summary caught in the middle raises the level of the digest.
fn fold_with_window(messages: Vec<Message>, window: usize) -> Vec<Message> {
    let prefix = messages
        .iter()
        .take_while(|m| m.is_system() || m.is_summary())
        .count();
    if prefix + window >= messages.len() {
        // Nothing old enough to fold.
        return messages;
    }
    let fold_end = messages.len() - window;

    let mut result: Vec<Message> = messages[..prefix].to_vec();
    let folded = &messages[prefix..fold_end];

    let mut body = format!("[compacted {} messages]\n", folded.len());
    let mut max_level = 0u8;
    let mut carried = 0usize;
    for message in folded {
        if let Message::Summary(summary) = message {
            max_level = max_level.max(summary.level());
            carried += summary.compacted_count();
        } else {
            carried += 1;
        }
        body.push_str(message.role_str());
        body.push_str(": ");
        body.push_str(&truncate_chars(&message.content(), PREVIEW_CHARS));
        body.push('\n');
    }

    if let Some(summary) = summary_message(body, max_level.saturating_add(1).max(1), carried) {
        result.push(summary);
    }
    result.extend_from_slice(&messages[fold_end..]);
    result
}

/// Tier 2: merge all summaries except the `SUMMARIES_KEPT` newest into one
/// summary at one level above the deepest input. Each child contributes a
/// re-truncated excerpt, not its full body.
fn collapse_summaries(messages: Vec<Message>) -> Vec<Message> {
    let summary_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_summary())
        .map(|(i, _)| i)
        .collect();
    if summary_positions.len() <= MAX_FLAT_SUMMARIES {
        return messages;
    }
    let collapse_count = summary_positions.len() - SUMMARIES_KEPT;
    let collapse_set = &summary_positions[..collapse_count];
    let insert_at = collapse_set[0];

    let mut body = String::from("[collapsed summaries]\n");
    let mut max_level = 0u8;
    let mut carried = 0usize;
    for &idx in collapse_set {
        if let Message::Summary(summary) = &messages[idx] {
            max_level = max_level.max(summary.level());
            carried += summary.compacted_count();
            body.push_str(&truncate_chars(summary.content(), PREVIEW_CHARS));
            body.push('\n');
        }
    }

    let mut result = Vec::with_capacity(messages.len() - collapse_count + 1);
    for (idx, message) in messages.into_iter().enumerate() {
        if idx == insert_at {
            if let Some(summary) =
                summary_message(body.clone(), max_level.saturating_add(1), carried)
            {
                result.push(summary);
            }
            continue;
        }
        if collapse_set.contains(&idx) {
            continue;
        }
        result.push(message);
    }
    result
}

fn summary_message(body: String, level: u8, compacted_count: usize) -> Option<Message> {
    let content = NonEmptyString::new(body.trim_end().to_string()).ok()?;
    Some(Message::summary(content, level, compacted_count))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
