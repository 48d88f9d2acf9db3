//! Tool directive extraction from assistant text.
//!
//! The model requests tools by embedding JSON objects of the form
//! `{"tool": "...", "parameters": {...}}` in its reply, optionally inside
//! fenced code blocks or surrounded by prose. Extraction is two-stage: a
//! regex locates candidate object starts, then serde parses and validates
//! each candidate. Text with no valid directive is a final answer.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// One parsed tool request.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolDirective {
    pub tool: String,
    pub parameters: serde_json::Map<String, Value>,
}

impl ToolDirective {
    #[must_use]
    pub fn arguments(&self) -> Value {
        Value::Object(self.parameters.clone())
    }
}

fn candidate_start() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // An object whose first key could be a directive field.
    RE.get_or_init(|| Regex::new(r#"\{\s*""#).expect("static pattern is valid"))
}

/// Extract every well-formed directive from `text`, in order of appearance.
///
/// Malformed JSON and objects with the wrong shape are skipped, not errors;
/// a reply that merely talks about JSON stays a final answer.
#[must_use]
pub fn parse_directives(text: &str) -> Vec<ToolDirective> {
    let mut directives = Vec::new();
    let mut cursor = 0;

    while cursor < text.len() {
        let Some(found) = candidate_start().find(&text[cursor..]) else {
            break;
        };
        let start = cursor + found.start();

        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let end = start + stream.byte_offset();
                match serde_json::from_value::<ToolDirective>(value) {
                    Ok(directive) => {
                        directives.push(directive);
                        cursor = end;
                    }
                    // Valid JSON, wrong shape. Skip past it entirely so its
                    // nested objects are not re-parsed as candidates.
                    Err(_) => cursor = end,
                }
            }
            _ => cursor = start + 1,
        }
    }

    directives
}
