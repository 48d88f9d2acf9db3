//! LLM provider clients behind one normalized contract.
//!
//! # Architecture
//!
//! The crate is organized around a provider dispatch pattern:
//!
//! - [`send`] / [`send_streaming`] - Unified entry points that dispatch on
//!   [`Provider`] to a backend adapter
//! - [`claude`] - Anthropic Messages API client
//! - [`openai`] - OpenAI Chat Completions API client
//! - [`gemini`] - Google Gemini GenerateContent API client
//!
//! Every adapter maps the shared [`AiRequest`] onto its vendor wire shape and
//! maps whatever comes back into either an [`AiResponse`] or a classified
//! [`AiError`]. Callers never see vendor-specific failure shapes; the retry
//! layer branches purely on [`AiError::retryable`].
//!
//! # Status classification
//!
//! All adapters share [`classify_status`]:
//!
//! | Status | Kind | Retryable |
//! |--------|------|-----------|
//! | 401, 403 | Auth | no |
//! | 429 | RateLimit | yes |
//! | 5xx | Api | yes |
//! | 400 + "context"/"token" in body | ContextLengthExceeded | no |
//! | 400 + "model" in body | ModelNotFound | no |
//! | other 4xx | InvalidRequest / Api | no |
//!
//! A 2xx response with no usable content is a retryable Api error: transient
//! upstream hiccups sometimes produce empty bodies, and a retry usually heals
//! them.

pub mod retry;

/// Anthropic Messages API client.
///
/// Claude interleaves `thinking` content blocks with text; the adapter
/// collects them into [`AiResponse::reasoning`] so visible content stays
/// clean.
pub mod claude;

/// OpenAI Chat Completions API client.
///
/// Reasoning-capable models may emit inline `<thinking>` markers inside the
/// message text; the adapter strips and surfaces them separately.
pub mod openai;

/// Google Gemini GenerateContent API client.
///
/// Uses `:generateContent` for blocking calls and
/// `:streamGenerateContent?alt=sse` for streaming.
pub mod gemini;

use ember_types::{AiError, AiErrorKind, Message, Provider, ProviderConfig, TokenUsage};
use std::sync::OnceLock;
use std::time::Duration;

pub use ember_types;

/// Canonical Anthropic Messages API base URL.
pub const CLAUDE_API_BASE_URL: &str = "https://api.anthropic.com";
/// Canonical OpenAI API base URL.
pub const OPENAI_API_BASE_URL: &str = "https://api.openai.com";
/// Canonical Gemini API base URL.
pub const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// A normalized request, provider-agnostic.
///
/// The model id and credentials live in [`ProviderConfig`]; this carries only
/// what varies per call.
#[derive(Debug, Clone)]
pub struct AiRequest<'a> {
    pub messages: &'a [Message],
    /// Ask the backend for reasoning output where it supports any.
    pub reasoning_enabled: bool,
    pub max_output_tokens: u32,
}

/// A normalized response.
#[derive(Debug, Clone)]
pub struct AiResponse {
    /// Visible assistant text, with reasoning markers stripped.
    pub content: String,
    /// Reasoning/thinking text, when the backend produced any.
    pub reasoning: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Incremental content callback for [`send_streaming`].
///
/// Deltas arrive in order with no gaps or overlaps; concatenating them yields
/// exactly the final [`AiResponse::content`].
pub type DeltaSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Send a request and wait for the complete response.
pub async fn send(config: &ProviderConfig, request: &AiRequest<'_>) -> Result<AiResponse, AiError> {
    match config.provider {
        Provider::Claude => claude::send(config, request).await,
        Provider::OpenAI => openai::send(config, request).await,
        Provider::Gemini => gemini::send(config, request).await,
    }
}

/// Send a request, delivering content deltas as they arrive.
///
/// Returns the same final response the blocking path would have produced.
pub async fn send_streaming(
    config: &ProviderConfig,
    request: &AiRequest<'_>,
    on_delta: DeltaSink<'_>,
) -> Result<AiResponse, AiError> {
    match config.provider {
        Provider::Claude => claude::send_streaming(config, request, on_delta).await,
        Provider::OpenAI => openai::send_streaming(config, request, on_delta).await,
        Provider::Gemini => gemini::send_streaming(config, request, on_delta).await,
    }
}

pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        base_client_builder().build().unwrap_or_else(|e| {
            tracing::error!(
                "Failed to build hardened HTTP client: {e}. Attempting minimal fallback."
            );
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("Minimal HTTP client must build; cannot proceed without a client")
        })
    })
}

fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .tcp_keepalive(Some(Duration::from_secs(60)))
}

/// The base URL an adapter should target: the config override when present
/// (tests point this at a local mock server), else the canonical endpoint.
pub(crate) fn effective_base_url<'a>(config: &'a ProviderConfig, canonical: &'a str) -> &'a str {
    config
        .base_url
        .as_deref()
        .map(|url| url.trim_end_matches('/'))
        .unwrap_or(canonical)
}

/// Classify a non-success HTTP status into an [`AiError`].
///
/// The body is only consulted for 400s, where Claude-style APIs bury the
/// distinction between "request too large" and "no such model" in prose.
#[must_use]
pub fn classify_status(provider: Provider, status: u16, body: &str) -> AiError {
    let lower = body.to_ascii_lowercase();
    let error = match status {
        401 | 403 => AiError::new(AiErrorKind::Auth, provider, "invalid or missing API key"),
        429 => AiError::new(AiErrorKind::RateLimit, provider, "rate limited"),
        400 if lower.contains("context") || lower.contains("token") => AiError::new(
            AiErrorKind::ContextLengthExceeded,
            provider,
            "request exceeds the model's context window",
        ),
        400 if lower.contains("model") => {
            AiError::new(AiErrorKind::ModelNotFound, provider, truncate_body(body))
        }
        400 => AiError::new(AiErrorKind::InvalidRequest, provider, truncate_body(body)),
        s if s >= 500 => {
            AiError::new(AiErrorKind::Api, provider, truncate_body(body)).with_retryable(true)
        }
        _ => AiError::new(AiErrorKind::Api, provider, truncate_body(body)),
    };
    error.with_status(status)
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...(truncated)", &body[..end])
    }
}

/// Map a transport failure into a retryable network error.
pub(crate) fn network_error(provider: Provider, err: &reqwest::Error) -> AiError {
    AiError::new(AiErrorKind::Network, provider, err.to_string())
}

/// A success response with no usable content is treated as transient.
pub(crate) fn empty_response_error(provider: Provider) -> AiError {
    AiError::new(AiErrorKind::Api, provider, "provider returned an empty response")
        .with_retryable(true)
}

/// Split inline `<thinking>...</thinking>` blocks out of assistant text.
///
/// Returns the visible remainder and the concatenated reasoning, if any.
/// An unterminated opening marker swallows the rest of the text; better to
/// hide reasoning than leak it into the transcript.
#[must_use]
pub fn split_reasoning(raw: &str) -> (String, Option<String>) {
    const OPEN: &str = "<thinking>";
    const CLOSE: &str = "</thinking>";

    if !raw.contains(OPEN) {
        return (raw.to_string(), None);
    }

    let mut visible = String::new();
    let mut reasoning = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find(OPEN) {
        visible.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        match after.find(CLOSE) {
            Some(end) => {
                if !reasoning.is_empty() {
                    reasoning.push('\n');
                }
                reasoning.push_str(after[..end].trim());
                rest = &after[end + CLOSE.len()..];
            }
            None => {
                if !reasoning.is_empty() {
                    reasoning.push('\n');
                }
                reasoning.push_str(after.trim());
                rest = "";
            }
        }
    }
    visible.push_str(rest);

    let visible = visible.trim().to_string();
    let reasoning = (!reasoning.is_empty()).then_some(reasoning);
    (visible, reasoning)
}

pub(crate) async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

// ============================================================================
// SSE plumbing
// ============================================================================

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

/// What a provider-specific parser made of one SSE JSON payload.
#[derive(Debug)]
pub(crate) enum SseAction {
    /// Nothing to surface, keep reading.
    Continue,
    /// New visible content.
    Delta(String),
    /// Final content followed by a clean end of stream (backends that mark
    /// completion inside a content-bearing payload instead of a sentinel).
    DeltaThenDone(String),
    /// Stream finished cleanly.
    Done,
    /// Stream reported a failure.
    Error(String),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseAction;
    fn provider_name(&self) -> &'static str;
}

pub(crate) fn stream_idle_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let timeout = std::env::var("EMBER_STREAM_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
        Duration::from_secs(timeout)
    })
}

/// Drive an SSE response through a provider-specific parser, forwarding each
/// content delta to `on_delta` and accumulating the full text.
///
/// Handles the parts every backend shares: idle timeouts, buffer caps, UTF-8
/// validation, event boundary detection, the `[DONE]` marker, and a bounded
/// tolerance for malformed payloads.
pub(crate) async fn process_sse_stream<P: SseParser>(
    provider: Provider,
    response: reqwest::Response,
    parser: &mut P,
    on_delta: DeltaSink<'_>,
) -> Result<String, AiError> {
    use futures_util::StreamExt;

    let idle_timeout = stream_idle_timeout();
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut content = String::new();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            return Err(AiError::new(
                AiErrorKind::Stream,
                provider,
                "stream idle timeout",
            ));
        };

        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| network_error(provider, &e))?;
        buffer.extend_from_slice(&chunk);

        // Security: prevent unbounded buffer growth
        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            return Err(AiError::new(
                AiErrorKind::Stream,
                provider,
                "SSE buffer exceeded maximum size (4 MiB)",
            ));
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                return Err(AiError::new(
                    AiErrorKind::Stream,
                    provider,
                    "received invalid UTF-8 from SSE stream",
                ));
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                return Ok(content);
            }

            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => {
                    parse_errors = 0;
                    match parser.parse(&json) {
                        SseAction::Continue => {}
                        SseAction::Delta(delta) => {
                            on_delta(&delta);
                            content.push_str(&delta);
                        }
                        SseAction::DeltaThenDone(delta) => {
                            if !delta.is_empty() {
                                on_delta(&delta);
                                content.push_str(&delta);
                            }
                            return Ok(content);
                        }
                        SseAction::Done => return Ok(content),
                        SseAction::Error(msg) => {
                            return Err(AiError::new(AiErrorKind::Stream, provider, msg));
                        }
                    }
                }
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        provider = parser.provider_name(),
                        "Invalid SSE JSON payload"
                    );
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        return Err(AiError::new(
                            AiErrorKind::Parsing,
                            provider,
                            format!("invalid stream payload: {e}"),
                        ));
                    }
                }
            }
        }
    }

    // Premature EOF: connection closed without a completion signal
    Err(AiError::new(
        AiErrorKind::Stream,
        provider,
        "connection closed before stream completed",
    ))
}
