//! Anthropic Messages API adapter.

use crate::{
    classify_status, effective_base_url, empty_response_error, network_error, process_sse_stream,
    read_capped_error_body, split_reasoning, AiRequest, AiResponse, DeltaSink, SseAction,
    SseParser, CLAUDE_API_BASE_URL,
};
use ember_types::{AiError, AiErrorKind, Message, Provider, ProviderConfig, TokenUsage};
use serde::Deserialize;
use serde_json::{json, Value};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MIN_THINKING_BUDGET: u32 = 1024;

fn endpoint(config: &ProviderConfig) -> String {
    format!(
        "{}/v1/messages",
        effective_base_url(config, CLAUDE_API_BASE_URL)
    )
}

fn api_key(config: &ProviderConfig) -> Result<&str, AiError> {
    config
        .api_key
        .as_ref()
        .map(ember_types::ApiKey::as_str)
        .ok_or_else(|| {
            AiError::new(
                AiErrorKind::Auth,
                Provider::Claude,
                "no API key configured for Claude",
            )
        })
}

/// Build the Messages API request body.
///
/// System and summary messages become the `system` parameter; the rest map to
/// the `messages` array. Consecutive same-role turns are merged because the
/// API rejects non-alternating conversations.
fn build_request_body(config: &ProviderConfig, request: &AiRequest<'_>, stream: bool) -> Value {
    let mut system = String::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in request.messages {
        match message {
            Message::System(_) | Message::Summary(_) => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&message.content());
            }
            other => {
                let role = other.role_str();
                let content = other.content();
                match messages.last_mut() {
                    Some(last) if last["role"] == role => {
                        let merged =
                            format!("{}\n{}", last["content"].as_str().unwrap_or(""), content);
                        last["content"] = Value::String(merged);
                    }
                    _ => messages.push(json!({ "role": role, "content": content })),
                }
            }
        }
    }

    let mut body = json!({
        "model": config.model.as_str(),
        "max_tokens": request.max_output_tokens,
        "messages": messages,
    });

    if !system.is_empty() {
        body["system"] = Value::String(system);
    }

    if request.reasoning_enabled {
        // Budget must stay below max_tokens; skip thinking entirely when the
        // output ceiling leaves no room for it.
        let budget = (request.max_output_tokens / 2).max(MIN_THINKING_BUDGET);
        if budget < request.max_output_tokens {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
    }

    if stream {
        body["stream"] = Value::Bool(true);
    }

    body
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    thinking: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl From<Usage> for TokenUsage {
    fn from(usage: Usage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }
    }
}

pub async fn send(
    config: &ProviderConfig,
    request: &AiRequest<'_>,
) -> Result<AiResponse, AiError> {
    let key = api_key(config)?;
    let body = build_request_body(config, request, false);

    let response = crate::http_client()
        .post(endpoint(config))
        .header("x-api-key", key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
        .send()
        .await
        .map_err(|e| network_error(Provider::Claude, &e))?;

    let status = response.status();
    if !status.is_success() {
        let error_body = read_capped_error_body(response).await;
        return Err(classify_status(
            Provider::Claude,
            status.as_u16(),
            &error_body,
        ));
    }

    let parsed: MessagesResponse = response.json().await.map_err(|e| {
        AiError::new(
            AiErrorKind::Parsing,
            Provider::Claude,
            format!("failed to decode response body: {e}"),
        )
    })?;

    let mut text = String::new();
    let mut thinking = String::new();
    for block in &parsed.content {
        match block.kind.as_str() {
            "text" => text.push_str(&block.text),
            "thinking" => {
                if !thinking.is_empty() {
                    thinking.push('\n');
                }
                thinking.push_str(&block.thinking);
            }
            _ => {}
        }
    }

    let (visible, inline) = split_reasoning(&text);
    if visible.is_empty() {
        return Err(empty_response_error(Provider::Claude));
    }

    if let Some(inline) = inline {
        if !thinking.is_empty() {
            thinking.push('\n');
        }
        thinking.push_str(&inline);
    }

    Ok(AiResponse {
        content: visible,
        reasoning: (!thinking.is_empty()).then_some(thinking),
        usage: parsed.usage.map(TokenUsage::from),
    })
}

/// SSE parser for Messages API streaming events.
struct ClaudeParser {
    thinking: String,
    input_tokens: u32,
    output_tokens: u32,
    saw_usage: bool,
}

impl ClaudeParser {
    fn new() -> Self {
        Self {
            thinking: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            saw_usage: false,
        }
    }

    fn usage(&self) -> Option<TokenUsage> {
        self.saw_usage.then_some(TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        })
    }
}

impl SseParser for ClaudeParser {
    fn parse(&mut self, json: &Value) -> SseAction {
        match json["type"].as_str() {
            Some("content_block_delta") => match json["delta"]["type"].as_str() {
                Some("text_delta") => {
                    let text = json["delta"]["text"].as_str().unwrap_or_default();
                    SseAction::Delta(text.to_string())
                }
                Some("thinking_delta") => {
                    self.thinking
                        .push_str(json["delta"]["thinking"].as_str().unwrap_or_default());
                    SseAction::Continue
                }
                _ => SseAction::Continue,
            },
            Some("message_start") => {
                if let Some(tokens) = json["message"]["usage"]["input_tokens"].as_u64() {
                    self.input_tokens = tokens as u32;
                    self.saw_usage = true;
                }
                SseAction::Continue
            }
            Some("message_delta") => {
                if let Some(tokens) = json["usage"]["output_tokens"].as_u64() {
                    self.output_tokens = tokens as u32;
                    self.saw_usage = true;
                }
                SseAction::Continue
            }
            Some("message_stop") => SseAction::Done,
            Some("error") => SseAction::Error(
                json["error"]["message"]
                    .as_str()
                    .unwrap_or("stream error")
                    .to_string(),
            ),
            _ => SseAction::Continue,
        }
    }

    fn provider_name(&self) -> &'static str {
        "claude"
    }
}

pub async fn send_streaming(
    config: &ProviderConfig,
    request: &AiRequest<'_>,
    on_delta: DeltaSink<'_>,
) -> Result<AiResponse, AiError> {
    let key = api_key(config)?;
    let body = build_request_body(config, request, true);

    let response = crate::http_client()
        .post(endpoint(config))
        .header("x-api-key", key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
        .send()
        .await
        .map_err(|e| network_error(Provider::Claude, &e))?;

    let status = response.status();
    if !status.is_success() {
        let error_body = read_capped_error_body(response).await;
        return Err(classify_status(
            Provider::Claude,
            status.as_u16(),
            &error_body,
        ));
    }

    let mut parser = ClaudeParser::new();
    let content = process_sse_stream(Provider::Claude, response, &mut parser, on_delta).await?;

    let (visible, inline) = split_reasoning(&content);
    if visible.is_empty() {
        return Err(empty_response_error(Provider::Claude));
    }

    let mut thinking = parser.thinking.clone();
    if let Some(inline) = inline {
        if !thinking.is_empty() {
            thinking.push('\n');
        }
        thinking.push_str(&inline);
    }

    Ok(AiResponse {
        content: visible,
        reasoning: (!thinking.is_empty()).then_some(thinking),
        usage: parser.usage(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::ApiKey;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> ProviderConfig {
        ProviderConfig::new(
            Provider::Claude.default_model(),
            Some(ApiKey::Claude("sk-ant-test".to_string())),
        )
        .with_base_url(server.uri())
    }

    fn messages() -> Vec<Message> {
        vec![
            Message::system("You are helpful.".try_into().unwrap()),
            Message::try_user("hello").unwrap(),
        ]
    }

    fn request(messages: &[Message]) -> AiRequest<'_> {
        AiRequest {
            messages,
            reasoning_enabled: false,
            max_output_tokens: 1024,
        }
    }

    #[test]
    fn body_routes_system_messages_to_system_param() {
        let history = messages();
        let config = ProviderConfig::new(
            Provider::Claude.default_model(),
            Some(ApiKey::Claude("k".to_string())),
        );
        let body = build_request_body(&config, &request(&history), false);
        assert_eq!(body["system"], "You are helpful.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("stream").is_none());
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn body_merges_consecutive_same_role_turns() {
        let history = vec![
            Message::try_user("first").unwrap(),
            Message::try_user("second").unwrap(),
            Message::try_assistant("reply").unwrap(),
        ];
        let config = ProviderConfig::new(
            Provider::Claude.default_model(),
            Some(ApiKey::Claude("k".to_string())),
        );
        let body = build_request_body(&config, &request(&history), false);
        let wire = body["messages"].as_array().unwrap();
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["content"], "first\nsecond");
    }

    #[test]
    fn thinking_requires_output_headroom() {
        let history = messages();
        let config = ProviderConfig::new(
            Provider::Claude.default_model(),
            Some(ApiKey::Claude("k".to_string())),
        );
        let small = AiRequest {
            messages: &history,
            reasoning_enabled: true,
            max_output_tokens: 1024,
        };
        assert!(
            build_request_body(&config, &small, false)
                .get("thinking")
                .is_none()
        );

        let large = AiRequest {
            messages: &history,
            reasoning_enabled: true,
            max_output_tokens: 8192,
        };
        let body = build_request_body(&config, &large, false);
        assert_eq!(body["thinking"]["budget_tokens"], 4096);
    }

    #[tokio::test]
    async fn send_parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "hi there"}],
                "usage": {"input_tokens": 12, "output_tokens": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let history = messages();
        let response = send(&test_config(&server), &request(&history))
            .await
            .unwrap();
        assert_eq!(response.content, "hi there");
        assert!(response.reasoning.is_none());
        assert_eq!(response.usage.unwrap().input_tokens, 12);
    }

    #[tokio::test]
    async fn send_surfaces_thinking_blocks_as_reasoning() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [
                    {"type": "thinking", "thinking": "let me count"},
                    {"type": "text", "text": "four"}
                ]
            })))
            .mount(&server)
            .await;

        let history = messages();
        let response = send(&test_config(&server), &request(&history))
            .await
            .unwrap();
        assert_eq!(response.content, "four");
        assert_eq!(response.reasoning.as_deref(), Some("let me count"));
    }

    #[tokio::test]
    async fn send_classifies_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
            .mount(&server)
            .await;

        let history = messages();
        let err = send(&test_config(&server), &request(&history))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AiErrorKind::Auth);
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn empty_content_is_a_retryable_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "content": [] })),
            )
            .mount(&server)
            .await;

        let history = messages();
        let err = send(&test_config(&server), &request(&history))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AiErrorKind::Api);
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn streaming_delivers_deltas_in_order() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":9}}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hel\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":2}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let history = messages();
        let mut deltas: Vec<String> = Vec::new();
        let mut sink = |d: &str| deltas.push(d.to_string());
        let response = send_streaming(&test_config(&server), &request(&history), &mut sink)
            .await
            .unwrap();

        assert_eq!(deltas, vec!["hel".to_string(), "lo".to_string()]);
        assert_eq!(response.content, "hello");
        let usage = response.usage.unwrap();
        assert_eq!(usage.input_tokens, 9);
        assert_eq!(usage.output_tokens, 2);
    }

    #[tokio::test]
    async fn streaming_collects_thinking_deltas_separately() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"hmm\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"done\"}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let history = messages();
        let mut sink = |_: &str| {};
        let response = send_streaming(&test_config(&server), &request(&history), &mut sink)
            .await
            .unwrap();
        assert_eq!(response.content, "done");
        assert_eq!(response.reasoning.as_deref(), Some("hmm"));
    }
}
