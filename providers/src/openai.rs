//! OpenAI Chat Completions API adapter.

use crate::{
    classify_status, effective_base_url, empty_response_error, network_error, process_sse_stream,
    read_capped_error_body, split_reasoning, AiRequest, AiResponse, DeltaSink, SseAction,
    SseParser, OPENAI_API_BASE_URL,
};
use ember_types::{AiError, AiErrorKind, Message, Provider, ProviderConfig, TokenUsage};
use serde::Deserialize;
use serde_json::{json, Value};

fn endpoint(config: &ProviderConfig) -> String {
    format!(
        "{}/v1/chat/completions",
        effective_base_url(config, OPENAI_API_BASE_URL)
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
                Provider::OpenAI,
                "no API key configured for OpenAI",
            )
        })
}

fn build_request_body(config: &ProviderConfig, request: &AiRequest<'_>, stream: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            let role = match message {
                Message::System(_) | Message::Summary(_) => "system",
                other => other.role_str(),
            };
            json!({ "role": role, "content": message.content() })
        })
        .collect();

    let mut body = json!({
        "model": config.model.as_str(),
        "max_completion_tokens": request.max_output_tokens,
        "messages": messages,
    });

    if request.reasoning_enabled {
        body["reasoning_effort"] = Value::String("medium".to_string());
    }

    if stream {
        body["stream"] = Value::Bool(true);
        // Ask for a trailing usage chunk so streamed calls still report tokens.
        body["stream_options"] = json!({ "include_usage": true });
    }

    body
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<Usage> for TokenUsage {
    fn from(usage: Usage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
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
        .bearer_auth(key)
        .json(&body)
        .send()
        .await
        .map_err(|e| network_error(Provider::OpenAI, &e))?;

    let status = response.status();
    if !status.is_success() {
        let error_body = read_capped_error_body(response).await;
        return Err(classify_status(
            Provider::OpenAI,
            status.as_u16(),
            &error_body,
        ));
    }

    let parsed: ChatResponse = response.json().await.map_err(|e| {
        AiError::new(
            AiErrorKind::Parsing,
            Provider::OpenAI,
            format!("failed to decode response body: {e}"),
        )
    })?;

    let text = parsed
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .unwrap_or_default();

    let (visible, reasoning) = split_reasoning(&text);
    if visible.is_empty() {
        return Err(empty_response_error(Provider::OpenAI));
    }

    Ok(AiResponse {
        content: visible,
        reasoning,
        usage: parsed.usage.map(TokenUsage::from),
    })
}

/// SSE parser for Chat Completions streaming chunks.
///
/// The stream ends with a literal `[DONE]` marker, which the shared SSE loop
/// handles before this parser sees it.
struct OpenAIParser {
    usage: Option<TokenUsage>,
}

impl SseParser for OpenAIParser {
    fn parse(&mut self, json: &Value) -> SseAction {
        if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(TokenUsage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            });
        }

        if let Some(error) = json.get("error").filter(|e| !e.is_null()) {
            return SseAction::Error(
                error["message"].as_str().unwrap_or("stream error").to_string(),
            );
        }

        match json["choices"][0]["delta"]["content"].as_str() {
            Some(content) if !content.is_empty() => SseAction::Delta(content.to_string()),
            _ => SseAction::Continue,
        }
    }

    fn provider_name(&self) -> &'static str {
        "openai"
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
        .bearer_auth(key)
        .json(&body)
        .send()
        .await
        .map_err(|e| network_error(Provider::OpenAI, &e))?;

    let status = response.status();
    if !status.is_success() {
        let error_body = read_capped_error_body(response).await;
        return Err(classify_status(
            Provider::OpenAI,
            status.as_u16(),
            &error_body,
        ));
    }

    let mut parser = OpenAIParser { usage: None };
    let content = process_sse_stream(Provider::OpenAI, response, &mut parser, on_delta).await?;

    let (visible, reasoning) = split_reasoning(&content);
    if visible.is_empty() {
        return Err(empty_response_error(Provider::OpenAI));
    }

    Ok(AiResponse {
        content: visible,
        reasoning,
        usage: parser.usage,
    })
}
