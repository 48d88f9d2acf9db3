//! Google Gemini GenerateContent API adapter.

use crate::{
    classify_status, effective_base_url, empty_response_error, network_error, process_sse_stream,
    read_capped_error_body, split_reasoning, AiRequest, AiResponse, DeltaSink, SseAction,
    SseParser, GEMINI_API_BASE_URL,
};
use ember_types::{AiError, AiErrorKind, Message, Provider, ProviderConfig, TokenUsage};
use serde_json::{json, Value};

fn endpoint(config: &ProviderConfig, stream: bool) -> String {
    let base = effective_base_url(config, GEMINI_API_BASE_URL);
    let model = config.model.as_str();
    if stream {
        format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
    } else {
        format!("{base}/v1beta/models/{model}:generateContent")
    }
}

fn api_key(config: &ProviderConfig) -> Result<&str, AiError> {
    config
        .api_key
        .as_ref()
        .map(ember_types::ApiKey::as_str)
        .ok_or_else(|| {
            AiError::new(
                AiErrorKind::Auth,
                Provider::Gemini,
                "no API key configured for Gemini",
            )
        })
}

/// Build the GenerateContent request body.
///
/// Gemini knows only `user` and `model` roles and rejects consecutive entries
/// with the same role, so same-role neighbors collapse into one content entry
/// with multiple parts. System and summary messages go to `systemInstruction`.
fn build_request_body(request: &AiRequest<'_>) -> Value {
    let mut system = String::new();
    let mut contents: Vec<Value> = Vec::new();

    for message in request.messages {
        match message {
            Message::System(_) | Message::Summary(_) => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&message.content());
            }
            other => {
                let role = match other.role_str() {
                    "assistant" => "model",
                    _ => "user",
                };
                let part = json!({ "text": other.content() });
                match contents.last_mut() {
                    Some(last) if last["role"] == role => {
                        if let Some(parts) = last["parts"].as_array_mut() {
                            parts.push(part);
                        }
                    }
                    _ => contents.push(json!({ "role": role, "parts": [part] })),
                }
            }
        }
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": { "maxOutputTokens": request.max_output_tokens },
    });

    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    body
}

fn candidate_text(payload: &Value) -> String {
    let mut text = String::new();
    if let Some(parts) = payload["candidates"][0]["content"]["parts"].as_array() {
        for part in parts {
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
        }
    }
    text
}

fn usage_from(payload: &Value) -> Option<TokenUsage> {
    let metadata = payload.get("usageMetadata")?;
    Some(TokenUsage {
        input_tokens: metadata["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        output_tokens: metadata["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
    })
}

pub async fn send(
    config: &ProviderConfig,
    request: &AiRequest<'_>,
) -> Result<AiResponse, AiError> {
    let key = api_key(config)?;
    let body = build_request_body(request);

    let response = crate::http_client()
        .post(endpoint(config, false))
        .header("x-goog-api-key", key)
        .json(&body)
        .send()
        .await
        .map_err(|e| network_error(Provider::Gemini, &e))?;

    let status = response.status();
    if !status.is_success() {
        let error_body = read_capped_error_body(response).await;
        return Err(classify_status(
            Provider::Gemini,
            status.as_u16(),
            &error_body,
        ));
    }

    let payload: Value = response.json().await.map_err(|e| {
        AiError::new(
            AiErrorKind::Parsing,
            Provider::Gemini,
            format!("failed to decode response body: {e}"),
        )
    })?;

    let text = candidate_text(&payload);
    let (visible, reasoning) = split_reasoning(&text);
    if visible.is_empty() {
        return Err(empty_response_error(Provider::Gemini));
    }

    Ok(AiResponse {
        content: visible,
        reasoning,
        usage: usage_from(&payload),
    })
}

/// SSE parser for streamed GenerateContent responses.
///
/// There is no `[DONE]` sentinel; the final chunk carries a `finishReason`,
/// which terminates the stream from inside a content-bearing payload.
struct GeminiParser {
    usage: Option<TokenUsage>,
}

impl SseParser for GeminiParser {
    fn parse(&mut self, json: &Value) -> SseAction {
        if let Some(usage) = usage_from(json) {
            self.usage = Some(usage);
        }

        if let Some(error) = json.get("error").filter(|e| !e.is_null()) {
            return SseAction::Error(
                error["message"].as_str().unwrap_or("stream error").to_string(),
            );
        }

        let text = candidate_text(json);
        let finished = json["candidates"][0]["finishReason"].as_str().is_some();
        match (text.is_empty(), finished) {
            (false, false) => SseAction::Delta(text),
            (_, true) => SseAction::DeltaThenDone(text),
            (true, false) => SseAction::Continue,
        }
    }

    fn provider_name(&self) -> &'static str {
        "gemini"
    }
}

pub async fn send_streaming(
    config: &ProviderConfig,
    request: &AiRequest<'_>,
    on_delta: DeltaSink<'_>,
) -> Result<AiResponse, AiError> {
    let key = api_key(config)?;
    let body = build_request_body(request);

    let response = crate::http_client()
        .post(endpoint(config, true))
        .header("x-goog-api-key", key)
        .json(&body)
        .send()
        .await
        .map_err(|e| network_error(Provider::Gemini, &e))?;

    let status = response.status();
    if !status.is_success() {
        let error_body = read_capped_error_body(response).await;
        return Err(classify_status(
            Provider::Gemini,
            status.as_u16(),
            &error_body,
        ));
    }

    let mut parser = GeminiParser { usage: None };
    let content = process_sse_stream(Provider::Gemini, response, &mut parser, on_delta).await?;

    let (visible, reasoning) = split_reasoning(&content);
    if visible.is_empty() {
        return Err(empty_response_error(Provider::Gemini));
    }

    Ok(AiResponse {
        content: visible,
        reasoning,
        usage: parser.usage,
    })
}
