use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{ConfigError, OpenAiSettings},
    models::{Fragment, GenerationRequest},
    upstream::{FragmentStream, ProviderError, UpstreamHandle, UpstreamProvider},
};

const MAX_LINE_BYTES: usize = 1 << 20;

const QUOTA_ERROR_CODES: [&str; 3] = [
    "insufficient_quota",
    "rate_limit_exceeded",
    "billing_hard_limit_reached",
];

#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(settings: &OpenAiSettings) -> Result<Self, ConfigError> {
        // No overall request timeout: it would cut long generations short.
        // Stalls are caught by the session's idle window instead.
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_owned(),
            model: settings.model.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl UpstreamProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn open(&self, request: GenerationRequest) -> Result<UpstreamHandle, ProviderError> {
        let payload = ChatCompletionPayload::streaming(&self.model, &request);

        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|error| classify_transport(&error))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown upstream error".to_owned());
            return Err(map_http_error(status, &body));
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|error| classify_transport(&error)));

        debug!(
            upstream = self.name(),
            model = %self.model,
            request_id = %request.request_id,
            "upstream stream opened"
        );
        Ok(UpstreamHandle::new(decode_body(body)))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StreamEvent {
    Delta(String),
    Finished,
}

/// Splits a chunked response body into lines and decodes each one. Lines may
/// straddle chunk boundaries; a final line without a newline is still
/// decoded when the body ends.
fn decode_body<S, B>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<B, ProviderError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let mut body = body.boxed();
    let fragments = async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(next) = body.next().await {
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(index) = buffer.iter().position(|byte| *byte == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=index).collect();
                match decode_raw_line(&raw) {
                    Ok(events) => {
                        for event in events {
                            match event {
                                StreamEvent::Delta(text) => yield Ok(Fragment::from(text)),
                                StreamEvent::Finished => return,
                            }
                        }
                    }
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                }
            }

            if buffer.len() > MAX_LINE_BYTES {
                yield Err(ProviderError::Fault(format!(
                    "stream line exceeds {MAX_LINE_BYTES} bytes without a newline"
                )));
                return;
            }
        }

        if !buffer.is_empty() {
            match decode_raw_line(&buffer) {
                Ok(events) => {
                    for event in events {
                        match event {
                            StreamEvent::Delta(text) => yield Ok(Fragment::from(text)),
                            StreamEvent::Finished => return,
                        }
                    }
                }
                Err(error) => {
                    yield Err(error);
                    return;
                }
            }
        }

        yield Err(ProviderError::Fault(
            "stream closed before completion was signalled".to_owned(),
        ));
    };

    fragments.boxed()
}

fn decode_raw_line(raw: &[u8]) -> Result<Vec<StreamEvent>, ProviderError> {
    let line = std::str::from_utf8(raw)
        .map_err(|error| ProviderError::Fault(format!("invalid utf-8 in stream: {error}")))?;
    decode_line(line.trim())
}

fn decode_line(line: &str) -> Result<Vec<StreamEvent>, ProviderError> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(Vec::new());
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    if payload == "[DONE]" {
        return Ok(vec![StreamEvent::Finished]);
    }

    let parsed: OpenAiStreamResponse = serde_json::from_str(payload)
        .map_err(|error| ProviderError::Fault(format!("malformed stream payload: {error}")))?;
    if let Some(error) = parsed.error {
        return Err(classify_error_body(&error));
    }

    let mut events = Vec::new();
    if let Some(choice) = parsed.choices.into_iter().next() {
        if let Some(content) = choice.delta.content.filter(|value| !value.is_empty()) {
            events.push(StreamEvent::Delta(content));
        }
        if choice.finish_reason.is_some() {
            events.push(StreamEvent::Finished);
        }
    }
    Ok(events)
}

fn map_http_error(status: StatusCode, body: &str) -> ProviderError {
    // Some compatible servers report quota exhaustion under 400 or 403.
    if let Ok(envelope) = serde_json::from_str::<OpenAiErrorEnvelope>(body) {
        if let quota @ ProviderError::QuotaExceeded(_) = classify_error_body(&envelope.error) {
            return quota;
        }
    }

    let trimmed = body.chars().take(400).collect::<String>();
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYMENT_REQUIRED => {
            ProviderError::QuotaExceeded(format!("status {}: {trimmed}", status.as_u16()))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ProviderError::Timeout(format!("status {}: {trimmed}", status.as_u16()))
        }
        _ => ProviderError::Fault(format!("status {}: {trimmed}", status.as_u16())),
    }
}

fn classify_transport(error: &reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(error.to_string())
    } else {
        ProviderError::Fault(error.to_string())
    }
}

fn classify_error_body(error: &OpenAiErrorBody) -> ProviderError {
    let is_quota = [error.code.as_deref(), error.error_type.as_deref()]
        .into_iter()
        .flatten()
        .any(|value| QUOTA_ERROR_CODES.contains(&value));
    let message = error
        .message
        .clone()
        .unwrap_or_else(|| "upstream reported an error".to_owned());

    if is_quota {
        ProviderError::QuotaExceeded(message)
    } else {
        ProviderError::Fault(message)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionPayload<'a> {
    model: &'a str,
    messages: Vec<PayloadMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct PayloadMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> ChatCompletionPayload<'a> {
    fn streaming(model: &'a str, request: &'a GenerationRequest) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_instruction.as_deref() {
            messages.push(PayloadMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(PayloadMessage {
            role: "user",
            content: &request.prompt,
        });

        Self {
            model,
            messages,
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            max_tokens: request.sampling.max_tokens,
            stream: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    error: Option<OpenAiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorEnvelope {
    error: OpenAiErrorBody,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SamplingParams;

    #[test]
    fn decodes_deltas_and_terminators() {
        let line = r#"data: {"choices":[{"delta":{"content":"one"},"finish_reason":null}]}"#;
        assert_eq!(
            decode_line(line).expect("valid line"),
            vec![StreamEvent::Delta("one".to_owned())]
        );

        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(decode_line(line).expect("valid line"), vec![StreamEvent::Finished]);

        assert_eq!(decode_line("data: [DONE]").expect("done"), vec![StreamEvent::Finished]);
        assert!(decode_line(": keep-alive").expect("comment").is_empty());
        assert!(decode_line("").expect("blank").is_empty());
    }

    #[test]
    fn malformed_payload_is_a_fault() {
        let error = decode_line("data: {not json").expect_err("should fail");
        assert!(matches!(error, ProviderError::Fault(_)));
    }

    #[test]
    fn in_stream_quota_error_is_classified() {
        let line = r#"data: {"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#;
        let error = decode_line(line).expect_err("should fail");
        assert_eq!(
            error,
            ProviderError::QuotaExceeded("You exceeded your current quota".to_owned())
        );

        let line = r#"data: {"error":{"message":"server overloaded","type":"server_error"}}"#;
        let error = decode_line(line).expect_err("should fail");
        assert_eq!(error, ProviderError::Fault("server overloaded".to_owned()));
    }

    #[test]
    fn http_statuses_map_to_closed_taxonomy() {
        assert!(matches!(
            map_http_error(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            ProviderError::QuotaExceeded(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::PAYMENT_REQUIRED, ""),
            ProviderError::QuotaExceeded(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::GATEWAY_TIMEOUT, ""),
            ProviderError::Timeout(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::UNAUTHORIZED, "bad key"),
            ProviderError::Fault(_)
        ));
    }

    #[test]
    fn quota_error_body_wins_over_status() {
        let body = r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#;
        assert_eq!(
            map_http_error(StatusCode::FORBIDDEN, body),
            ProviderError::QuotaExceeded("You exceeded your current quota".to_owned())
        );

        let body = r#"{"error":{"message":"unknown model","type":"invalid_request_error"}}"#;
        assert!(matches!(
            map_http_error(StatusCode::BAD_REQUEST, body),
            ProviderError::Fault(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::TOO_MANY_REQUESTS, body),
            ProviderError::QuotaExceeded(_)
        ));
    }

    fn delta_line(content: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n")
    }

    async fn decode_chunks(
        chunks: Vec<Result<Vec<u8>, ProviderError>>,
    ) -> Vec<Result<Fragment, ProviderError>> {
        decode_body(futures_util::stream::iter(chunks)).collect().await
    }

    #[tokio::test]
    async fn line_split_across_chunks_is_reassembled() {
        let body = format!("{}data: [DONE]\n", delta_line("hello"));
        let (head, tail) = body.split_at(20);

        let decoded = decode_chunks(vec![
            Ok(head.as_bytes().to_vec()),
            Ok(tail.as_bytes().to_vec()),
        ])
        .await;

        assert_eq!(decoded, vec![Ok(Fragment::from("hello"))]);
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks_survives() {
        let body = format!("{}data: [DONE]\n", delta_line("café ✓"));
        let bytes = body.as_bytes();
        let split = bytes
            .iter()
            .position(|byte| *byte == 0xC3)
            .expect("body contains é")
            + 1;

        let decoded = decode_chunks(vec![
            Ok(bytes[..split].to_vec()),
            Ok(bytes[split..].to_vec()),
        ])
        .await;

        assert_eq!(decoded, vec![Ok(Fragment::from("café ✓"))]);
    }

    #[tokio::test]
    async fn transport_error_mid_stream_ends_the_stream() {
        let decoded = decode_chunks(vec![
            Ok(delta_line("one").into_bytes()),
            Err(ProviderError::Fault("connection reset".to_owned())),
            Ok(delta_line("two").into_bytes()),
        ])
        .await;

        assert_eq!(
            decoded,
            vec![
                Ok(Fragment::from("one")),
                Err(ProviderError::Fault("connection reset".to_owned())),
            ]
        );
    }

    #[tokio::test]
    async fn eof_without_completion_is_a_fault() {
        let decoded = decode_chunks(vec![Ok(delta_line("one").into_bytes())]).await;

        assert_eq!(
            decoded,
            vec![
                Ok(Fragment::from("one")),
                Err(ProviderError::Fault(
                    "stream closed before completion was signalled".to_owned()
                )),
            ]
        );
    }

    #[tokio::test]
    async fn final_line_without_newline_still_completes() {
        let body = format!("{}data: [DONE]", delta_line("hi"));
        let decoded = decode_chunks(vec![Ok(body.into_bytes())]).await;
        assert_eq!(decoded, vec![Ok(Fragment::from("hi"))]);

        let body = r#"data: {"choices":[{"delta":{"content":"bye"},"finish_reason":"stop"}]}"#;
        let decoded = decode_chunks(vec![Ok(body.as_bytes().to_vec())]).await;
        assert_eq!(decoded, vec![Ok(Fragment::from("bye"))]);
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let mut line = b"data: ".to_vec();
        line.extend(std::iter::repeat(b'a').take(MAX_LINE_BYTES));

        let decoded = decode_chunks(vec![Ok(line), Ok(b"\ndata: [DONE]\n".to_vec())]).await;

        assert_eq!(decoded.len(), 1);
        match &decoded[0] {
            Err(ProviderError::Fault(message)) => assert!(message.contains("exceeds")),
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[test]
    fn payload_includes_system_instruction_and_skips_unset_sampling() {
        let request = GenerationRequest {
            request_id: "req_1".to_owned(),
            prompt: "hello".to_owned(),
            system_instruction: Some("be brief".to_owned()),
            sampling: SamplingParams {
                temperature: Some(0.5),
                top_p: None,
                max_tokens: None,
            },
        };

        let payload = serde_json::to_value(ChatCompletionPayload::streaming("gpt-4o-mini", &request))
            .expect("serializable");

        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "hello");
        assert_eq!(payload["temperature"], 0.5);
        assert_eq!(payload["stream"], true);
        assert!(payload.get("top_p").is_none());
    }
}
