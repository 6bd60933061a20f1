//! Anthropic Messages API adapter with SSE streaming

use crate::provider::{CompletionError, CompletionResult, CompletionService};
use crate::types::{CompletionRequest, StreamDelta, Usage, DEFAULT_MODEL};
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, error};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub type CompletionStream = Pin<Box<dyn Stream<Item = CompletionResult<StreamDelta>> + Send>>;

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    system: Option<String>,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 512,
            system: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub async fn open_stream(
        &self,
        request: CompletionRequest,
    ) -> CompletionResult<CompletionStream> {
        let body = AnthropicRequest { request, stream: true };

        debug!("Anthropic request: model={}", body.request.model);

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Anthropic error {}: {}", status, error_text);

            return Err(match status.as_u16() {
                401 => CompletionError::AuthFailed(error_text),
                429 => CompletionError::RateLimited { retry_after_ms: 60000 },
                _ => CompletionError::RequestFailed(format!("{}: {}", status, error_text)),
            });
        }

        Ok(Box::pin(parse_sse_stream(response.bytes_stream())))
    }
}

#[async_trait::async_trait]
impl CompletionService for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, prompt: &str, timeout: Duration) -> CompletionResult<String> {
        let mut request = CompletionRequest::single(self.model.clone(), prompt, self.max_tokens);
        request.system = self.system.clone();

        let call = async {
            let stream = self.open_stream(request).await?;
            collect_text(stream).await
        };
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| CompletionError::Timeout(timeout))?
    }
}

/// Drain a delta stream into the full response text.
pub async fn collect_text<S>(stream: S) -> CompletionResult<String>
where
    S: Stream<Item = CompletionResult<StreamDelta>>,
{
    tokio::pin!(stream);
    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::Text(t) => text.push_str(&t),
            StreamDelta::Done { stop_reason } => {
                debug!("Completion done: stop_reason={:?}", stop_reason);
                break;
            }
        }
    }
    if text.trim().is_empty() {
        return Err(CompletionError::StreamError("empty completion".into()));
    }
    Ok(text)
}

pub fn parse_sse_stream<E>(
    bytes_stream: impl Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
) -> impl Stream<Item = CompletionResult<StreamDelta>> + Send
where
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut buffer = String::new();

        tokio::pin!(bytes_stream);

        while let Some(chunk_result) = bytes_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(CompletionError::StreamError(e.to_string()));
                    continue;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(event_end) = buffer.find("\n\n") {
                let event_str = buffer[..event_end].to_string();
                buffer = buffer[event_end + 2..].to_string();

                let mut event_type = String::new();
                let mut event_data = String::new();

                for line in event_str.lines() {
                    if let Some(rest) = line.strip_prefix("event: ") {
                        event_type = rest.to_string();
                    } else if let Some(rest) = line.strip_prefix("data: ") {
                        event_data = rest.to_string();
                    }
                }

                if event_data.is_empty() { continue; }

                match event_type.as_str() {
                    "content_block_delta" => {
                        if let Ok(data) = serde_json::from_str::<ContentBlockDelta>(&event_data) {
                            if let DeltaType::TextDelta { text } = data.delta {
                                yield Ok(StreamDelta::Text(text));
                            }
                        }
                    }
                    "message_delta" => {
                        if let Ok(data) = serde_json::from_str::<MessageDelta>(&event_data) {
                            if let Some(usage) = data.usage {
                                debug!(
                                    "Usage: in={} out={}",
                                    usage.input_tokens, usage.output_tokens
                                );
                            }
                            if let Some(stop_reason) = data.delta.stop_reason {
                                debug!("Message complete: stop_reason={}", stop_reason);
                            }
                        }
                    }
                    "message_stop" => {
                        yield Ok(StreamDelta::Done { stop_reason: Some("end_turn".to_string()) });
                    }
                    "error" => {
                        if let Ok(data) = serde_json::from_str::<ErrorEvent>(&event_data) {
                            yield Err(CompletionError::StreamError(data.error.message));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[derive(serde::Serialize)]
struct AnthropicRequest {
    #[serde(flatten)]
    request: CompletionRequest,
    stream: bool,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaType,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum DeltaType {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaContent,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct MessageDeltaContent {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sse(chunks: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
        let owned: Vec<Result<Bytes, std::io::Error>> =
            chunks.iter().map(|c| Ok(Bytes::from(c.to_string()))).collect();
        futures::stream::iter(owned)
    }

    #[tokio::test]
    async fn text_deltas_are_concatenated() {
        let stream = parse_sse_stream(sse(&[
            "event: content_block_delta\ndata: {\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"MOOD: calm\"}}\n\n",
            "event: content_block_delta\ndata: {\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"\\nall quiet\"}}\n\n",
            "event: message_stop\ndata: {}\n\n",
        ]));
        let text = collect_text(stream).await.unwrap();
        assert_eq!(text, "MOOD: calm\nall quiet");
    }

    #[tokio::test]
    async fn events_split_across_chunks_are_reassembled() {
        let stream = parse_sse_stream(sse(&[
            "event: content_block_delta\ndata: {\"index\":0,\"delta\":{\"type\":\"text_",
            "delta\",\"text\":\"joined\"}}\n\nevent: message_stop\ndata: {}\n\n",
        ]));
        assert_eq!(collect_text(stream).await.unwrap(), "joined");
    }

    #[tokio::test]
    async fn error_event_surfaces_as_stream_error() {
        let stream = parse_sse_stream(sse(&[
            "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        ]));
        let err = collect_text(stream).await.unwrap_err();
        assert!(matches!(err, CompletionError::StreamError(ref m) if m == "Overloaded"));
    }

    #[tokio::test]
    async fn empty_stream_is_an_error() {
        let stream = parse_sse_stream(sse(&["event: message_stop\ndata: {}\n\n"]));
        assert!(collect_text(stream).await.is_err());
    }

    #[test]
    fn request_body_is_flattened_with_stream_flag() {
        let body = AnthropicRequest {
            request: CompletionRequest::single("m", "hi", 64),
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["max_tokens"], 64);
        assert_eq!(json["messages"][0]["content"], "hi");
        assert!(json.get("system").is_none());
    }
}
