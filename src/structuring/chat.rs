//! OpenAI-compatible chat-completion adapter, streamed or buffered.

use super::{StructuringClient, StructuringError, system_prompt};
use crate::config::{LlmProvider, LlmSettings};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{StreamExt, pin_mut};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chat-completion client used as the structuring collaborator.
pub struct ChatCompletionClient {
    http: Client,
    provider: LlmProvider,
    base_url: String,
    api_key: String,
    model: String,
    stream: bool,
}

impl ChatCompletionClient {
    /// Build a client from the configured provider settings.
    pub fn new(settings: &LlmSettings) -> Result<Self, StructuringError> {
        let http = Client::builder()
            .user_agent("resume-intake/structuring")
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| StructuringError::Unavailable(error.to_string()))?;
        tracing::debug!(
            provider = ?settings.provider,
            base_url = %settings.base_url,
            model = %settings.model,
            stream = settings.stream,
            "Initialized chat-completion client"
        );
        Ok(Self {
            http,
            provider: settings.provider,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            stream: settings.stream,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn send(&self, text: &str) -> Result<Response, StructuringError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt() },
                { "role": "user", "content": text },
            ],
            "temperature": 0.2,
            "stream": self.stream,
        });

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                StructuringError::Unavailable(format!(
                    "failed to reach {:?} at {}: {error}",
                    self.provider, self.base_url
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StructuringError::UnexpectedStatus { status, body });
        }
        Ok(response)
    }

    async fn collect_buffered(response: Response) -> Result<String, StructuringError> {
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|error| StructuringError::InvalidResponse(error.to_string()))?;
        if let Some(usage) = &body.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "Completion usage"
            );
        }
        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }

    async fn collect_streamed(response: Response) -> Result<String, StructuringError> {
        let deltas = content_deltas(response);
        pin_mut!(deltas);
        let mut content = String::new();
        while let Some(delta) = deltas.next().await {
            content.push_str(&delta?);
        }
        Ok(content)
    }
}

#[async_trait]
impl StructuringClient for ChatCompletionClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn structure(&self, text: &str) -> Result<String, StructuringError> {
        let started = Instant::now();
        let result = async {
            let response = self.send(text).await?;
            let content = if self.stream {
                Self::collect_streamed(response).await?
            } else {
                Self::collect_buffered(response).await?
            };
            if content.trim().is_empty() {
                return Err(StructuringError::EmptyOutput);
            }
            Ok(content)
        }
        .await;

        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(content) => tracing::info!(
                model = %self.model,
                latency_ms,
                chars = content.len(),
                "Structuring call succeeded"
            ),
            Err(error) => tracing::warn!(
                model = %self.model,
                latency_ms,
                error = %error,
                "Structuring call failed"
            ),
        }
        result
    }
}

/// Decode a server-sent event stream into content deltas, stopping at `[DONE]`.
///
/// Lines are split on raw bytes so multi-byte characters straddling chunk boundaries survive.
fn content_deltas(response: Response) -> impl Stream<Item = Result<String, StructuringError>> {
    try_stream! {
        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut finished = false;
        while !finished {
            let Some(chunk) = body.next().await else {
                break;
            };
            let chunk = chunk.map_err(|error| StructuringError::Unavailable(error.to_string()))?;
            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                match parse_sse_line(&String::from_utf8_lossy(&line))? {
                    SseLine::Delta(delta) => yield delta,
                    SseLine::Done => {
                        finished = true;
                        break;
                    }
                    SseLine::Skip => {}
                }
            }
        }
        if !finished {
            if let SseLine::Delta(delta) = parse_sse_line(&String::from_utf8_lossy(&buffer))? {
                yield delta;
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, StructuringError> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|error| StructuringError::InvalidResponse(format!("bad stream chunk: {error}")))?;
    let delta = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect::<String>();
    Ok(if delta.is_empty() {
        SseLine::Skip
    } else {
        SseLine::Delta(delta)
    })
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn settings(base_url: String, stream: bool) -> LlmSettings {
        LlmSettings {
            provider: LlmProvider::OpenAI,
            base_url,
            api_key: "test-key".into(),
            model: "gpt-4o-mini".into(),
            timeout: Duration::from_secs(5),
            stream,
        }
    }

    #[test]
    fn sse_lines_are_classified() {
        assert_eq!(parse_sse_line("data: [DONE]\n").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive\n").unwrap(), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"{\"su"}}]}"#).unwrap(),
            SseLine::Delta("{\"su".into())
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            SseLine::Skip
        );
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[tokio::test]
    async fn buffered_completion_returns_message_content() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_contains("\"temperature\":0.2");
                then.status(200).json_body(json!({
                    "choices": [{ "message": { "role": "assistant", "content": "{\"summary\":\"ok\"}" } }],
                    "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
                }));
            })
            .await;

        let client =
            ChatCompletionClient::new(&settings(server.base_url(), false)).expect("client");
        let content = client.structure("resume text").await.expect("content");

        mock.assert();
        assert_eq!(content, "{\"summary\":\"ok\"}");
    }

    #[tokio::test]
    async fn streamed_completion_aggregates_deltas() {
        let server = MockServer::start_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"summary\\\":\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\\\"ok\\\"}\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(body);
            })
            .await;

        let client = ChatCompletionClient::new(&settings(server.base_url(), true)).expect("client");
        let content = client.structure("resume text").await.expect("content");

        assert_eq!(content, "{\"summary\":\"ok\"}");
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(429).body("rate limited");
            })
            .await;

        let client =
            ChatCompletionClient::new(&settings(server.base_url(), false)).expect("client");
        let error = client
            .structure("resume text")
            .await
            .expect_err("status error");

        assert!(matches!(
            error,
            StructuringError::UnexpectedStatus { status, .. } if status.as_u16() == 429
        ));
    }

    #[tokio::test]
    async fn blank_content_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(json!({
                    "choices": [{ "message": { "content": "   " } }]
                }));
            })
            .await;

        let client =
            ChatCompletionClient::new(&settings(server.base_url(), false)).expect("client");
        let error = client.structure("resume text").await.expect_err("empty");

        assert!(matches!(error, StructuringError::EmptyOutput));
    }
}
