// Chat-completion API client (OpenRouter / OpenAI compatible)

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::stream::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

use crate::models::AppConfig;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk, TransportError>> + Send>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

impl ApiError {
    fn into_transport_error(self) -> TransportError {
        let code = self
            .code
            .as_ref()
            .and_then(serde_json::Value::as_u64)
            .and_then(|c| u16::try_from(c).ok());
        TransportError::Upstream {
            code,
            message: self.message,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseChoice {
    #[serde(default)]
    pub message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

impl ChatCompletionResponse {
    /// Text of the first choice, empty when the upstream sent none.
    pub fn text(&self) -> &str {
        self.choices
            .first()
            .and_then(|choice| choice.message.as_ref())
            .and_then(|message| message.content.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Delta,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

impl ChatCompletionChunk {
    pub fn fragment(&self) -> &str {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint could not be reached or timed out.
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("API request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    /// An error object delivered inside an otherwise successful response.
    #[error("upstream error: {message}")]
    Upstream { code: Option<u16>, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::Connection(e.to_string())
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            Self::Connection(e.to_string())
        }
    }
}

/// Carries one chat-completion exchange. The credential is supplied per call.
pub trait CompletionTransport: Send + Sync {
    fn complete<'a>(
        &'a self,
        api_key: &'a str,
        request: &'a ChatCompletionRequest,
    ) -> BoxFuture<'a, Result<ChatCompletionResponse, TransportError>>;

    fn complete_stream<'a>(
        &'a self,
        api_key: &'a str,
        request: &'a ChatCompletionRequest,
    ) -> BoxFuture<'a, Result<ChunkStream, TransportError>>;
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    base_url: String,
    site_url: String,
    site_name: String,
    client: Client,
}

impl OpenRouterClient {
    pub fn new(base_url: String, request_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            site_url: String::new(),
            site_name: String::new(),
            client,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut client = Self::new(config.api_base.clone(), config.request_timeout)?;
        client.site_url.clone_from(&config.site_url);
        client.site_name.clone_from(&config.site_name);
        Ok(client)
    }

    fn post(&self, api_key: &str, request: &ChatCompletionRequest) -> RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(url).bearer_auth(api_key).json(request);

        if !self.site_url.is_empty() {
            builder = builder.header("HTTP-Referer", &self.site_url);
        }
        if !self.site_name.is_empty() {
            builder = builder.header("X-Title", &self.site_name);
        }
        builder
    }

    async fn send(
        &self,
        api_key: &str,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self.post(api_key, request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: if body.is_empty() {
                    status.canonical_reason().unwrap_or_default().to_string()
                } else {
                    body
                },
            });
        }

        Ok(response)
    }
}

impl CompletionTransport for OpenRouterClient {
    fn complete<'a>(
        &'a self,
        api_key: &'a str,
        request: &'a ChatCompletionRequest,
    ) -> BoxFuture<'a, Result<ChatCompletionResponse, TransportError>> {
        Box::pin(async move {
            let response = self.send(api_key, request).await?;
            let body = response.text().await?;
            let parsed: ChatCompletionResponse =
                serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))?;

            match parsed.error {
                Some(error) => Err(error.into_transport_error()),
                None => Ok(parsed),
            }
        })
    }

    fn complete_stream<'a>(
        &'a self,
        api_key: &'a str,
        request: &'a ChatCompletionRequest,
    ) -> BoxFuture<'a, Result<ChunkStream, TransportError>> {
        Box::pin(async move {
            let response = self.send(api_key, request).await?;
            Ok(decode_event_stream(response.bytes_stream()))
        })
    }
}

enum EventLine {
    Skip,
    Done,
    Chunk(Result<ChatCompletionChunk, TransportError>),
}

fn parse_event_line(line: &[u8]) -> EventLine {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();

    if trimmed.is_empty() || trimmed.starts_with(':') {
        return EventLine::Skip;
    }
    let Some(payload) = trimmed.strip_prefix("data:") else {
        // event:, id:, retry: fields carry nothing we use
        return EventLine::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return EventLine::Done;
    }

    let chunk = serde_json::from_str::<ChatCompletionChunk>(payload)
        .map_err(|e| TransportError::Decode(format!("Failed to parse streaming chunk: {e}")))
        .and_then(|mut chunk| match chunk.error.take() {
            Some(error) => Err(error.into_transport_error()),
            None => Ok(chunk),
        });
    EventLine::Chunk(chunk)
}

/// Turn a raw server-sent-events byte stream into completion chunks.
///
/// Lines may be split across network reads; a trailing line without a
/// newline is still decoded when the body ends. `data: [DONE]` ends the stream.
pub fn decode_event_stream<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<TransportError> + Send,
{
    let stream = futures::stream::unfold(
        (Box::pin(bytes), Vec::new(), false),
        |(mut source, mut buffer, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_event_line(&line) {
                        EventLine::Skip => continue,
                        EventLine::Done => return None,
                        EventLine::Chunk(result) => {
                            return Some((result, (source, buffer, false)));
                        }
                    }
                }

                match source.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => return Some((Err(e.into()), (source, buffer, true))),
                    None => {
                        let line = std::mem::take(&mut buffer);
                        return match parse_event_line(&line) {
                            EventLine::Chunk(result) => Some((result, (source, buffer, true))),
                            EventLine::Skip | EventLine::Done => None,
                        };
                    }
                }
            }
        },
    );

    Box::pin(stream)
}

/// Whether a status code means the credential was rejected.
pub fn is_auth_status(status: u16) -> bool {
    StatusCode::from_u16(status).is_ok_and(|s| s == StatusCode::UNAUTHORIZED)
}
