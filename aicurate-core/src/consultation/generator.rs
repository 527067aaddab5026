//! Server-side text generation backed by an OpenAI-compatible chat API.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{ChatMessage, ConsultationError, Role, TextStream};
use crate::config::ServiceEndpoints;
use crate::http_request::Request;
use crate::Environment;

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gpt-4-turbo-preview";

/// Upper bound on one reply, from request to last chunk.
pub const MAX_STREAM_DURATION: Duration = Duration::from_secs(30);

/// Persona of the consultant.
pub const SYSTEM_PROMPT: &str = "You are Madame Dappai, a sophisticated and knowledgeable AI \
consultant specializing in AI tools and applications. You have a warm yet professional demeanor \
and speak with authority about AI technology. Your responses should be insightful, practical, and \
occasionally include relevant examples or use cases. When recommending tools, consider factors \
like:
- User's specific needs and use cases
- Tool's features and limitations
- Pricing and value proposition
- Integration capabilities
- Learning curve and user experience
Always maintain a helpful and encouraging tone while being honest about both benefits and \
limitations.";

/// Produces the consultant's reply to a conversation.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Starts generating a reply to `conversation`.
    ///
    /// # Errors
    ///
    /// When the model cannot be reached or refuses the request. Errors after
    /// the first chunk are reported inside the stream.
    async fn generate(&self, conversation: Vec<ChatMessage>) -> Result<TextStream, ConsultationError>;
}

/// [`TextGenerator`] calling an OpenAI-compatible chat completion endpoint.
#[derive(Debug)]
pub struct OpenAiChat {
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    request: Request,
}

impl OpenAiChat {
    /// Creates a generator for `endpoints.openai` using [`DEFAULT_MODEL`].
    #[must_use]
    pub fn new(
        endpoints: &ServiceEndpoints,
        api_key: Option<SecretString>,
        environment: Environment,
    ) -> Self {
        Self {
            base_url: endpoints.openai.trim_end_matches('/').to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            request: Request::new(environment).timeout(MAX_STREAM_DURATION),
        }
    }

    /// Uses `model` instead of the default.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl TextGenerator for OpenAiChat {
    async fn generate(&self, conversation: Vec<ChatMessage>) -> Result<TextStream, ConsultationError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            ConsultationError::Configuration("OPENAI_API_KEY not configured".to_string())
        })?;

        // Clients cannot replace the persona.
        let messages: Vec<ChatMessage> = std::iter::once(ChatMessage::system(SYSTEM_PROMPT))
            .chain(conversation.into_iter().filter(|m| m.role != Role::System))
            .collect();
        let body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "messages": messages,
        });

        let url = format!("{}/v1/chat/completions", self.base_url);
        let builder = self
            .request
            .post(&url)?
            .bearer_auth(api_key.expose_secret())
            .json(&body);
        let response = self.request.send_once(builder).await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "chat completion refused");
            return Err(ConsultationError::Upstream {
                status: Some(status.as_u16()),
                message,
            });
        }

        tracing::debug!(model = %self.model, turns = messages.len(), "streaming consultation");
        Ok(chat_deltas(Box::pin(response.bytes_stream())))
    }
}

#[derive(Deserialize)]
struct ChunkEvent {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<EventError>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct EventError {
    message: String,
}

enum EventLine {
    Text(String),
    Done,
    Skip,
}

fn parse_line(line: &[u8]) -> Result<EventLine, ConsultationError> {
    let line = std::str::from_utf8(line)
        .map_err(|err| ConsultationError::Stream(format!("invalid utf-8 in event: {err}")))?
        .trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(EventLine::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(EventLine::Done);
    }

    let event: ChunkEvent = serde_json::from_str(data)
        .map_err(|err| ConsultationError::Stream(format!("malformed event: {err}")))?;
    if let Some(error) = event.error {
        return Err(ConsultationError::Upstream {
            status: None,
            message: error.message,
        });
    }
    Ok(event
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty())
        .map_or(EventLine::Skip, EventLine::Text))
}

/// Decodes a chat completion event stream into the text deltas it carries.
pub(crate) fn chat_deltas<S, B, E>(mut bytes: S) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ConsultationError> + Send + 'static,
{
    Box::pin(try_stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut done = false;

        while !done {
            let Some(chunk) = bytes.next().await else {
                break;
            };
            let chunk = chunk.map_err(Into::<ConsultationError>::into)?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                match parse_line(&line)? {
                    EventLine::Text(text) => yield text,
                    EventLine::Done => {
                        done = true;
                        break;
                    }
                    EventLine::Skip => {}
                }
            }
        }

        if !done && !buffer.is_empty() {
            if let EventLine::Text(text) = parse_line(&buffer)? {
                yield text;
            }
        }
    })
}
