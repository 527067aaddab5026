//! Credit-gated AI consultation.
//!
//! The server side ([`generator`]) turns a conversation into a stream of text
//! from a chat model. The client side ([`session`]) holds the conversation,
//! takes a credit when it admits a turn and keeps it only when the turn is
//! answered.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::AicurateError;

pub mod generator;
pub mod session;

pub use generator::{OpenAiChat, TextGenerator, DEFAULT_MODEL, MAX_STREAM_DURATION, SYSTEM_PROMPT};
pub use session::{ConsultationBackend, ConsultationSession, SessionState, TurnReceipt};

/// Text chunks of a reply, in order.
pub type TextStream = BoxStream<'static, Result<String, ConsultationError>>;

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions to the model.
    System,
    /// The person consulting.
    User,
    /// The model.
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the turn.
    pub role: Role,
    /// Text of the turn.
    pub content: String,
}

impl ChatMessage {
    /// A turn written by the user.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// A turn written by the model.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Instructions to the model.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Body of `POST /api/ai`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultationRequest {
    /// The conversation so far, ending with the user's new turn.
    pub messages: Vec<ChatMessage>,
    /// The client's claim that it holds at least one credit.
    #[serde(default)]
    pub has_credits: bool,
}

/// Errors of a consultation turn. Any credit taken for the turn is refunded.
#[derive(Debug, Error)]
pub enum ConsultationError {
    /// The prompt is blank.
    #[error("prompt is empty")]
    EmptyPrompt,
    /// A reply is still streaming; the new turn was not queued.
    #[error("a consultation is already in progress")]
    AlreadyStreaming,
    /// No credit is left.
    #[error("Payment required for consultation")]
    PaymentRequired,
    /// The generator or the consultation endpoint refused the request.
    #[error("consultation failed (status {status:?}): {message}")]
    Upstream {
        /// HTTP status, when there was one.
        status: Option<u16>,
        /// Upstream message.
        message: String,
    },
    /// The reply stream broke off.
    #[error("consultation stream interrupted: {0}")]
    Stream(String),
    /// The reply did not finish in time.
    #[error("consultation timed out")]
    Timeout,
    /// The stream completed without any text.
    #[error("consultation produced no reply")]
    EmptyReply,
    /// The generator is not configured.
    #[error("configuration_error: {0}")]
    Configuration(String),
    /// The credit ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<reqwest::Error> for ConsultationError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Stream(error.to_string())
        }
    }
}

impl From<AicurateError> for ConsultationError {
    fn from(error: AicurateError) -> Self {
        match error {
            AicurateError::Configuration(message) => Self::Configuration(message),
            AicurateError::Timeout(_) => Self::Timeout,
            AicurateError::Reqwest(error) => error.into(),
            AicurateError::NetworkError { status, error, .. } => Self::Upstream {
                status,
                message: error,
            },
            other => Self::Upstream {
                status: None,
                message: other.to_string(),
            },
        }
    }
}
