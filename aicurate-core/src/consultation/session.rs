//! Client-side consultation turns and their credit accounting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;

use super::{ChatMessage, ConsultationError, ConsultationRequest, TextStream};
use crate::ledger::{CreditLedger, LedgerError};

/// Where a session sends its turns, usually `POST /api/ai`.
#[async_trait]
pub trait ConsultationBackend: Send + Sync {
    /// Opens the reply stream for `request`.
    ///
    /// # Errors
    ///
    /// [`ConsultationError::PaymentRequired`] when the backend refuses for
    /// lack of credits; any other error when the request fails.
    async fn open(&self, request: ConsultationRequest) -> Result<TextStream, ConsultationError>;
}

/// What the session can do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Ready to accept a prompt.
    Idle,
    /// A reply is arriving; new prompts are rejected.
    Streaming,
    /// Idle but out of credits; prompts are rejected until a purchase.
    Blocked,
}

/// Result of an answered turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReceipt {
    /// Full text of the reply.
    pub reply: String,
    /// Balance after the turn.
    pub remaining: u32,
}

#[derive(Default)]
struct Conversation {
    turns: Vec<ChatMessage>,
    streaming: bool,
}

/// Client-side controller of one consultation conversation.
pub struct ConsultationSession {
    ledger: Arc<CreditLedger>,
    backend: Arc<dyn ConsultationBackend>,
    conversation: Mutex<Conversation>,
}

/// Holds the credit taken at admission. Unless the turn is answered, dropping
/// it refunds the credit and removes the prompt.
struct PendingTurn<'a> {
    session: &'a ConsultationSession,
    user_turn: usize,
    answered: bool,
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        let mut conversation = self.session.lock();
        if !self.answered {
            conversation.turns.truncate(self.user_turn);
            match self.session.ledger.credit(1) {
                Ok(balance) => {
                    tracing::debug!(balance, "consultation turn abandoned, credit refunded");
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to refund abandoned consultation turn");
                }
            }
        }
        conversation.streaming = false;
    }
}

impl ConsultationSession {
    /// Creates an empty conversation charging `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<CreditLedger>, backend: Arc<dyn ConsultationBackend>) -> Self {
        Self {
            ledger,
            backend,
            conversation: Mutex::new(Conversation::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Conversation> {
        self.conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.lock().streaming {
            SessionState::Streaming
        } else if self.ledger.has_credits() {
            SessionState::Idle
        } else {
            SessionState::Blocked
        }
    }

    /// The answered turns so far.
    #[must_use]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.lock().turns.clone()
    }

    /// Forgets the conversation.
    ///
    /// # Errors
    ///
    /// [`ConsultationError::AlreadyStreaming`] while a reply is arriving.
    pub fn reset(&self) -> Result<(), ConsultationError> {
        let mut conversation = self.lock();
        if conversation.streaming {
            return Err(ConsultationError::AlreadyStreaming);
        }
        conversation.turns.clear();
        Ok(())
    }

    /// Sends `prompt` and streams the reply into `on_chunk`.
    ///
    /// One credit is taken before the request is sent. If the turn fails, or
    /// the returned future is dropped before completion, the credit is given
    /// back and the prompt is removed from the conversation.
    ///
    /// # Errors
    ///
    /// [`ConsultationError::EmptyPrompt`], [`ConsultationError::AlreadyStreaming`],
    /// [`ConsultationError::PaymentRequired`] or [`ConsultationError::Ledger`]
    /// before anything is sent; backend and stream errors afterwards.
    pub async fn submit(
        &self,
        prompt: &str,
        mut on_chunk: impl FnMut(&str) + Send,
    ) -> Result<TurnReceipt, ConsultationError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ConsultationError::EmptyPrompt);
        }

        let (request, mut turn) = {
            let mut conversation = self.lock();
            if conversation.streaming {
                return Err(ConsultationError::AlreadyStreaming);
            }
            match self.ledger.debit() {
                Ok(_) => {}
                Err(LedgerError::Exhausted) => return Err(ConsultationError::PaymentRequired),
                Err(err) => {
                    tracing::error!(error = %err, "failed to charge consultation credit");
                    return Err(err.into());
                }
            }
            let user_turn = conversation.turns.len();
            conversation.turns.push(ChatMessage::user(prompt));
            conversation.streaming = true;
            let request = ConsultationRequest {
                messages: conversation.turns.clone(),
                has_credits: true,
            };
            let turn = PendingTurn {
                session: self,
                user_turn,
                answered: false,
            };
            (request, turn)
        };

        let mut stream = self.backend.open(request).await?;
        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            on_chunk(&chunk);
            reply.push_str(&chunk);
        }
        if reply.is_empty() {
            return Err(ConsultationError::EmptyReply);
        }

        self.lock()
            .turns
            .push(ChatMessage::assistant(reply.clone()));
        turn.answered = true;
        drop(turn);

        Ok(TurnReceipt {
            reply,
            remaining: self.ledger.balance(),
        })
    }
}
