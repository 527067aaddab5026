//! Commands the host wallet (World App) performs for the client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{PaymentTerms, Token};
use crate::payment::{PayFinalPayload, PaymentReference};
use crate::siwe::WalletAuthPayload;

/// Failure to run a wallet command at all. A command the user declines is not
/// an error; it comes back as an `error` payload.
#[derive(Debug, Error)]
pub enum WalletError {
    /// The app is not running inside the wallet.
    #[error("wallet is not available")]
    Unavailable,
    /// The wallet failed to execute the command.
    #[error("wallet command failed: {0}")]
    Command(String),
}

/// One token transfer of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    /// Token to pay with.
    pub symbol: Token,
    /// Amount in the token's smallest unit, as a decimal string.
    pub token_amount: String,
}

/// Input of the wallet's `pay` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayRequest {
    /// Reference obtained from `POST /api/initiate-payment`.
    pub reference: PaymentReference,
    /// Recipient address.
    pub to: String,
    /// Transfers to make.
    pub tokens: Vec<TokenTransfer>,
    /// Shown to the user in the wallet.
    pub description: String,
}

impl PayRequest {
    /// Builds the request for one credit bundle under `terms`.
    #[must_use]
    pub fn for_credits(reference: PaymentReference, terms: &PaymentTerms) -> Self {
        Self {
            reference,
            to: terms.recipient.to_checksum(None),
            tokens: vec![TokenTransfer {
                symbol: terms.token,
                token_amount: terms.expected_amount().to_string(),
            }],
            description: terms.description.clone(),
        }
    }
}

/// The wallet as seen by the client.
#[async_trait]
pub trait WalletCommands: Send + Sync {
    /// Asks the user to sign in with their wallet over `nonce`.
    ///
    /// # Errors
    ///
    /// When the command cannot be run.
    async fn wallet_auth(&self, nonce: &str) -> Result<WalletAuthPayload, WalletError>;

    /// Asks the user to approve `request`.
    ///
    /// # Errors
    ///
    /// When the command cannot be run.
    async fn pay(&self, request: &PayRequest) -> Result<PayFinalPayload, WalletError>;
}
