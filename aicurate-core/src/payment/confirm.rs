//! Server-side confirmation of wallet payments.
//!
//! A payment counts only when the Developer Portal reports a transaction for
//! an issued reference that pays the configured recipient the expected token
//! amount. Anything the confirmer cannot check is refused. Each reference is
//! redeemed by one transaction; asking again about that same transaction is
//! answered with [`PaymentVerdict::AlreadyConfirmed`] so a client that lost the
//! first answer can retry.

use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::reference::PaymentRegistry;
use crate::config::{PaymentTerms, ServiceEndpoints, Token};
use crate::http_request::Request;
use crate::identity::AppId;
use crate::{AicurateError, Environment};

/// Final result of the wallet's `pay` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PayFinalPayload {
    /// The wallet submitted a transaction.
    Success {
        /// Developer Portal identifier of the submitted transaction.
        transaction_id: String,
        /// Reference the payment was made for.
        reference: String,
        /// Paying address.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    /// The user cancelled or the wallet failed.
    Error {
        /// Wallet error code, e.g. `user_rejected`.
        error_code: String,
    },
}

/// On-chain state of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Submitted, not yet included.
    Pending,
    /// Included in a block.
    Mined,
    /// Reverted or dropped.
    Failed,
}

/// Transaction as reported by the Developer Portal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransactionRecord {
    /// Reference attached by the wallet.
    pub reference: String,
    /// On-chain state.
    #[serde(alias = "transactionStatus")]
    pub transaction_status: TransactionStatus,
    /// Receiving address.
    #[serde(alias = "recipient_address", alias = "recipientAddress")]
    pub to: String,
    /// Token symbol.
    pub token: String,
    /// Amount in the token's smallest unit, as a decimal string.
    #[serde(alias = "tokenAmount", alias = "input_token_amount")]
    pub token_amount: String,
}

/// Looks up transactions submitted by wallets.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Fetches the transaction `transaction_id`.
    ///
    /// # Errors
    ///
    /// [`AicurateError::Configuration`] when the source lacks credentials;
    /// any other error means the lookup failed.
    async fn transaction(&self, transaction_id: &str) -> Result<TransactionRecord, AicurateError>;
}

/// [`TransactionSource`] backed by the Developer Portal's MiniKit API.
#[derive(Debug)]
pub struct DevPortalTransactions {
    developer_portal: String,
    app_id: Option<AppId>,
    api_key: Option<SecretString>,
    request: Request,
}

impl DevPortalTransactions {
    /// Creates a source authenticated with `api_key` for `app_id`.
    #[must_use]
    pub fn new(
        app_id: Option<AppId>,
        api_key: Option<SecretString>,
        endpoints: &ServiceEndpoints,
        environment: Environment,
    ) -> Self {
        Self {
            developer_portal: endpoints.developer_portal.trim_end_matches('/').to_string(),
            app_id,
            api_key,
            request: Request::new(environment),
        }
    }
}

#[async_trait]
impl TransactionSource for DevPortalTransactions {
    async fn transaction(&self, transaction_id: &str) -> Result<TransactionRecord, AicurateError> {
        let app_id = self
            .app_id
            .as_ref()
            .ok_or_else(|| AicurateError::Configuration("APP_ID not configured".to_string()))?;
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            AicurateError::Configuration("DEV_PORTAL_API_KEY not configured".to_string())
        })?;
        let well_formed = !transaction_id.is_empty()
            && transaction_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !well_formed {
            return Err(AicurateError::InvalidInput("malformed transaction id".to_string()));
        }

        let url = format!(
            "{}/api/v2/minikit/transaction/{transaction_id}",
            self.developer_portal
        );
        let builder = self
            .request
            .get(&url)?
            .query(&[("app_id", app_id.as_str()), ("type", "payment")])
            .bearer_auth(api_key.expose_secret());
        let response = self.request.handle(builder).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AicurateError::NetworkError {
                url,
                status: Some(status.as_u16()),
                error: "transaction lookup refused".to_string(),
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(AicurateError::serialization)
    }
}

/// Why a payment was or was not confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentVerdict {
    /// The wallet reported an error instead of a transaction.
    PayloadError,
    /// The reference was never issued, has expired or was confirmed by another
    /// transaction.
    UnknownReference,
    /// The transaction could not be looked up.
    LookupFailed,
    /// The transaction carries a different reference.
    ReferenceMismatch,
    /// The transaction failed on chain.
    TransactionFailed,
    /// The transaction pays someone else.
    RecipientMismatch,
    /// The transaction pays in another token.
    TokenMismatch,
    /// The transaction pays a different amount.
    AmountMismatch,
    /// The payment is genuine and its reference is now spent.
    Confirmed,
    /// This transaction already redeemed the reference.
    AlreadyConfirmed,
}

impl PaymentVerdict {
    /// Whether credits may be granted.
    #[must_use]
    pub const fn is_confirmed(self) -> bool {
        matches!(self, Self::Confirmed | Self::AlreadyConfirmed)
    }
}

/// Confirms wallet payments against the terms of a purchase.
#[derive(Clone)]
pub struct PaymentConfirmer {
    registry: Arc<PaymentRegistry>,
    source: Arc<dyn TransactionSource>,
    terms: Option<PaymentTerms>,
}

impl PaymentConfirmer {
    /// Creates a confirmer. `terms` is `None` when no payment recipient is
    /// configured, in which case every confirmation is a configuration error.
    #[must_use]
    pub fn new(
        registry: Arc<PaymentRegistry>,
        source: Arc<dyn TransactionSource>,
        terms: Option<PaymentTerms>,
    ) -> Self {
        Self {
            registry,
            source,
            terms,
        }
    }

    /// Confirms `payload`, answering only whether credits may be granted.
    ///
    /// # Errors
    ///
    /// Only when the confirmer is not configured.
    pub async fn confirm(&self, payload: &PayFinalPayload) -> Result<bool, AicurateError> {
        Ok(self.confirm_detailed(payload).await?.is_confirmed())
    }

    /// Confirms `payload` and reports the reason for the decision.
    ///
    /// Lookups that fail are never treated as confirmations.
    ///
    /// # Errors
    ///
    /// Only when the confirmer is not configured.
    pub async fn confirm_detailed(
        &self,
        payload: &PayFinalPayload,
    ) -> Result<PaymentVerdict, AicurateError> {
        let terms = self.terms.as_ref().ok_or_else(|| {
            AicurateError::Configuration("PAYMENT_RECIPIENT not configured".to_string())
        })?;

        let (transaction_id, reference) = match payload {
            PayFinalPayload::Error { error_code } => {
                tracing::info!(%error_code, "wallet reported a failed payment");
                return Ok(PaymentVerdict::PayloadError);
            }
            PayFinalPayload::Success {
                transaction_id,
                reference,
                ..
            } => (transaction_id, reference),
        };

        if self.registry.redeemed_by(reference, transaction_id) {
            tracing::info!(%transaction_id, %reference, "payment already confirmed");
            return Ok(PaymentVerdict::AlreadyConfirmed);
        }
        if !self.registry.is_pending(reference) {
            tracing::warn!(%reference, "confirmation for unknown reference");
            return Ok(PaymentVerdict::UnknownReference);
        }

        let record = match self.source.transaction(transaction_id).await {
            Ok(record) => record,
            Err(err) if err.is_configuration() => return Err(err),
            Err(err) => {
                tracing::warn!(%transaction_id, error = %err, "transaction lookup failed");
                return Ok(PaymentVerdict::LookupFailed);
            }
        };

        let verdict = check_record(&record, reference, terms);
        if verdict != PaymentVerdict::Confirmed {
            tracing::warn!(%transaction_id, %reference, ?verdict, "payment not confirmed");
            return Ok(verdict);
        }

        if !self.registry.redeem(reference, transaction_id) {
            // Lost a race with another confirmation of the same reference.
            if self.registry.redeemed_by(reference, transaction_id) {
                return Ok(PaymentVerdict::AlreadyConfirmed);
            }
            return Ok(PaymentVerdict::UnknownReference);
        }
        tracing::info!(%transaction_id, %reference, "payment confirmed");
        Ok(PaymentVerdict::Confirmed)
    }
}

fn check_record(record: &TransactionRecord, reference: &str, terms: &PaymentTerms) -> PaymentVerdict {
    if record.reference != reference {
        return PaymentVerdict::ReferenceMismatch;
    }
    if record.transaction_status == TransactionStatus::Failed {
        return PaymentVerdict::TransactionFailed;
    }
    if Address::from_str(record.to.trim()).ok() != Some(terms.recipient) {
        return PaymentVerdict::RecipientMismatch;
    }
    if Token::from_str(&record.token).ok() != Some(terms.token) {
        return PaymentVerdict::TokenMismatch;
    }
    if U256::from_str(record.token_amount.trim()).ok() != Some(terms.expected_amount()) {
        return PaymentVerdict::AmountMismatch;
    }
    PaymentVerdict::Confirmed
}
