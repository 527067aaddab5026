//! Completion of the wallet sign-in round trip.

use std::sync::Arc;

use crate::nonce::{NonceCheck, NonceIssuer};
use crate::siwe::{SiweVerifier, WalletAuthPayload};

/// Result of completing a wallet authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletAuthOutcome {
    /// The signature is valid and binds `address` to this session.
    Authorized {
        /// Address of the signing wallet.
        address: String,
    },
    /// The echoed nonce does not match a live session nonce. The verifier was
    /// not consulted.
    InvalidNonce(NonceCheck),
    /// The nonce matched but the message or signature was not accepted.
    Rejected {
        /// Reason suitable for the client.
        message: String,
    },
}

/// Ties [`NonceIssuer`] and a [`SiweVerifier`] together.
#[derive(Clone)]
pub struct WalletAuthGateway {
    nonces: Arc<NonceIssuer>,
    verifier: Arc<dyn SiweVerifier>,
}

impl WalletAuthGateway {
    /// Creates a gateway redeeming nonces from `nonces`.
    #[must_use]
    pub fn new(nonces: Arc<NonceIssuer>, verifier: Arc<dyn SiweVerifier>) -> Self {
        Self { nonces, verifier }
    }

    /// Completes an authorization: the nonce echoed by the client must equal
    /// the session nonce, and only then is the signed payload verified.
    pub async fn complete_auth(
        &self,
        payload: &WalletAuthPayload,
        nonce: &str,
        session_nonce: Option<&str>,
    ) -> WalletAuthOutcome {
        let check = self.nonces.consume(nonce, session_nonce);
        if !check.is_valid() {
            tracing::info!(?check, "wallet auth refused, nonce not redeemable");
            return WalletAuthOutcome::InvalidNonce(check);
        }

        match self.verifier.verify(payload, nonce).await {
            Ok(true) => {
                tracing::info!(address = %payload.address, "wallet authorized");
                WalletAuthOutcome::Authorized {
                    address: payload.address.clone(),
                }
            }
            Ok(false) => WalletAuthOutcome::Rejected {
                message: "Invalid signature".to_string(),
            },
            Err(err) => {
                tracing::warn!(error = %err, "SIWE validation error");
                WalletAuthOutcome::Rejected {
                    message: err.to_string(),
                }
            }
        }
    }
}
