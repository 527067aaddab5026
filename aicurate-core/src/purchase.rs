//! Buying consultation credits from the client.
//!
//! The steps run strictly in order: nonce, wallet sign-in, payment initiation,
//! wallet payment, server confirmation, and only then the ledger credit. A
//! failure at any step stops the flow without touching the ledger. When the
//! payment was sent but its confirmation got no answer, the flow hands back a
//! [`PendingConfirmation`] that [`PurchaseFlow::resume_confirmation`] retries
//! without paying again.

use std::sync::Arc;

use thiserror::Error;

use crate::client::AicurateClient;
use crate::config::PaymentTerms;
use crate::ledger::{CreditLedger, LedgerError};
use crate::payment::{PayFinalPayload, PaymentReference};
use crate::wallet::{PayRequest, WalletCommands, WalletError};
use crate::AicurateError;

/// Why a purchase did not grant credits.
#[derive(Debug, Error)]
pub enum PurchaseError {
    /// The server could not be reached or answered unexpectedly.
    #[error(transparent)]
    Client(#[from] AicurateError),
    /// The wallet could not run a command.
    #[error(transparent)]
    Wallet(#[from] WalletError),
    /// The wallet sign-in was declined or refused by the server.
    #[error("wallet sign-in failed: {0}")]
    NotAuthorized(String),
    /// The user cancelled the payment or the wallet failed to send it.
    #[error("payment not sent: {0}")]
    PaymentCancelled(String),
    /// The server did not confirm the payment.
    #[error("payment could not be confirmed")]
    NotConfirmed,
    /// The payment was sent but the confirmation request failed, so whether
    /// it was confirmed is unknown. Retry with
    /// [`PurchaseFlow::resume_confirmation`].
    #[error("payment sent but confirmation unknown: {error}")]
    ConfirmationUnknown {
        /// The sent payment, to confirm again.
        pending: Box<PendingConfirmation>,
        /// Why the confirmation request failed.
        #[source]
        error: AicurateError,
    },
    /// The payment was confirmed but the credits could not be stored.
    #[error("payment confirmed but credits not stored: {0}")]
    Ledger(#[from] LedgerError),
}

/// A completed purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseReceipt {
    /// Wallet that signed in and paid.
    pub address: String,
    /// Reference of the confirmed payment.
    pub reference: PaymentReference,
    /// Balance after the credits were added.
    pub balance: u32,
}

/// A payment the wallet sent whose confirmation has not been answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    /// Wallet that signed in and paid.
    pub address: String,
    /// Reference the payment was made for.
    pub reference: PaymentReference,
    /// What the wallet reported for the payment.
    pub payment: PayFinalPayload,
}

/// Orchestrates one credit purchase.
pub struct PurchaseFlow {
    client: AicurateClient,
    wallet: Arc<dyn WalletCommands>,
    ledger: Arc<CreditLedger>,
    terms: PaymentTerms,
}

impl PurchaseFlow {
    /// Creates a flow paying under `terms` and crediting `ledger`.
    #[must_use]
    pub fn new(
        client: AicurateClient,
        wallet: Arc<dyn WalletCommands>,
        ledger: Arc<CreditLedger>,
        terms: PaymentTerms,
    ) -> Self {
        Self {
            client,
            wallet,
            ledger,
            terms,
        }
    }

    /// Runs the purchase and credits the ledger once the server confirms it.
    ///
    /// # Errors
    ///
    /// See [`PurchaseError`]. The ledger is only modified on success.
    pub async fn purchase_credits(&self) -> Result<PurchaseReceipt, PurchaseError> {
        let nonce = self.client.nonce().await?;

        let auth = self.wallet.wallet_auth(&nonce).await?;
        if auth.status != "success" {
            return Err(PurchaseError::NotAuthorized(
                "sign-in declined in wallet".to_string(),
            ));
        }
        let completion = self.client.complete_siwe(auth, &nonce).await?;
        let address = match completion.address {
            Some(address) if completion.is_valid => address,
            _ => {
                return Err(PurchaseError::NotAuthorized(
                    completion
                        .message
                        .unwrap_or_else(|| "sign-in refused".to_string()),
                ))
            }
        };

        let reference = self.client.initiate_payment().await?;
        tracing::debug!(%reference, "payment initiated");

        let request = PayRequest::for_credits(reference.clone(), &self.terms);
        let payment = self.wallet.pay(&request).await?;
        if let PayFinalPayload::Error { error_code } = &payment {
            tracing::info!(%error_code, "payment not sent");
            return Err(PurchaseError::PaymentCancelled(error_code.clone()));
        }

        self.resume_confirmation(PendingConfirmation {
            address,
            reference,
            payment,
        })
        .await
    }

    /// Confirms a payment that was already sent and credits the ledger.
    ///
    /// The server acknowledges a repeated confirmation of the same
    /// transaction, so this is safe to call again after
    /// [`PurchaseError::ConfirmationUnknown`].
    ///
    /// # Errors
    ///
    /// [`PurchaseError::ConfirmationUnknown`] if the server could not be asked,
    /// [`PurchaseError::NotConfirmed`] if it refused the payment, or
    /// [`PurchaseError::Ledger`] if the credits could not be stored.
    pub async fn resume_confirmation(
        &self,
        pending: PendingConfirmation,
    ) -> Result<PurchaseReceipt, PurchaseError> {
        let confirmed = match self.client.confirm_payment(pending.payment.clone()).await {
            Ok(confirmed) => confirmed,
            Err(error) => {
                tracing::warn!(reference = %pending.reference, %error, "payment confirmation unanswered");
                return Err(PurchaseError::ConfirmationUnknown {
                    pending: Box::new(pending),
                    error,
                });
            }
        };
        if !confirmed {
            tracing::warn!(reference = %pending.reference, "payment not confirmed");
            return Err(PurchaseError::NotConfirmed);
        }

        let balance = self.ledger.credit(self.terms.credits_per_purchase)?;
        tracing::info!(reference = %pending.reference, balance, "credits purchased");
        Ok(PurchaseReceipt {
            address: pending.address,
            reference: pending.reference,
            balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use alloy_primitives::address;
    use async_trait::async_trait;
    use mockito::Matcher;
    use serde_json::json;

    use super::*;
    use crate::siwe::WalletAuthPayload;
    use crate::storage::InMemoryBlobStore;
    use crate::Environment;

    struct FakeWallet {
        decline_payment: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeWallet {
        fn new(decline_payment: bool) -> Arc<Self> {
            Arc::new(Self {
                decline_payment,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl WalletCommands for FakeWallet {
        async fn wallet_auth(&self, nonce: &str) -> Result<WalletAuthPayload, WalletError> {
            self.calls.lock().unwrap().push(format!("wallet_auth:{nonce}"));
            Ok(WalletAuthPayload {
                status: "success".to_string(),
                message: format!("signed {nonce}"),
                signature: "0xsig".to_string(),
                address: "0xabc".to_string(),
                version: 2,
            })
        }

        async fn pay(&self, request: &PayRequest) -> Result<PayFinalPayload, WalletError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("pay:{}", request.reference));
            if self.decline_payment {
                return Ok(PayFinalPayload::Error {
                    error_code: "user_rejected".to_string(),
                });
            }
            Ok(PayFinalPayload::Success {
                transaction_id: "0xtx".to_string(),
                reference: request.reference.to_string(),
                from: Some("0xabc".to_string()),
            })
        }
    }

    async fn server_with_session(server: &mut mockito::ServerGuard) {
        server
            .mock("GET", "/api/nonce")
            .with_status(200)
            .with_body(r#"{"nonce":"n0nce1234"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/complete-siwe")
            .with_status(200)
            .with_body(r#"{"status":"success","isValid":true,"address":"0xabc"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/initiate-payment")
            .with_status(200)
            .with_body(r#"{"id":"ref42"}"#)
            .create_async()
            .await;
    }

    fn flow(server: &mockito::ServerGuard, wallet: Arc<FakeWallet>) -> (PurchaseFlow, Arc<CreditLedger>) {
        let ledger =
            Arc::new(CreditLedger::open(Arc::new(InMemoryBlobStore::new())).unwrap());
        let client = AicurateClient::new(&server.url(), Environment::Staging).unwrap();
        let terms = PaymentTerms::new(address!("0x000000000000000000000000000000000000dead"));
        (
            PurchaseFlow::new(client, wallet, ledger.clone(), terms),
            ledger,
        )
    }

    #[tokio::test]
    async fn test_confirmed_purchase_adds_five_credits() {
        let mut server = mockito::Server::new_async().await;
        server_with_session(&mut server).await;
        let confirm = server
            .mock("POST", "/api/confirm-payment")
            .match_body(Matcher::PartialJson(json!({
                "payload": {"status": "success", "reference": "ref42"}
            })))
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .expect(2)
            .create_async()
            .await;
        let wallet = FakeWallet::new(false);
        let (flow, ledger) = flow(&server, wallet.clone());

        let receipt = flow.purchase_credits().await.unwrap();
        assert_eq!(receipt.balance, 10);
        assert_eq!(receipt.address, "0xabc");
        assert_eq!(receipt.reference.as_str(), "ref42");
        assert_eq!(
            *wallet.calls.lock().unwrap(),
            vec!["wallet_auth:n0nce1234", "pay:ref42"]
        );

        flow.purchase_credits().await.unwrap();
        assert_eq!(ledger.balance(), 15);
        confirm.assert_async().await;
    }

    #[tokio::test]
    async fn test_declined_payment_is_never_confirmed() {
        let mut server = mockito::Server::new_async().await;
        server_with_session(&mut server).await;
        let confirm = server
            .mock("POST", "/api/confirm-payment")
            .expect(0)
            .create_async()
            .await;
        let (flow, ledger) = flow(&server, FakeWallet::new(true));

        let result = flow.purchase_credits().await;
        assert!(matches!(result, Err(PurchaseError::PaymentCancelled(code)) if code == "user_rejected"));
        assert_eq!(ledger.balance(), 5);
        confirm.assert_async().await;
    }

    #[tokio::test]
    async fn test_unconfirmed_payment_grants_nothing() {
        let mut server = mockito::Server::new_async().await;
        server_with_session(&mut server).await;
        server
            .mock("POST", "/api/confirm-payment")
            .with_status(200)
            .with_body(r#"{"success":false}"#)
            .create_async()
            .await;
        let (flow, ledger) = flow(&server, FakeWallet::new(false));

        assert!(matches!(
            flow.purchase_credits().await,
            Err(PurchaseError::NotConfirmed)
        ));
        assert_eq!(ledger.balance(), 5);
    }

    #[tokio::test]
    async fn test_unanswered_confirmation_can_be_resumed_without_paying_again() {
        let mut server = mockito::Server::new_async().await;
        server_with_session(&mut server).await;
        let unanswered = server
            .mock("POST", "/api/confirm-payment")
            .with_status(502)
            .expect(1)
            .create_async()
            .await;
        let wallet = FakeWallet::new(false);
        let (flow, ledger) = flow(&server, wallet.clone());

        let pending = match flow.purchase_credits().await {
            Err(PurchaseError::ConfirmationUnknown { pending, .. }) => *pending,
            other => panic!("unexpected result: {other:?}"),
        };
        assert_eq!(pending.reference.as_str(), "ref42");
        assert_eq!(ledger.balance(), 5);
        unanswered.assert_async().await;
        unanswered.remove_async().await;

        let confirm = server
            .mock("POST", "/api/confirm-payment")
            .match_body(Matcher::PartialJson(json!({
                "payload": {"status": "success", "transaction_id": "0xtx", "reference": "ref42"}
            })))
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .expect(1)
            .create_async()
            .await;

        let receipt = flow.resume_confirmation(pending).await.unwrap();
        assert_eq!(receipt.balance, 10);
        assert_eq!(
            *wallet.calls.lock().unwrap(),
            vec!["wallet_auth:n0nce1234", "pay:ref42"]
        );
        confirm.assert_async().await;
    }

    #[tokio::test]
    async fn test_refused_sign_in_stops_before_payment() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/nonce")
            .with_status(200)
            .with_body(r#"{"nonce":"n0nce1234"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/complete-siwe")
            .with_status(401)
            .with_body(r#"{"status":"error","isValid":false,"message":"Invalid nonce"}"#)
            .create_async()
            .await;
        let initiate = server
            .mock("POST", "/api/initiate-payment")
            .expect(0)
            .create_async()
            .await;
        let wallet = FakeWallet::new(false);
        let (flow, ledger) = flow(&server, wallet.clone());

        let result = flow.purchase_credits().await;
        assert!(matches!(result, Err(PurchaseError::NotAuthorized(message)) if message == "Invalid nonce"));
        assert_eq!(wallet.calls.lock().unwrap().len(), 1);
        assert_eq!(ledger.balance(), 5);
        initiate.assert_async().await;
    }
}
