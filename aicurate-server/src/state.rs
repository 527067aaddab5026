use std::sync::Arc;

use aicurate_core::consultation::TextGenerator;
use aicurate_core::identity::IdentityGateway;
use aicurate_core::nonce::NonceIssuer;
use aicurate_core::payment::{PaymentConfirmer, PaymentInitiator};
use aicurate_core::wallet_auth::WalletAuthGateway;
use aicurate_core::Environment;

/// Everything the handlers share. Cloned per request; all members are cheap
/// handles over shared state.
#[derive(Clone)]
pub struct AppState {
    /// Controls diagnostic logging and how much upstream detail responses carry.
    pub environment: Environment,
    /// Sign-in nonces, also held by `wallet_auth`.
    pub nonces: Arc<NonceIssuer>,
    /// World ID proof verification.
    pub identity: IdentityGateway,
    /// Wallet sign-in completion.
    pub wallet_auth: WalletAuthGateway,
    /// Payment references.
    pub initiator: PaymentInitiator,
    /// Payment confirmation.
    pub confirmer: PaymentConfirmer,
    /// Consultation replies.
    pub generator: Arc<dyn TextGenerator>,
}
