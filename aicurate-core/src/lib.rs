#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
//! Core of the AICurate consultation service.
//!
//! Server side, it provides the single-use nonce issuer, the World ID proof
//! gateway, the sign-in-with-Ethereum gateway and the payment
//! initiator/confirmer. Client side, it provides the persisted credit ledger,
//! the consultation session controller and the purchase flow that ties a
//! confirmed payment to new credits.
use strum::{Display, EnumString};

/// Deployment environment of the service or client.
///
/// `Staging` enables diagnostic logging and allows plain-HTTP upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, uniffi::Enum)]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    /// Development and staging deployments.
    Staging,
    /// Production deployments.
    Production,
}

impl Environment {
    /// Whether verification inputs and upstream responses may be logged.
    #[must_use]
    pub const fn is_diagnostic(self) -> bool {
        matches!(self, Self::Staging)
    }

    /// Whether upstream URLs must use HTTPS.
    #[must_use]
    pub const fn requires_https(self) -> bool {
        matches!(self, Self::Production)
    }
}

mod error;
pub use error::*;

pub mod client;
pub mod config;
pub mod consultation;
pub mod draft;
pub mod identity;
pub mod ledger;
pub mod logger;
pub mod nonce;
pub mod payment;
pub mod purchase;
pub mod siwe;
pub mod storage;
pub mod wallet;
pub mod wallet_auth;

// private modules
mod http_request;

uniffi::setup_scaffolding!("aicurate_core");
