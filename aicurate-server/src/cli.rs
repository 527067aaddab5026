use std::net::SocketAddr;
use std::sync::Arc;

use aicurate_core::config::{PaymentTerms, ServiceEndpoints};
use aicurate_core::consultation::{OpenAiChat, DEFAULT_MODEL};
use aicurate_core::identity::{AppId, IdentityGateway};
use aicurate_core::nonce::NonceIssuer;
use aicurate_core::payment::{
    DevPortalTransactions, PaymentConfirmer, PaymentInitiator, PaymentRegistry,
};
use aicurate_core::siwe::ChainSiweVerifier;
use aicurate_core::wallet_auth::WalletAuthGateway;
use aicurate_core::Environment;
use alloy_primitives::Address;
use clap::Parser;
use secrecy::SecretString;

use crate::state::AppState;

/// AICurate API server.
#[derive(Debug, Parser)]
#[command(name = "aicurate", version, about)]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, env = "AICURATE_LISTEN", default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Deployment environment (`staging` or `production`).
    #[arg(long = "env", env = "AICURATE_ENV", default_value = "staging")]
    pub environment: Environment,

    /// World ID app id (`app_…`).
    #[arg(long, env = "APP_ID")]
    pub app_id: Option<String>,

    /// Developer Portal API key used to look up payments.
    #[arg(long, env = "DEV_PORTAL_API_KEY", hide_env_values = true)]
    pub dev_portal_api_key: Option<String>,

    /// Address that receives credit payments.
    #[arg(long, env = "PAYMENT_RECIPIENT")]
    pub payment_recipient: Option<Address>,

    /// OpenAI API key.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Chat model used for consultations.
    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    pub openai_model: String,

    /// Override of the OpenAI base URL.
    #[arg(long, env = "OPENAI_BASE_URL")]
    pub openai_base_url: Option<String>,

    /// Override of the World Chain JSON-RPC URL.
    #[arg(long, env = "WORLDCHAIN_RPC_URL")]
    pub worldchain_rpc_url: Option<String>,

    /// Override of the Developer Portal base URL.
    #[arg(long, env = "DEV_PORTAL_URL")]
    pub dev_portal_url: Option<String>,
}

impl ServerConfig {
    /// Upstream endpoints after applying overrides.
    #[must_use]
    pub fn endpoints(&self) -> ServiceEndpoints {
        let mut endpoints =
            ServiceEndpoints::from_environment(&self.environment, self.worldchain_rpc_url.clone());
        if let Some(url) = &self.dev_portal_url {
            endpoints.developer_portal.clone_from(url);
        }
        if let Some(url) = &self.openai_base_url {
            endpoints.openai.clone_from(url);
        }
        endpoints
    }

    /// Builds the shared handler state.
    ///
    /// Missing secrets are not fatal here: the affected endpoints answer with
    /// a configuration error until they are set.
    ///
    /// # Errors
    ///
    /// When a value is present but malformed.
    pub fn into_state(self) -> eyre::Result<AppState> {
        let environment = self.environment;
        let endpoints = self.endpoints();
        let app_id = self.app_id.as_deref().map(AppId::new).transpose()?;

        if app_id.is_none() {
            tracing::warn!("APP_ID is not set, verification requests will fail");
        }
        if self.payment_recipient.is_none() {
            tracing::warn!("PAYMENT_RECIPIENT is not set, payments cannot be confirmed");
        }
        if self.openai_api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY is not set, consultations will fail");
        }

        let nonces = Arc::new(NonceIssuer::new());
        let payments = Arc::new(PaymentRegistry::new());
        let transactions = DevPortalTransactions::new(
            app_id.clone(),
            self.dev_portal_api_key.map(SecretString::from),
            &endpoints,
            environment,
        );
        let generator = OpenAiChat::new(
            &endpoints,
            self.openai_api_key.map(SecretString::from),
            environment,
        )
        .with_model(self.openai_model);

        Ok(AppState {
            environment,
            nonces: nonces.clone(),
            identity: IdentityGateway::new(app_id, &endpoints, environment),
            wallet_auth: WalletAuthGateway::new(
                nonces,
                Arc::new(ChainSiweVerifier::new(
                    endpoints.worldchain_rpc.clone(),
                    environment,
                )),
            ),
            initiator: PaymentInitiator::new(payments.clone()),
            confirmer: PaymentConfirmer::new(
                payments,
                Arc::new(transactions),
                self.payment_recipient.map(PaymentTerms::new),
            ),
            generator: Arc::new(generator),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let config = ServerConfig::try_parse_from([
            "aicurate",
            "--env",
            "production",
            "--app-id",
            "app_staging_123",
            "--dev-portal-url",
            "https://portal.example",
        ])
        .unwrap();

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.openai_model, DEFAULT_MODEL);
        let endpoints = config.endpoints();
        assert_eq!(endpoints.developer_portal, "https://portal.example");
        assert_eq!(endpoints.openai, "https://api.openai.com");
        assert!(config.into_state().is_ok());
    }

    #[test]
    fn test_malformed_app_id_is_fatal() {
        let config = ServerConfig::try_parse_from(["aicurate", "--app-id", "staging_123"]).unwrap();
        assert!(config.into_state().is_err());
    }

    #[test]
    fn test_unknown_environment_is_rejected() {
        assert!(ServerConfig::try_parse_from(["aicurate", "--env", "dev"]).is_err());
    }
}
