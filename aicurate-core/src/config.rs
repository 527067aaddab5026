//! Deployment constants, upstream endpoints and the terms of a credit purchase.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::Environment;

/// World Chain mainnet.
pub const WORLD_CHAIN_ID: u64 = 480;

/// Credits granted to a device the first time its ledger is opened.
pub const INITIAL_FREE_CREDITS: u32 = 5;

/// Credits granted by one confirmed purchase.
pub const CREDITS_PER_PURCHASE: u32 = 5;

/// Price of one credit in the token's smallest unit (0.05 WLD, 18 decimals).
pub const PRICE_PER_CREDIT: u128 = 50_000_000_000_000_000;

/// Description shown in the wallet's payment sheet.
pub const PURCHASE_DESCRIPTION: &str = "5 AI Consultation Credits";

/// Upstream services used by the gateways.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoints {
    /// Base URL of the World Developer Portal (proof verification and
    /// transaction lookup).
    pub developer_portal: String,
    /// JSON-RPC endpoint of World Chain, used for ERC-1271 signature checks.
    pub worldchain_rpc: String,
    /// Base URL of the OpenAI-compatible chat completion API.
    pub openai: String,
}

impl ServiceEndpoints {
    /// Default endpoints for `environment`. `rpc_url` overrides the public RPC.
    #[must_use]
    pub fn from_environment(environment: &Environment, rpc_url: Option<String>) -> Self {
        match environment {
            Environment::Staging => Self {
                developer_portal: "https://staging-developer.worldcoin.org".to_string(),
                worldchain_rpc: rpc_url.unwrap_or_else(|| {
                    "https://worldchain-sepolia.g.alchemy.com/public".to_string()
                }),
                openai: "https://api.openai.com".to_string(),
            },
            Environment::Production => Self {
                developer_portal: "https://developer.worldcoin.org".to_string(),
                worldchain_rpc: rpc_url.unwrap_or_else(|| {
                    "https://worldchain-mainnet.g.alchemy.com/public".to_string()
                }),
                openai: "https://api.openai.com".to_string(),
            },
        }
    }
}

/// Token accepted for credit purchases.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    Display,
    Serialize,
    Deserialize,
    uniffi::Enum,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Token {
    /// Worldcoin.
    Wld,
    /// Bridged USDC on World Chain.
    #[strum(to_string = "USDCE", serialize = "USDC.e")]
    #[serde(alias = "USDC.e")]
    Usdce,
}

/// What one purchase costs and what it grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTerms {
    /// Address that must receive the payment.
    pub recipient: Address,
    /// Token the payment must be made in.
    pub token: Token,
    /// Price of one credit in the token's smallest unit.
    pub price_per_credit: U256,
    /// Credits granted per confirmed purchase.
    pub credits_per_purchase: u32,
    /// Human-readable description sent to the wallet.
    pub description: String,
}

impl PaymentTerms {
    /// The standard offer: 5 credits for 0.05 WLD each, paid to `recipient`.
    #[must_use]
    pub fn new(recipient: Address) -> Self {
        Self {
            recipient,
            token: Token::Wld,
            price_per_credit: U256::from(PRICE_PER_CREDIT),
            credits_per_purchase: CREDITS_PER_PURCHASE,
            description: PURCHASE_DESCRIPTION.to_string(),
        }
    }

    /// Amount, in the token's smallest unit, a confirmed transaction must carry.
    #[must_use]
    pub fn expected_amount(&self) -> U256 {
        self.price_per_credit * U256::from(self.credits_per_purchase)
    }
}
