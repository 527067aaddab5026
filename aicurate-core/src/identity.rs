//! World ID proof verification through the Developer Portal.

use std::fmt;

use alloy_primitives::{keccak256, B256};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::ServiceEndpoints;
use crate::http_request::Request;
use crate::{AicurateError, Environment};

/// Action used when verifying a review submission.
pub const SUBMIT_REVIEW_ACTION: &str = "submit-review";

/// Action used by the landing page to gate entry.
pub const ENTRY_ACTION: &str = "verify";

/// Proof-of-personhood level a World ID proof was generated with.
///
/// More details in `https://docs.world.org/world-id/concepts#proof-of-personhood`
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    EnumString,
    Hash,
    Display,
    Serialize,
    Deserialize,
    uniffi::Enum,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    /// Biometrically verified at an Orb.
    Orb,
    /// NFC-checked government document with additional presence checks.
    SecureDocument,
    /// NFC-checked government document.
    Document,
    /// A semi-unique device.
    Device,
}

/// Zero-knowledge proof of personhood as produced by the World App.
///
/// Additional fields sent by the wallet (`status`, `version`) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProof {
    /// ABI-encoded proof.
    pub proof: String,
    /// Root of the identity set the proof was generated against.
    pub merkle_root: String,
    /// Per-action unique identifier of the prover.
    pub nullifier_hash: String,
    /// Level the proof was generated with.
    pub verification_level: VerificationLevel,
}

/// Identifier of an app registered in the Developer Portal.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppId(String);

impl AppId {
    /// Validates `value` as an app id (`app_…`).
    ///
    /// # Errors
    ///
    /// Returns [`AicurateError::Configuration`] when the prefix is missing.
    pub fn new(value: &str) -> Result<Self, AicurateError> {
        let value = value.trim();
        if !value.starts_with("app_") || value.len() <= "app_".len() {
            return Err(AicurateError::Configuration(format!(
                "`{value}` is not a Developer Portal app id"
            )));
        }
        Ok(Self(value.to_string()))
    }

    /// The app id text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AppId {
    type Error = AicurateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<AppId> for String {
    fn from(value: AppId) -> Self {
        value.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppId({})", self.0)
    }
}

/// Result of verifying a proof for an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOutcome {
    /// The proof is valid for the action.
    Accepted,
    /// The person already performed this action the maximum number of times.
    /// Callers treat the action as done.
    AlreadyVerified {
        /// Upstream code, e.g. `max_verifications_reached`.
        code: String,
    },
    /// The proof was refused.
    Rejected {
        /// Upstream code, e.g. `invalid_proof`.
        code: String,
        /// Upstream description.
        detail: String,
    },
}

impl IdentityOutcome {
    /// Whether the person may proceed with the action.
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        matches!(self, Self::Accepted | Self::AlreadyVerified { .. })
    }
}

/// Hashes a signal the way the World ID circuits expect: the keccak256 digest
/// shifted right by 8 bits so it fits the scalar field.
#[must_use]
pub fn signal_hash(signal: &str) -> B256 {
    let digest = keccak256(signal.as_bytes());
    let mut shifted = [0u8; 32];
    shifted[1..].copy_from_slice(&digest[..31]);
    B256::from(shifted)
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    nullifier_hash: &'a str,
    merkle_root: &'a str,
    proof: &'a str,
    verification_level: VerificationLevel,
    action: &'a str,
    signal_hash: String,
}

#[derive(Deserialize)]
struct VerifyErrorBody {
    code: Option<String>,
    detail: Option<String>,
}

/// Forwards identity proofs to the Developer Portal.
#[derive(Debug, Clone)]
pub struct IdentityGateway {
    app_id: Option<AppId>,
    developer_portal: String,
    environment: Environment,
    request: Request,
}

impl IdentityGateway {
    /// Creates a gateway. A missing `app_id` is reported on each verification
    /// rather than at startup.
    #[must_use]
    pub fn new(
        app_id: Option<AppId>,
        endpoints: &ServiceEndpoints,
        environment: Environment,
    ) -> Self {
        Self {
            app_id,
            developer_portal: endpoints.developer_portal.trim_end_matches('/').to_string(),
            environment,
            request: Request::new(environment),
        }
    }

    /// Verifies `proof` for `action`, optionally bound to `signal`.
    ///
    /// # Errors
    ///
    /// Returns [`AicurateError::Configuration`] without any network call when
    /// no app id is configured, and a network or serialization error when the
    /// verifier cannot be reached or answers with something unexpected.
    pub async fn verify(
        &self,
        proof: &IdentityProof,
        action: &str,
        signal: Option<&str>,
    ) -> Result<IdentityOutcome, AicurateError> {
        let app_id = self
            .app_id
            .as_ref()
            .ok_or_else(|| AicurateError::Configuration("APP_ID not configured".to_string()))?;

        let body = VerifyRequest {
            nullifier_hash: &proof.nullifier_hash,
            merkle_root: &proof.merkle_root,
            proof: &proof.proof,
            verification_level: proof.verification_level,
            action,
            signal_hash: signal_hash(signal.unwrap_or_default()).to_string(),
        };

        if self.environment.is_diagnostic() {
            tracing::debug!(
                %app_id,
                action,
                nullifier_hash = %proof.nullifier_hash,
                verification_level = %proof.verification_level,
                signal_hash = %body.signal_hash,
                "verifying World ID proof"
            );
        }

        let url = format!("{}/api/v2/verify/{app_id}", self.developer_portal);
        let response = self
            .request
            .handle(self.request.post(&url)?.json(&body))
            .await?;
        let status = response.status();

        if status.is_success() {
            tracing::info!(action, "World ID proof accepted");
            return Ok(IdentityOutcome::Accepted);
        }

        let text = response.text().await?;
        if self.environment.is_diagnostic() {
            tracing::debug!(status = status.as_u16(), body = %text, "verifier refused proof");
        }
        if !status.is_client_error() {
            return Err(AicurateError::NetworkError {
                url,
                status: Some(status.as_u16()),
                error: "unexpected verifier response".to_string(),
            });
        }

        let parsed: Option<VerifyErrorBody> = serde_json::from_str(&text).ok();
        let code = parsed
            .as_ref()
            .and_then(|body| body.code.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let detail = parsed
            .and_then(|body| body.detail)
            .unwrap_or_else(|| format!("verifier responded with {status}"));

        let outcome = match code.as_str() {
            "max_verifications_reached" | "already_verified" => {
                IdentityOutcome::AlreadyVerified { code }
            }
            _ => IdentityOutcome::Rejected { code, detail },
        };
        tracing::info!(action, ?outcome, "World ID proof not accepted");
        Ok(outcome)
    }
}
