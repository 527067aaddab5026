//! Sign-In with Ethereum (EIP-4361) messages and their verification.
//!
//! World App accounts are smart contract wallets, so a signature is checked by
//! asking the wallet contract itself through ERC-1271 rather than by recovering
//! a key.

use std::str::FromStr;

use alloy_primitives::{eip191_hash_message, Address, Bytes};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http_request::Request;
use crate::nonce::Nonce;
use crate::{AicurateError, Environment};

alloy_core::sol! {
    #[allow(missing_docs)]
    interface IERC1271 {
        function isValidSignature(bytes32 hash, bytes signature) external view returns (bytes4 magicValue);
    }
}

/// Returned by `isValidSignature` for a valid signature.
pub const ERC1271_MAGIC_VALUE: [u8; 4] = [0x16, 0x26, 0xba, 0x7e];

const HEADER_SUFFIX: &str = " wants you to sign in with your Ethereum account:";

/// Errors raised while checking a sign-in message.
#[derive(Debug, Error)]
pub enum SiweError {
    /// The message does not follow EIP-4361.
    #[error("malformed SIWE message: {0}")]
    Malformed(String),
    /// The wallet reported a failed authorization.
    #[error("wallet authorization was not successful")]
    NotSuccessful,
    /// The signed address differs from the claimed one.
    #[error("message address does not match the signing address")]
    AddressMismatch,
    /// The signed nonce differs from the expected one.
    #[error("message nonce does not match")]
    NonceMismatch,
    /// The message's expiration time has passed.
    #[error("message has expired")]
    Expired,
    /// The message's not-before time has not been reached.
    #[error("message is not yet valid")]
    NotYetValid,
    /// The chain node could not be asked about the signature.
    #[error("signature check failed: {0}")]
    Rpc(String),
}

impl From<AicurateError> for SiweError {
    fn from(error: AicurateError) -> Self {
        Self::Rpc(error.to_string())
    }
}

/// Successful `walletAuth` result as returned by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAuthPayload {
    /// `success` for a completed authorization.
    pub status: String,
    /// The EIP-4361 message that was signed.
    pub message: String,
    /// Hex signature over the message.
    pub signature: String,
    /// The wallet address claiming the signature.
    pub address: String,
    /// Payload format version.
    #[serde(default)]
    pub version: u32,
}

/// A parsed EIP-4361 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiweMessage {
    /// Requesting origin.
    pub domain: String,
    /// Signing account.
    pub address: Address,
    /// Human-readable assertion, if any.
    pub statement: Option<String>,
    /// Subject of the signing.
    pub uri: String,
    /// Message version, always `1`.
    pub version: String,
    /// Chain the session is bound to.
    pub chain_id: u64,
    /// Replay protection token.
    pub nonce: String,
    /// When the message was created.
    pub issued_at: DateTime<Utc>,
    /// After this instant the message is no longer valid.
    pub expiration_time: Option<DateTime<Utc>>,
    /// Before this instant the message is not yet valid.
    pub not_before: Option<DateTime<Utc>>,
    /// System-specific request identifier.
    pub request_id: Option<String>,
    /// Resources the user wishes to have resolved.
    pub resources: Vec<String>,
}

fn timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, SiweError> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| SiweError::Malformed(format!("{field}: {err}")))
}

impl FromStr for SiweMessage {
    type Err = SiweError;

    fn from_str(message: &str) -> Result<Self, Self::Err> {
        let mut lines = message.lines().peekable();

        let domain = lines
            .next()
            .and_then(|line| line.strip_suffix(HEADER_SUFFIX))
            .ok_or_else(|| SiweError::Malformed("missing preamble".to_string()))?
            .to_string();
        let address = lines
            .next()
            .ok_or_else(|| SiweError::Malformed("missing address".to_string()))
            .and_then(|line| {
                Address::from_str(line.trim())
                    .map_err(|err| SiweError::Malformed(format!("address: {err}")))
            })?;

        while lines.next_if(|line| line.is_empty()).is_some() {}
        let statement = lines
            .next_if(|line| !line.starts_with("URI: "))
            .map(ToString::to_string);

        let mut uri = None;
        let mut version = None;
        let mut chain_id = None;
        let mut nonce = None;
        let mut issued_at = None;
        let mut expiration_time = None;
        let mut not_before = None;
        let mut request_id = None;
        let mut resources = Vec::new();
        let mut in_resources = false;

        for line in lines.filter(|line| !line.is_empty()) {
            if in_resources {
                let resource = line
                    .strip_prefix("- ")
                    .ok_or_else(|| SiweError::Malformed(format!("unexpected line `{line}`")))?;
                resources.push(resource.to_string());
                continue;
            }
            if line == "Resources:" {
                in_resources = true;
                continue;
            }
            let (field, value) = line
                .split_once(": ")
                .ok_or_else(|| SiweError::Malformed(format!("unexpected line `{line}`")))?;
            match field {
                "URI" => uri = Some(value.to_string()),
                "Version" => version = Some(value.to_string()),
                "Chain ID" => {
                    chain_id = Some(value.parse::<u64>().map_err(|err| {
                        SiweError::Malformed(format!("chain id: {err}"))
                    })?);
                }
                "Nonce" => nonce = Some(value.to_string()),
                "Issued At" => issued_at = Some(timestamp(field, value)?),
                "Expiration Time" => expiration_time = Some(timestamp(field, value)?),
                "Not Before" => not_before = Some(timestamp(field, value)?),
                "Request ID" => request_id = Some(value.to_string()),
                other => return Err(SiweError::Malformed(format!("unknown field `{other}`"))),
            }
        }

        let missing = |field: &str| SiweError::Malformed(format!("missing {field}"));
        let nonce = nonce.ok_or_else(|| missing("nonce"))?;
        Nonce::parse(&nonce).map_err(|err| SiweError::Malformed(err.to_string()))?;

        Ok(Self {
            domain,
            address,
            statement,
            uri: uri.ok_or_else(|| missing("uri"))?,
            version: version.ok_or_else(|| missing("version"))?,
            chain_id: chain_id.ok_or_else(|| missing("chain id"))?,
            nonce,
            issued_at: issued_at.ok_or_else(|| missing("issued at"))?,
            expiration_time,
            not_before,
            request_id,
            resources,
        })
    }
}

impl SiweMessage {
    /// Checks the time bounds of the message against `now`.
    ///
    /// # Errors
    ///
    /// [`SiweError::Expired`] or [`SiweError::NotYetValid`].
    pub fn check_time(&self, now: DateTime<Utc>) -> Result<(), SiweError> {
        if self.expiration_time.is_some_and(|expiry| now >= expiry) {
            return Err(SiweError::Expired);
        }
        if self.not_before.is_some_and(|start| now < start) {
            return Err(SiweError::NotYetValid);
        }
        Ok(())
    }
}

/// Decides whether a wallet authorization payload is authentic.
///
/// The gateway only calls this after the session nonce matched.
#[async_trait]
pub trait SiweVerifier: Send + Sync {
    /// Returns `Ok(true)` when `payload` is a valid signature over a message
    /// carrying `nonce`, `Ok(false)` when the signature is not valid.
    ///
    /// # Errors
    ///
    /// Any [`SiweError`] describing why the message cannot be accepted.
    async fn verify(&self, payload: &WalletAuthPayload, nonce: &str) -> Result<bool, SiweError>;
}

/// Verifies sign-in messages against the signing wallet contract on chain.
#[derive(Debug, Clone)]
pub struct ChainSiweVerifier {
    rpc_url: String,
    request: Request,
}

impl ChainSiweVerifier {
    /// Creates a verifier using the JSON-RPC endpoint at `rpc_url`.
    #[must_use]
    pub fn new(rpc_url: impl Into<String>, environment: Environment) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            request: Request::new(environment),
        }
    }

    async fn is_valid_signature(
        &self,
        wallet: Address,
        message: &str,
        signature: Bytes,
    ) -> Result<bool, SiweError> {
        use alloy_core::sol_types::SolCall;

        let call = IERC1271::isValidSignatureCall {
            hash: eip191_hash_message(message),
            signature,
        };
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [
                { "to": wallet, "data": Bytes::from(call.abi_encode()) },
                "latest"
            ],
        });

        let response = self
            .request
            .handle(self.request.post(&self.rpc_url)?.json(&body))
            .await?;
        if !response.status().is_success() {
            return Err(SiweError::Rpc(format!(
                "rpc responded with {}",
                response.status()
            )));
        }
        let reply: serde_json::Value = response
            .json()
            .await
            .map_err(|err| SiweError::Rpc(err.to_string()))?;

        if let Some(error) = reply.get("error") {
            // A revert means the wallet rejected the signature.
            tracing::debug!(%wallet, %error, "isValidSignature reverted");
            return Ok(false);
        }
        let result = reply
            .get("result")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| SiweError::Rpc("rpc reply without result".to_string()))?;
        let returned = hex::decode(result.trim_start_matches("0x"))
            .map_err(|err| SiweError::Rpc(format!("invalid result: {err}")))?;

        Ok(returned.len() >= 4 && returned[..4] == ERC1271_MAGIC_VALUE)
    }
}

#[async_trait]
impl SiweVerifier for ChainSiweVerifier {
    async fn verify(&self, payload: &WalletAuthPayload, nonce: &str) -> Result<bool, SiweError> {
        if payload.status != "success" {
            return Err(SiweError::NotSuccessful);
        }
        let message = SiweMessage::from_str(&payload.message)?;
        let claimed = Address::from_str(payload.address.trim())
            .map_err(|err| SiweError::Malformed(format!("address: {err}")))?;
        if message.address != claimed {
            return Err(SiweError::AddressMismatch);
        }
        if message.nonce != nonce {
            return Err(SiweError::NonceMismatch);
        }
        message.check_time(Utc::now())?;

        let signature = Bytes::from_str(payload.signature.trim())
            .map_err(|err| SiweError::Malformed(format!("signature: {err}")))?;
        let valid = self
            .is_valid_signature(claimed, &payload.message, signature)
            .await?;
        tracing::debug!(address = %claimed, valid, "checked wallet signature");
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    const ADDRESS: &str = "0x11a1801863e1F0941A663f0338aEa395Be1Ec8A4";

    fn message(nonce: &str, expiration: Option<DateTime<Utc>>) -> String {
        let mut text = format!(
            "aicurate.app wants you to sign in with your Ethereum account:\n\
             {ADDRESS}\n\n\
             Sign in to AICurate\n\n\
             URI: https://aicurate.app\n\
             Version: 1\n\
             Chain ID: 480\n\
             Nonce: {nonce}\n\
             Issued At: 2026-01-01T00:00:00Z"
        );
        if let Some(expiration) = expiration {
            text.push_str(&format!("\nExpiration Time: {}", expiration.to_rfc3339()));
        }
        text
    }

    fn payload(message: String) -> WalletAuthPayload {
        WalletAuthPayload {
            status: "success".to_string(),
            message,
            signature: "0xdeadbeef".to_string(),
            address: ADDRESS.to_string(),
            version: 1,
        }
    }

    fn rpc_reply(result: &str) -> String {
        json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string()
    }

    #[test]
    fn test_parse_full_message() {
        let text = "example.com wants you to sign in with your Ethereum account:\n\
                    0x11a1801863e1F0941A663f0338aEa395Be1Ec8A4\n\n\
                    I accept the Terms of Service\n\n\
                    URI: https://example.com/login\n\
                    Version: 1\n\
                    Chain ID: 480\n\
                    Nonce: 32891756abcdef\n\
                    Issued At: 2026-03-01T16:25:24Z\n\
                    Expiration Time: 2026-03-08T16:25:24Z\n\
                    Not Before: 2026-03-01T16:25:24Z\n\
                    Request ID: req-1\n\
                    Resources:\n\
                    - ipfs://bafybeiemxf5abjwjbikoz4mc3a3dla6ual3jsgpdr4cjr3oz3evfyavhwq/\n\
                    - https://example.com/my-web2-claim.json";
        let parsed = SiweMessage::from_str(text).unwrap();

        assert_eq!(parsed.domain, "example.com");
        assert_eq!(parsed.address, Address::from_str(ADDRESS).unwrap());
        assert_eq!(parsed.statement.as_deref(), Some("I accept the Terms of Service"));
        assert_eq!(parsed.chain_id, 480);
        assert_eq!(parsed.nonce, "32891756abcdef");
        assert_eq!(parsed.request_id.as_deref(), Some("req-1"));
        assert_eq!(parsed.resources.len(), 2);
        assert!(parsed.expiration_time.is_some());
    }

    #[test]
    fn test_parse_without_statement() {
        let text = "example.com wants you to sign in with your Ethereum account:\n\
                    0x11a1801863e1F0941A663f0338aEa395Be1Ec8A4\n\n\n\
                    URI: https://example.com\n\
                    Version: 1\n\
                    Chain ID: 1\n\
                    Nonce: abcdefgh1\n\
                    Issued At: 2026-03-01T16:25:24.000Z";
        let parsed = SiweMessage::from_str(text).unwrap();
        assert_eq!(parsed.statement, None);
        assert_eq!(parsed.uri, "https://example.com");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            SiweMessage::from_str("hello"),
            Err(SiweError::Malformed(_))
        ));
        let no_nonce = message("x", None).replace("Nonce: x\n", "");
        assert!(SiweMessage::from_str(&no_nonce).is_err());
    }

    #[test]
    fn test_time_bounds() {
        let parsed = SiweMessage::from_str(&message(
            "abcdefgh12",
            Some(Utc::now() - Duration::minutes(1)),
        ))
        .unwrap();
        assert!(matches!(parsed.check_time(Utc::now()), Err(SiweError::Expired)));
        assert!(parsed
            .check_time(Utc::now() - Duration::minutes(2))
            .is_ok());
    }

    #[tokio::test]
    async fn test_wallet_contract_accepts_signature() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(json!({"method": "eth_call"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(rpc_reply(
                "0x1626ba7e00000000000000000000000000000000000000000000000000000000",
            ))
            .create_async()
            .await;

        let verifier = ChainSiweVerifier::new(server.url(), Environment::Staging);
        let nonce = "abcdefgh12";
        let valid = verifier
            .verify(
                &payload(message(nonce, Some(Utc::now() + Duration::hours(1)))),
                nonce,
            )
            .await
            .unwrap();

        assert!(valid);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_wallet_contract_refuses_signature() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(rpc_reply(
                "0xffffffff00000000000000000000000000000000000000000000000000000000",
            ))
            .create_async()
            .await;

        let verifier = ChainSiweVerifier::new(server.url(), Environment::Staging);
        let valid = verifier
            .verify(&payload(message("abcdefgh12", None)), "abcdefgh12")
            .await
            .unwrap();
        assert!(!valid);
    }

    #[tokio::test]
    async fn test_revert_is_an_invalid_signature() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(
                json!({"jsonrpc": "2.0", "id": 1, "error": {"code": 3, "message": "execution reverted"}})
                    .to_string(),
            )
            .create_async()
            .await;

        let verifier = ChainSiweVerifier::new(server.url(), Environment::Staging);
        let valid = verifier
            .verify(&payload(message("abcdefgh12", None)), "abcdefgh12")
            .await
            .unwrap();
        assert!(!valid);
    }

    #[tokio::test]
    async fn test_message_checks_precede_rpc() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .expect(0)
            .create_async()
            .await;
        let verifier = ChainSiweVerifier::new(server.url(), Environment::Staging);

        let wrong_nonce = verifier
            .verify(&payload(message("abcdefgh12", None)), "zzzzzzzz99")
            .await;
        assert!(matches!(wrong_nonce, Err(SiweError::NonceMismatch)));

        let mut other_address = payload(message("abcdefgh12", None));
        other_address.address = "0x0000000000000000000000000000000000000001".to_string();
        assert!(matches!(
            verifier.verify(&other_address, "abcdefgh12").await,
            Err(SiweError::AddressMismatch)
        ));

        let expired = payload(message(
            "abcdefgh12",
            Some(Utc::now() - Duration::seconds(5)),
        ));
        assert!(matches!(
            verifier.verify(&expired, "abcdefgh12").await,
            Err(SiweError::Expired)
        ));

        mock.assert_async().await;
    }
}
