//! HTTP client for the AICurate endpoints, and the request and response bodies
//! both sides agree on.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::consultation::{
    ConsultationBackend, ConsultationError, ConsultationRequest, TextStream, MAX_STREAM_DURATION,
};
use crate::draft::ReviewDraft;
use crate::http_request::Request;
use crate::identity::{IdentityOutcome, IdentityProof, SUBMIT_REVIEW_ACTION};
use crate::payment::{PayFinalPayload, PaymentReference};
use crate::siwe::WalletAuthPayload;
use crate::{AicurateError, Environment};

/// Body of `GET /api/nonce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceResponse {
    /// The nonce to sign.
    pub nonce: String,
}

/// Body of `POST /api/complete-siwe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteSiweRequest {
    /// Final payload of the wallet's `walletAuth` command.
    pub payload: WalletAuthPayload,
    /// The nonce the client was issued and asked the wallet to sign.
    pub nonce: String,
}

/// Response of `POST /api/complete-siwe`, for success and refusal alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiweCompletion {
    /// `success` or `error`.
    pub status: String,
    /// Whether the wallet is now authorized.
    pub is_valid: bool,
    /// The authorized address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Why the authorization was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `POST /api/verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Proof produced by the wallet's `verify` command.
    pub payload: IdentityProof,
    /// Action the proof was generated for.
    pub action: String,
    /// Signal the proof commits to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Review being submitted along with the proof.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_data: Option<ReviewDraft>,
}

/// Response of `POST /api/verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// Mirrors the HTTP status.
    pub status: u16,
    /// Human-readable summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Upstream code for refused proofs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Upstream detail for refused proofs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Response of `POST /api/initiate-payment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatePaymentResponse {
    /// The payment reference.
    pub id: PaymentReference,
}

/// Body of `POST /api/confirm-payment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmPaymentRequest {
    /// Final payload of the wallet's `pay` command.
    pub payload: PayFinalPayload,
}

/// Response of `POST /api/confirm-payment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmPaymentResponse {
    /// Whether the payment was confirmed.
    pub success: bool,
}

/// Talks to an AICurate server. Keeps the session cookie that carries the
/// wallet sign-in nonce.
#[derive(Debug, Clone)]
pub struct AicurateClient {
    base_url: String,
    request: Request,
    streaming: Request,
}

impl AicurateClient {
    /// Creates a client for the server at `base_url`.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be initialized.
    pub fn new(base_url: &str, environment: Environment) -> Result<Self, AicurateError> {
        let client = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            request: Request::with_client(client.clone(), environment),
            streaming: Request::with_client(client, environment)
                .timeout(MAX_STREAM_DURATION + Duration::from_secs(5)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Requests a fresh sign-in nonce. The server binds it to this client's
    /// cookie.
    ///
    /// # Errors
    ///
    /// On transport failure or an unexpected response.
    pub async fn nonce(&self) -> Result<String, AicurateError> {
        let url = self.url("/api/nonce");
        let response = self.request.handle(self.request.get(&url)?).await?;
        let body: NonceResponse = read_json(&url, response, &[]).await?;
        Ok(body.nonce)
    }

    /// Completes the wallet sign-in with the nonce from [`Self::nonce`].
    ///
    /// Refusals (invalid nonce, invalid signature) are returned as a
    /// [`SiweCompletion`] with `is_valid == false`.
    ///
    /// # Errors
    ///
    /// On transport failure or a server error.
    pub async fn complete_siwe(
        &self,
        payload: WalletAuthPayload,
        nonce: &str,
    ) -> Result<SiweCompletion, AicurateError> {
        let url = self.url("/api/complete-siwe");
        let body = CompleteSiweRequest {
            payload,
            nonce: nonce.to_string(),
        };
        let builder = self.request.post(&url)?.json(&body);
        let response = self.request.send_once(builder).await?;
        read_json(
            &url,
            response,
            &[StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED],
        )
        .await
    }

    /// Verifies a World ID proof for `action`.
    ///
    /// # Errors
    ///
    /// On transport failure or a server error (including a server without
    /// app id).
    pub async fn verify(
        &self,
        proof: IdentityProof,
        action: &str,
        signal: Option<String>,
    ) -> Result<IdentityOutcome, AicurateError> {
        self.post_verify(VerifyRequest {
            payload: proof,
            action: action.to_string(),
            signal,
            review_data: None,
        })
        .await
    }

    /// Submits `review` along with a proof for the `submit-review` action.
    ///
    /// # Errors
    ///
    /// As [`Self::verify`].
    pub async fn submit_review(
        &self,
        review: ReviewDraft,
        proof: IdentityProof,
    ) -> Result<IdentityOutcome, AicurateError> {
        self.post_verify(VerifyRequest {
            payload: proof,
            action: SUBMIT_REVIEW_ACTION.to_string(),
            signal: None,
            review_data: Some(review),
        })
        .await
    }

    async fn post_verify(&self, body: VerifyRequest) -> Result<IdentityOutcome, AicurateError> {
        let url = self.url("/api/verify");
        let builder = self.request.post(&url)?.json(&body);
        let response = self.request.send_once(builder).await?;
        let status = response.status();
        let body: VerifyResponse = read_json(
            &url,
            response,
            &[StatusCode::BAD_REQUEST, StatusCode::CONFLICT],
        )
        .await?;

        Ok(match status {
            StatusCode::CONFLICT => IdentityOutcome::AlreadyVerified {
                code: body.code.unwrap_or_else(|| "already_verified".to_string()),
            },
            StatusCode::BAD_REQUEST => IdentityOutcome::Rejected {
                code: body.code.unwrap_or_default(),
                detail: body.detail.or(body.message).unwrap_or_default(),
            },
            _ => IdentityOutcome::Accepted,
        })
    }

    /// Starts a payment and returns its reference.
    ///
    /// Not retried: every call registers a new reference on the server.
    ///
    /// # Errors
    ///
    /// On transport failure or an unexpected response.
    pub async fn initiate_payment(&self) -> Result<PaymentReference, AicurateError> {
        let url = self.url("/api/initiate-payment");
        let response = self.request.send_once(self.request.post(&url)?).await?;
        let body: InitiatePaymentResponse = read_json(&url, response, &[]).await?;
        Ok(body.id)
    }

    /// Asks the server to confirm a completed payment.
    ///
    /// # Errors
    ///
    /// On transport failure or a server error. An unconfirmed payment is
    /// `Ok(false)`.
    pub async fn confirm_payment(&self, payload: PayFinalPayload) -> Result<bool, AicurateError> {
        let url = self.url("/api/confirm-payment");
        let builder = self
            .request
            .post(&url)?
            .json(&ConfirmPaymentRequest { payload });
        let response = self.request.send_once(builder).await?;
        let body: ConfirmPaymentResponse = read_json(&url, response, &[]).await?;
        Ok(body.success)
    }
}

#[async_trait]
impl ConsultationBackend for AicurateClient {
    async fn open(&self, request: ConsultationRequest) -> Result<TextStream, ConsultationError> {
        let url = self.url("/api/ai");
        let builder = self.streaming.post(&url)?.json(&request);
        let response = self.streaming.send_once(builder).await?;

        let status = response.status();
        if status == StatusCode::PAYMENT_REQUIRED {
            return Err(ConsultationError::PaymentRequired);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ConsultationError::Upstream {
                status: Some(status.as_u16()),
                message,
            });
        }
        Ok(utf8_text(Box::pin(response.bytes_stream())))
    }
}

/// Decodes `response` as `T` when its status is a success or one of `accepted`.
async fn read_json<T: DeserializeOwned>(
    url: &str,
    response: Response,
    accepted: &[StatusCode],
) -> Result<T, AicurateError> {
    let status = response.status();
    if !status.is_success() && !accepted.contains(&status) {
        let error = response.text().await.unwrap_or_default();
        return Err(AicurateError::NetworkError {
            url: url.to_string(),
            status: Some(status.as_u16()),
            error,
        });
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(AicurateError::serialization)
}

/// Length of the longest prefix of `bytes` that is complete UTF-8.
fn complete_prefix(bytes: &[u8]) -> Result<usize, ConsultationError> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(text.len()),
        Err(err) if err.error_len().is_none() => Ok(err.valid_up_to()),
        Err(err) => Err(ConsultationError::Stream(format!(
            "invalid utf-8 in reply: {err}"
        ))),
    }
}

/// Turns a plain-text body into text chunks, holding back characters split
/// across network chunks.
fn utf8_text<S, B, E>(mut bytes: S) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ConsultationError> + Send + 'static,
{
    Box::pin(try_stream! {
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(Into::<ConsultationError>::into)?;
            pending.extend_from_slice(chunk.as_ref());
            let complete = complete_prefix(&pending)?;
            if complete > 0 {
                let text = String::from_utf8_lossy(&pending[..complete]).into_owned();
                pending.drain(..complete);
                yield text;
            }
        }
        if !pending.is_empty() {
            Err::<(), _>(ConsultationError::Stream(
                "reply ended inside a utf-8 sequence".to_string(),
            ))?;
        }
    })
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use mockito::Matcher;
    use serde_json::json;

    use super::*;
    use crate::identity::VerificationLevel;

    fn proof() -> IdentityProof {
        IdentityProof {
            proof: "0xproof".to_string(),
            merkle_root: "0xroot".to_string(),
            nullifier_hash: "0xnullifier".to_string(),
            verification_level: VerificationLevel::Orb,
        }
    }

    async fn client() -> (mockito::ServerGuard, AicurateClient) {
        let server = mockito::Server::new_async().await;
        let client = AicurateClient::new(&server.url(), Environment::Staging).unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_nonce_cookie_is_sent_back() {
        let (mut server, client) = client().await;
        server
            .mock("GET", "/api/nonce")
            .with_status(200)
            .with_header("set-cookie", "siwe=4f1c2a9b0d; Path=/; HttpOnly")
            .with_body(r#"{"nonce":"4f1c2a9b0d"}"#)
            .create_async()
            .await;
        let complete = server
            .mock("POST", "/api/complete-siwe")
            .match_header("cookie", "siwe=4f1c2a9b0d")
            .match_body(Matcher::PartialJson(json!({"nonce": "4f1c2a9b0d"})))
            .with_status(200)
            .with_body(r#"{"status":"success","isValid":true,"address":"0xabc"}"#)
            .create_async()
            .await;

        let nonce = client.nonce().await.unwrap();
        let payload = WalletAuthPayload {
            status: "success".to_string(),
            message: "msg".to_string(),
            signature: "0xsig".to_string(),
            address: "0xabc".to_string(),
            version: 2,
        };
        let completion = client.complete_siwe(payload, &nonce).await.unwrap();

        assert!(completion.is_valid);
        assert_eq!(completion.address.as_deref(), Some("0xabc"));
        complete.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_nonce_is_a_refusal() {
        let (mut server, client) = client().await;
        server
            .mock("POST", "/api/complete-siwe")
            .with_status(401)
            .with_body(r#"{"status":"error","isValid":false,"message":"Invalid nonce"}"#)
            .create_async()
            .await;

        let payload = WalletAuthPayload {
            status: "success".to_string(),
            message: String::new(),
            signature: String::new(),
            address: String::new(),
            version: 2,
        };
        let completion = client.complete_siwe(payload, "xyz999").await.unwrap();
        assert!(!completion.is_valid);
        assert_eq!(completion.message.as_deref(), Some("Invalid nonce"));
    }

    #[tokio::test]
    async fn test_verify_status_mapping() {
        let (mut server, client) = client().await;
        server
            .mock("POST", "/api/verify")
            .match_body(Matcher::PartialJson(json!({"action": "verify"})))
            .with_status(409)
            .with_body(r#"{"status":409,"code":"max_verifications_reached","detail":"done"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/verify")
            .match_body(Matcher::PartialJson(json!({"action": "submit-review"})))
            .with_status(400)
            .with_body(r#"{"status":400,"code":"invalid_proof","detail":"bad proof"}"#)
            .create_async()
            .await;

        assert_eq!(
            client.verify(proof(), "verify", None).await.unwrap(),
            IdentityOutcome::AlreadyVerified {
                code: "max_verifications_reached".to_string()
            }
        );
        let review = ReviewDraft {
            app_name: Some("Midjourney".to_string()),
            ..ReviewDraft::default()
        };
        assert_eq!(
            client.submit_review(review, proof()).await.unwrap(),
            IdentityOutcome::Rejected {
                code: "invalid_proof".to_string(),
                detail: "bad proof".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_submit_review_sends_review_data() {
        let (mut server, client) = client().await;
        let mock = server
            .mock("POST", "/api/verify")
            .match_body(Matcher::PartialJson(json!({
                "action": "submit-review",
                "reviewData": {"appName": "Midjourney"},
                "payload": {"nullifier_hash": "0xnullifier", "verification_level": "orb"},
            })))
            .with_status(200)
            .with_body(r#"{"status":200,"message":"Verification successful"}"#)
            .create_async()
            .await;

        let review = ReviewDraft {
            app_name: Some("Midjourney".to_string()),
            ..ReviewDraft::default()
        };
        assert_eq!(
            client.submit_review(review, proof()).await.unwrap(),
            IdentityOutcome::Accepted
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_configuration_error_is_an_error() {
        let (mut server, client) = client().await;
        server
            .mock("POST", "/api/verify")
            .with_status(500)
            .with_body(r#"{"status":500,"message":"APP_ID not configured"}"#)
            .create_async()
            .await;

        let result = client.verify(proof(), "verify", None).await;
        assert!(matches!(
            result,
            Err(AicurateError::NetworkError {
                status: Some(500),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_payment_round_trip() {
        let (mut server, client) = client().await;
        server
            .mock("POST", "/api/initiate-payment")
            .with_status(200)
            .with_body(r#"{"id":"9f2b"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/confirm-payment")
            .match_body(Matcher::PartialJson(json!({
                "payload": {"status": "success", "reference": "9f2b"}
            })))
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;

        let reference = client.initiate_payment().await.unwrap();
        assert_eq!(reference.as_str(), "9f2b");
        let confirmed = client
            .confirm_payment(PayFinalPayload::Success {
                transaction_id: "0xtx".to_string(),
                reference: reference.to_string(),
                from: None,
            })
            .await
            .unwrap();
        assert!(confirmed);
    }

    #[tokio::test]
    async fn test_payment_initiation_is_sent_once() {
        let (mut server, client) = client().await;
        let initiate = server
            .mock("POST", "/api/initiate-payment")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let result = client.initiate_payment().await;

        assert!(matches!(
            result,
            Err(AicurateError::NetworkError {
                status: Some(503),
                ..
            })
        ));
        initiate.assert_async().await;
    }

    #[tokio::test]
    async fn test_consultation_stream_and_refusal() {
        let (mut server, client) = client().await;
        server
            .mock("POST", "/api/ai")
            .match_body(Matcher::PartialJson(json!({"hasCredits": true})))
            .with_status(200)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body("Essayez Runway.")
            .create_async()
            .await;
        server
            .mock("POST", "/api/ai")
            .match_body(Matcher::PartialJson(json!({"hasCredits": false})))
            .with_status(402)
            .with_body(r#"{"error":"Payment required for consultation"}"#)
            .create_async()
            .await;

        let stream = client
            .open(ConsultationRequest {
                messages: vec![crate::consultation::ChatMessage::user("video?")],
                has_credits: true,
            })
            .await
            .unwrap();
        let text: Vec<String> = stream.map(Result::unwrap).collect().await;
        assert_eq!(text.concat(), "Essayez Runway.");

        let refused = client
            .open(ConsultationRequest {
                messages: vec![],
                has_credits: false,
            })
            .await;
        assert!(matches!(refused, Err(ConsultationError::PaymentRequired)));
    }

    #[tokio::test]
    async fn test_utf8_split_across_chunks() {
        let bytes = "Café ☕".as_bytes().to_vec();
        let chunks: Vec<Result<Vec<u8>, ConsultationError>> =
            bytes.chunks(1).map(|b| Ok(b.to_vec())).collect();
        let items: Vec<_> = utf8_text(stream::iter(chunks)).collect().await;
        let text: String = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(text, "Café ☕");
    }

    #[tokio::test]
    async fn test_truncated_utf8_is_an_error() {
        let chunks: Vec<Result<Vec<u8>, ConsultationError>> =
            vec![Ok(b"ok ".to_vec()), Ok(vec![0xe2, 0x98])];
        let items: Vec<_> = utf8_text(stream::iter(chunks)).collect().await;
        assert_eq!(items[0].as_ref().unwrap(), "ok ");
        assert!(matches!(items.last(), Some(Err(ConsultationError::Stream(_)))));
    }
}
