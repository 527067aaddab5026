use aicurate_core::client::{
    CompleteSiweRequest, ConfirmPaymentRequest, ConfirmPaymentResponse, InitiatePaymentResponse,
    NonceResponse, SiweCompletion, VerifyRequest, VerifyResponse,
};
use aicurate_core::consultation::ConsultationRequest;
use aicurate_core::identity::IdentityOutcome;
use aicurate_core::nonce::{NONCE_COOKIE, NONCE_TTL};
use aicurate_core::wallet_auth::WalletAuthOutcome;
use aicurate_core::AicurateError;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/nonce", get(nonce))
        .route("/api/complete-siwe", post(complete_siwe))
        .route("/api/verify", post(verify))
        .route("/api/initiate-payment", post(initiate_payment))
        .route("/api/confirm-payment", post(confirm_payment))
        .route("/api/ai", post(consult))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Value of the nonce cookie sent with the request, if any.
fn session_nonce(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == NONCE_COOKIE)
        .map(|(_, value)| value.to_string())
}

fn nonce_cookie(value: &str, max_age: u64) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&format!(
        "{NONCE_COOKIE}={value}; Path=/; Max-Age={max_age}; HttpOnly; Secure; SameSite=Strict"
    ))
    .map_err(|_| ApiError::plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"))
}

async fn nonce(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let previous = session_nonce(&headers);
    let nonce = state.nonces.issue(previous.as_deref());
    let cookie = nonce_cookie(nonce.as_str(), NONCE_TTL.as_secs())?;

    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(NonceResponse {
            nonce: nonce.to_string(),
        }),
    )
        .into_response())
}

async fn complete_siwe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CompleteSiweRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        body.map_err(|rejection| ApiError::wallet_auth(StatusCode::BAD_REQUEST, rejection.body_text()))?;
    let session = session_nonce(&headers);

    let outcome = state
        .wallet_auth
        .complete_auth(&request.payload, &request.nonce, session.as_deref())
        .await;
    // The session nonce is spent whatever the outcome.
    let expired = nonce_cookie("", 0)?;

    match outcome {
        WalletAuthOutcome::Authorized { address } => Ok((
            [(header::SET_COOKIE, expired)],
            Json(SiweCompletion {
                status: "success".to_string(),
                is_valid: true,
                address: Some(address),
                message: None,
            }),
        )
            .into_response()),
        WalletAuthOutcome::InvalidNonce(check) => {
            tracing::info!(?check, "wallet sign-in with invalid nonce");
            Err(ApiError::wallet_auth(StatusCode::UNAUTHORIZED, "Invalid nonce"))
        }
        WalletAuthOutcome::Rejected { message } => {
            tracing::info!(%message, "wallet sign-in rejected");
            Ok((
                StatusCode::BAD_REQUEST,
                [(header::SET_COOKIE, expired)],
                Json(SiweCompletion {
                    status: "error".to_string(),
                    is_valid: false,
                    address: None,
                    message: Some(message),
                }),
            )
                .into_response())
        }
    }
}

async fn verify(
    State(state): State<AppState>,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Json(request) =
        body.map_err(|rejection| ApiError::verify(StatusCode::BAD_REQUEST, rejection.body_text()))?;
    let diagnostic = state.environment.is_diagnostic();

    if let Some(review) = &request.review_data {
        review.validate().map_err(|err| ApiError::Verify {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
            code: Some("invalid_review".to_string()),
            detail: None,
        })?;
    }

    let outcome = state
        .identity
        .verify(&request.payload, &request.action, request.signal.as_deref())
        .await
        .map_err(|err| match err {
            AicurateError::Configuration(message) => {
                tracing::error!(%message, "verification not configured");
                ApiError::verify(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            other => {
                tracing::error!(error = %other, "verification failed");
                ApiError::verify(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        })?;

    match outcome {
        IdentityOutcome::Accepted => {
            if let Some(review) = &request.review_data {
                tracing::info!(
                    app = review.app_name.as_deref().unwrap_or_default(),
                    "verified review received"
                );
            }
            Ok(Json(VerifyResponse {
                status: StatusCode::OK.as_u16(),
                message: Some("Verification successful".to_string()),
                code: None,
                detail: None,
            }))
        }
        IdentityOutcome::AlreadyVerified { code } => Err(ApiError::Verify {
            status: StatusCode::CONFLICT,
            message: "Action already verified".to_string(),
            code: Some(code),
            detail: None,
        }),
        IdentityOutcome::Rejected { code, detail } => Err(ApiError::Verify {
            status: StatusCode::BAD_REQUEST,
            message: "Verification failed".to_string(),
            code: Some(code),
            detail: diagnostic.then_some(detail),
        }),
    }
}

async fn initiate_payment(State(state): State<AppState>) -> Json<InitiatePaymentResponse> {
    Json(InitiatePaymentResponse {
        id: state.initiator.initiate(),
    })
}

async fn confirm_payment(
    State(state): State<AppState>,
    body: Result<Json<ConfirmPaymentRequest>, JsonRejection>,
) -> Result<Json<ConfirmPaymentResponse>, ApiError> {
    let Json(request) =
        body.map_err(|rejection| ApiError::plain(StatusCode::BAD_REQUEST, rejection.body_text()))?;

    let success = state
        .confirmer
        .confirm(&request.payload)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "payment confirmation unavailable");
            ApiError::plain(StatusCode::INTERNAL_SERVER_ERROR, "Failed to confirm payment")
        })?;
    Ok(Json(ConfirmPaymentResponse { success }))
}

async fn consult(
    State(state): State<AppState>,
    body: Result<Json<ConsultationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        body.map_err(|rejection| ApiError::plain(StatusCode::BAD_REQUEST, rejection.body_text()))?;
    if !request.has_credits {
        return Err(ApiError::plain(
            StatusCode::PAYMENT_REQUIRED,
            "Payment required for consultation",
        ));
    }
    if request.messages.is_empty() {
        return Err(ApiError::plain(StatusCode::BAD_REQUEST, "messages must not be empty"));
    }

    let stream = state
        .generator
        .generate(request.messages)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "consultation failed");
            ApiError::plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to process consultation",
            )
        })?;
    let stream = stream.inspect(|chunk| {
        if let Err(err) = chunk {
            tracing::warn!(error = %err, "consultation stream interrupted");
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_nonce_from_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; siwe=5d41402abc4b2a76; other=1"),
        );
        assert_eq!(session_nonce(&headers).as_deref(), Some("5d41402abc4b2a76"));

        assert_eq!(session_nonce(&HeaderMap::new()), None);
    }
}
