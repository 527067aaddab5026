use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failure response of an endpoint. Each family keeps the body shape its
/// clients already parse.
#[derive(Debug, Error)]
pub enum ApiError {
    /// `POST /api/complete-siwe`: `{status: "error", isValid: false, message}`.
    #[error("{message}")]
    WalletAuth {
        /// HTTP status.
        status: StatusCode,
        /// Client-facing reason.
        message: String,
    },
    /// `POST /api/verify`: `{status: <code>, message, code?, detail?}`.
    #[error("{message}")]
    Verify {
        /// HTTP status, mirrored in the body.
        status: StatusCode,
        /// Client-facing summary.
        message: String,
        /// Upstream code.
        code: Option<String>,
        /// Upstream detail, omitted in production.
        detail: Option<String>,
    },
    /// Payment and consultation endpoints: `{error}`.
    #[error("{message}")]
    Plain {
        /// HTTP status.
        status: StatusCode,
        /// Client-facing reason.
        message: String,
    },
}

impl ApiError {
    pub(crate) fn wallet_auth(status: StatusCode, message: impl Into<String>) -> Self {
        Self::WalletAuth {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn verify(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Verify {
            status,
            message: message.into(),
            code: None,
            detail: None,
        }
    }

    pub(crate) fn plain(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Plain {
            status,
            message: message.into(),
        }
    }

    /// HTTP status of the response.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::WalletAuth { status, .. }
            | Self::Verify { status, .. }
            | Self::Plain { status, .. } => *status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::WalletAuth { message, .. } => json!({
                "status": "error",
                "isValid": false,
                "message": message,
            }),
            Self::Verify {
                message,
                code,
                detail,
                ..
            } => {
                let mut body = json!({"status": status.as_u16(), "message": message});
                if let Some(code) = code {
                    body["code"] = code.into();
                }
                if let Some(detail) = detail {
                    body["detail"] = detail.into();
                }
                body
            }
            Self::Plain { message, .. } => json!({"error": message}),
        };
        (status, Json(body)).into_response()
    }
}
