use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::{
    auth::AuthError,
    pricing::{CURRENCY, MediaKind, Quality},
    store::StoreError,
};

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<&'static str>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub need_subscription: Option<bool>,
}

/// Error surfaced at the HTTP boundary: a status code plus a JSON body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                ..ErrorBody::default()
            },
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.body.details = Some(details.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, message)
    }

    /// Catch-all for failures nobody planned for. Logged here so call sites
    /// only have to propagate.
    pub fn server_error(details: impl Into<String>, code: Option<String>) -> Self {
        let details = details.into();
        error!(code = ?code, "request failed: {details}");
        let mut error = Self::internal("server error").with_details(details);
        error.body.code = code;
        error
    }

    pub fn payment_required(
        intent_id: String,
        amount: f64,
        kind: MediaKind,
        quality: Quality,
    ) -> Self {
        let mut error = Self::new(StatusCode::PAYMENT_REQUIRED, "payment_required");
        error.body.intent_id = Some(intent_id);
        error.body.amount = Some(amount);
        error.body.currency = Some(CURRENCY);
        error.body.kind = Some(kind);
        error.body.quality = Some(quality);
        error
    }

    pub fn subscription_required(message: impl Into<String>) -> Self {
        let mut error = Self::new(StatusCode::PAYMENT_REQUIRED, message);
        error.body.need_subscription = Some(true);
        error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self::server_error(error.to_string(), None)
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::MissingToken => Self::unauthorized("missing_token"),
            AuthError::InvalidToken(reason) => {
                tracing::debug!("rejected identity token: {reason}");
                Self::unauthorized("invalid_token")
            }
            AuthError::Backend(reason) => {
                error!("identity verification backend failed: {reason}");
                Self::internal("auth_verify_failed")
            }
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        let code = error.status().map(|status| status.as_u16().to_string());
        Self::server_error(error.to_string(), code)
    }
}
