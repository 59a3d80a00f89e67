//! Proxy errors and their HTTP rendering.
//!
//! Every failure leaves the proxy as JSON `{"error": <code>, ...}` with a status
//! that tells "could not pay" (403, 503) apart from "paid but rejected" (502
//! `payment_rejected`). A 402 is never passed to the client.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reqwest_middleware as rqm;
use serde_json::json;
use x402_treasurer::PaymentError;
use x402_treasurer::treasurer::DenialReason;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No target given: pass ?target=<url> or configure a default target")]
    MissingTarget,
    #[error("Invalid target URL: {0}")]
    InvalidTarget(#[from] url::ParseError),
    #[error("Failed to read request body: {0}")]
    RequestBody(#[source] axum::Error),
    #[error("Payment denied: {0}")]
    PaymentDenied(DenialReason),
    #[error("Payment could not be signed: {0}")]
    SigningFailed(String),
    #[error("Payment rejected by upstream: {}", .0.as_deref().unwrap_or("no reason given"))]
    PaymentRejected(Option<String>),
    #[error("Upstream returned an unreadable payment challenge")]
    MalformedChallenge,
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingTarget | ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::RequestBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::PaymentDenied(_) => StatusCode::FORBIDDEN,
            ProxyError::SigningFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::PaymentRejected(_)
            | ProxyError::MalformedChallenge
            | ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::MissingTarget => "missing_target",
            ProxyError::InvalidTarget(_) => "invalid_target",
            ProxyError::RequestBody(_) => "invalid_request_body",
            ProxyError::PaymentDenied(_) => "payment_denied",
            ProxyError::SigningFailed(_) => "signing_failed",
            ProxyError::PaymentRejected(_) => "payment_rejected",
            ProxyError::MalformedChallenge => "malformed_challenge",
            ProxyError::UpstreamUnavailable(_) => "upstream_unavailable",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

impl From<rqm::Error> for ProxyError {
    fn from(error: rqm::Error) -> Self {
        match PaymentError::from_middleware_error(&error) {
            Some(PaymentError::PaymentDenied(reason)) => ProxyError::PaymentDenied(*reason),
            Some(PaymentError::SigningFailed(e)) => ProxyError::SigningFailed(e.to_string()),
            Some(PaymentError::PaymentRejected { reason, .. }) => {
                ProxyError::PaymentRejected(reason.clone())
            }
            Some(e @ (PaymentError::Encoding(_) | PaymentError::RequestNotCloneable)) => {
                ProxyError::Internal(e.to_string())
            }
            None => ProxyError::UpstreamUnavailable(error.to_string()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, code = self.code(), "Proxy request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "Proxy request refused");
        }
        let body = match &self {
            ProxyError::PaymentDenied(reason) => json!({
                "error": self.code(),
                "reason": reason,
            }),
            ProxyError::PaymentRejected(reason) => json!({
                "error": self.code(),
                "reason": reason,
            }),
            other => json!({
                "error": other.code(),
                "message": other.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}
