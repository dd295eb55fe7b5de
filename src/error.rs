//! API error type and the JSON error envelope.
//!
//! Every failed request answers with
//! `{ "success": false, "error": { "code", "message", "details" } }`.

use crate::billing::UsageError;
use crate::integrations::oauth::ProviderError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Authentication credentials were not provided or are invalid")]
    Unauthorized,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Plan limit exceeded for {metric}. Current: {current}, Limit: {limit}, Plan: {plan}")]
    PlanLimitExceeded {
        metric: String,
        limit: i64,
        current: i64,
        plan: String,
    },

    #[error("{0}")]
    BadGateway(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized | ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PlanLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized => "NOT_AUTHENTICATED",
            ApiError::InvalidCredentials => "INVALID_CREDENTIALS",
            ApiError::Forbidden(_) => "PERMISSION_DENIED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::PlanLimitExceeded { .. } => "PLAN_LIMIT_EXCEEDED",
            ApiError::BadGateway(_) => "UPSTREAM_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn details(&self) -> Value {
        match self {
            ApiError::PlanLimitExceeded {
                metric,
                limit,
                current,
                plan,
            } => json!({
                "metric": metric,
                "current": current,
                "limit": limit,
                "plan": plan,
            }),
            ApiError::Internal(_) => json!({}),
            other => json!({ "detail": other.to_string() }),
        }
    }
}

impl From<UsageError> for ApiError {
    fn from(err: UsageError) -> Self {
        match err {
            UsageError::LimitExceeded {
                metric,
                limit,
                current,
                plan,
            } => ApiError::PlanLimitExceeded {
                metric: metric.as_str().to_string(),
                limit,
                current,
                plan: plan.as_str().to_string(),
            },
            UsageError::InvalidAmount(amount) => {
                ApiError::Validation(format!("amount must be a positive integer, got {amount}"))
            }
            overflow @ UsageError::Overflow { .. } => ApiError::Validation(overflow.to_string()),
            UsageError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            ProviderError::Internal(e) => ApiError::Internal(e),
            other => ApiError::BadGateway(other.to_string()),
        }
    }
}

/// Decode a JSON request body, answering malformed or mistyped input with a
/// 400 envelope instead of the extractor's plain-text rejection.
pub fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| ApiError::Validation(format!("Invalid JSON body: {e}")))
}

/// Build the error envelope for an arbitrary status/code pair.
pub fn envelope(status: StatusCode, code: &str, message: &str, details: Value) -> Response {
    let body = json!({
        "success": false,
        "error": {
            "code": code,
            "message": message,
            "details": details,
        }
    });
    (status, Json(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref e) = self {
            error!("internal error: {e:#}");
        }

        let message = match &self {
            ApiError::PlanLimitExceeded { .. } => "Plan usage limit exceeded".to_string(),
            other => other.to_string(),
        };

        envelope(self.status(), self.code(), &message, self.details())
    }
}
