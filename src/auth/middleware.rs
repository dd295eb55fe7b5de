//! Authentication Middleware
//! Mission: Protect API endpoints with JWT validation

use crate::auth::{
    jwt::JwtHandler,
    models::{Claims, TokenType},
};
use crate::error::ApiError;
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Auth middleware that validates Bearer access tokens
pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(ApiError::Unauthorized)?;

    // Refresh tokens are only good for the refresh endpoint
    let claims = jwt_handler
        .validate_typed(bearer.token(), TokenType::Access)
        .map_err(|e| {
            debug!("rejected bearer token: {e}");
            ApiError::Unauthorized
        })?;

    // Add claims to request extensions so handlers can access them
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Authenticated caller, available to handlers behind `auth_middleware`
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: String,
}

impl TryFrom<&Claims> for AuthUser {
    type Error = ApiError;

    fn try_from(claims: &Claims) -> Result<Self, Self::Error> {
        let id = claims.user_id().ok_or(ApiError::Unauthorized)?;
        Ok(Self {
            id,
            email: claims.email.clone(),
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = parts
            .extensions
            .get::<Claims>()
            .ok_or(ApiError::Unauthorized)?;
        AuthUser::try_from(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::User;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use chrono::Utc;
    use tower::ServiceExt;

    fn create_test_user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "testuser@example.com".to_string(),
            full_name: String::new(),
            password_hash: "hash".to_string(),
            date_joined: Utc::now(),
            last_login: None,
        }
    }

    fn protected_app(jwt: Arc<JwtHandler>) -> Router {
        Router::new()
            .route(
                "/whoami",
                get(|user: AuthUser| async move { user.email }),
            )
            .layer(middleware::from_fn_with_state(jwt, auth_middleware))
    }

    async fn call(app: Router, auth: Option<String>) -> StatusCode {
        let mut builder = axum::http::Request::builder().uri("/whoami");
        if let Some(value) = auth {
            builder = builder.header("Authorization", value);
        }
        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let jwt = Arc::new(JwtHandler::new("secret".to_string(), 60, 7));
        assert_eq!(call(protected_app(jwt), None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_access_token_is_accepted() {
        let jwt = Arc::new(JwtHandler::new("secret".to_string(), 60, 7));
        let pair = jwt.issue_pair(&create_test_user()).unwrap();
        let status = call(protected_app(jwt), Some(format!("Bearer {}", pair.access))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_refresh_token_is_rejected() {
        let jwt = Arc::new(JwtHandler::new("secret".to_string(), 60, 7));
        let pair = jwt.issue_pair(&create_test_user()).unwrap();
        let status = call(protected_app(jwt), Some(format!("Bearer {}", pair.refresh))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_header_is_unauthorized() {
        let jwt = Arc::new(JwtHandler::new("secret".to_string(), 60, 7));
        let status = call(protected_app(jwt), Some("Token abc".to_string())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
