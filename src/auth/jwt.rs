//! JWT Token Handler
//! Mission: Issue and validate access/refresh token pairs

use crate::auth::models::{Claims, TokenPair, TokenType, User};
use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;
use uuid::Uuid;

/// JWT Handler for token operations
pub struct JwtHandler {
    secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl JwtHandler {
    /// Create a new JWT handler with secret key and token lifetimes
    pub fn new(secret: String, access_minutes: i64, refresh_days: i64) -> Self {
        Self {
            secret,
            access_ttl: Duration::minutes(access_minutes.max(1)),
            refresh_ttl: Duration::days(refresh_days.max(1)),
        }
    }

    fn issue(&self, sub: &str, email: &str, token_type: TokenType) -> Result<String> {
        let now = Utc::now();
        let ttl = match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let exp = now
            .checked_add_signed(ttl)
            .context("Invalid timestamp")?
            .timestamp() as usize;

        let claims = Claims {
            sub: sub.to_string(),
            email: email.to_string(),
            token_type,
            iat: now.timestamp() as usize,
            exp,
            jti: Uuid::new_v4().simple().to_string(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to generate JWT")
    }

    /// Generate an access + refresh pair for a user
    pub fn issue_pair(&self, user: &User) -> Result<TokenPair> {
        debug!(user_id = %user.id, "issuing token pair");
        Ok(TokenPair {
            access: self.issue(&user.id.to_string(), &user.email, TokenType::Access)?,
            refresh: self.issue(&user.id.to_string(), &user.email, TokenType::Refresh)?,
        })
    }

    /// Validate a JWT token and extract claims
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("Invalid or expired token")?;

        Ok(decoded.claims)
    }

    /// Validate a token and require a specific type
    pub fn validate_typed(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let claims = self.validate_token(token)?;
        if claims.token_type != expected {
            bail!("Token has wrong type: {:?}", claims.token_type);
        }
        Ok(claims)
    }

    /// Exchange a refresh token for a fresh pair
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.validate_typed(refresh_token, TokenType::Refresh)?;
        Ok(TokenPair {
            access: self.issue(&claims.sub, &claims.email, TokenType::Access)?,
            refresh: self.issue(&claims.sub, &claims.email, TokenType::Refresh)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "test@example.com".to_string(),
            full_name: "Test User".to_string(),
            password_hash: "hash".to_string(),
            date_joined: Utc::now(),
            last_login: None,
        }
    }

    fn handler() -> JwtHandler {
        JwtHandler::new("test-secret-key-12345".to_string(), 60, 7)
    }

    #[test]
    fn test_pair_generation_and_validation() {
        let handler = handler();
        let user = create_test_user();

        let pair = handler.issue_pair(&user).unwrap();
        assert_ne!(pair.access, pair.refresh);

        let access = handler.validate_typed(&pair.access, TokenType::Access).unwrap();
        assert_eq!(access.sub, user.id.to_string());
        assert_eq!(access.email, user.email);
        assert_eq!(access.user_id(), Some(user.id));
        assert!(access.exp > Utc::now().timestamp() as usize);

        let refresh = handler.validate_typed(&pair.refresh, TokenType::Refresh).unwrap();
        assert!(refresh.exp > access.exp);
    }

    #[test]
    fn test_wrong_token_type_rejected() {
        let handler = handler();
        let pair = handler.issue_pair(&create_test_user()).unwrap();

        assert!(handler.validate_typed(&pair.refresh, TokenType::Access).is_err());
        assert!(handler.refresh(&pair.access).is_err());
    }

    #[test]
    fn test_refresh_issues_new_pair() {
        let handler = handler();
        let user = create_test_user();
        let pair = handler.issue_pair(&user).unwrap();

        let renewed = handler.refresh(&pair.refresh).unwrap();
        let claims = handler.validate_typed(&renewed.access, TokenType::Access).unwrap();
        assert_eq!(claims.sub, user.id.to_string());
    }

    #[test]
    fn test_invalid_token_rejected() {
        assert!(handler().validate_token("invalid.token.here").is_err());
    }

    #[test]
    fn test_different_secrets_reject() {
        let handler1 = JwtHandler::new("secret1".to_string(), 60, 7);
        let handler2 = JwtHandler::new("secret2".to_string(), 60, 7);

        let pair = handler1.issue_pair(&create_test_user()).unwrap();
        assert!(handler2.validate_token(&pair.access).is_err());
    }
}
