//! Instagram account connection models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Expired,
    Revoked,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Expired => "expired",
            ConnectionStatus::Revoked => "revoked",
            ConnectionStatus::Error => "error",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConnectionStatus::Active),
            "expired" => Ok(ConnectionStatus::Expired),
            "revoked" => Ok(ConnectionStatus::Revoked),
            "error" => Ok(ConnectionStatus::Error),
            other => Err(format!("unknown connection status {other}")),
        }
    }
}

/// Linked Instagram business account of a workspace
#[derive(Debug, Clone, Serialize)]
pub struct IgAccountConnection {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub external_account_id: String,
    pub username: String,
    pub account_type: String,
    #[serde(skip_serializing)]
    pub encrypted_access_token: String, // base64(nonce || ciphertext), see crypto::TokenCipher
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub status: ConnectionStatus,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub error_message: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IgAccountConnection {
    pub fn is_expired(&self) -> bool {
        self.token_expires_at
            .map(|exp| exp <= Utc::now())
            .unwrap_or(false)
    }

    pub fn has_token(&self) -> bool {
        !self.encrypted_access_token.is_empty()
    }
}

/// Connection as returned by the API
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionResponse {
    #[serde(flatten)]
    pub connection: IgAccountConnection,
    pub is_expired: bool,
}

impl From<IgAccountConnection> for ConnectionResponse {
    fn from(connection: IgAccountConnection) -> Self {
        let is_expired = connection.is_expired();
        Self {
            connection,
            is_expired,
        }
    }
}

/// Account data obtained from a completed OAuth exchange
#[derive(Debug, Clone)]
pub struct LinkedAccount {
    pub external_account_id: String,
    pub username: String,
    pub account_type: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub metadata: Value,
}

/// Instagram post as exposed by the media endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_product_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaComment {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
}

/// One page of an account's posts; `paging` is passed through as Graph sends it
#[derive(Debug, Clone, Default)]
pub struct MediaPage {
    pub data: Vec<MediaItem>,
    pub paging: Value,
}

#[derive(Debug, Clone)]
pub struct MediaDetail {
    pub media: MediaItem,
    pub comments: Vec<MediaComment>,
}

pub const DEFAULT_MEDIA_LIMIT: u32 = 10;
pub const MAX_MEDIA_LIMIT: u32 = 50;

/// Parse an optional `limit` query value: `default` when absent, capped at
/// `max`, 400 when it is not a positive integer.
pub fn parse_limit(raw: Option<&str>, default: u32, max: u32) -> Result<u32, String> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => match v.parse::<u32>() {
            Ok(0) | Err(_) => Err(format!("limit: A positive integer is required, got {v:?}.")),
            Ok(n) => Ok(n.min(max)),
        },
    }
}

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    pub limit: Option<String>,
    pub after: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccountSummary {
    pub username: String,
    pub account_id: String,
}

impl From<&IgAccountConnection> for AccountSummary {
    fn from(connection: &IgAccountConnection) -> Self {
        Self {
            username: connection.username.clone(),
            account_id: connection.external_account_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MediaListQueryEcho {
    pub limit: u32,
    pub after: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MediaListResponse {
    pub success: bool,
    pub data: Vec<MediaItem>,
    pub paging: Value,
    pub count: usize,
    pub connection: AccountSummary,
    pub query: MediaListQueryEcho,
}

#[derive(Debug, Serialize)]
pub struct CommentList {
    pub data: Vec<MediaComment>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct MediaDetailResponse {
    pub success: bool,
    pub media: MediaItem,
    pub comments: CommentList,
    pub connection: AccountSummary,
}

#[derive(Debug, Serialize)]
pub struct ConnectStartResponse {
    pub authorization_url: String,
    pub state: String,
    pub mode: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn connection(expires: Option<DateTime<Utc>>) -> IgAccountConnection {
        IgAccountConnection {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            external_account_id: "17841400000000000".to_string(),
            username: "shop".to_string(),
            account_type: "BUSINESS".to_string(),
            encrypted_access_token: "c2VjcmV0".to_string(),
            token_expires_at: expires,
            scopes: vec!["instagram_basic".to_string()],
            status: ConnectionStatus::Active,
            last_verified_at: None,
            error_message: String::new(),
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_expiry() {
        assert!(connection(Some(Utc::now() - Duration::seconds(1))).is_expired());
        assert!(!connection(Some(Utc::now() + Duration::days(1))).is_expired());
        assert!(!connection(None).is_expired());
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(None, 10, 50), Ok(10));
        assert_eq!(parse_limit(Some(""), 10, 50), Ok(10));
        assert_eq!(parse_limit(Some("25"), 10, 50), Ok(25));
        assert_eq!(parse_limit(Some("500"), 10, 50), Ok(50));
        assert!(parse_limit(Some("0"), 10, 50).is_err());
        assert!(parse_limit(Some("-3"), 10, 50).is_err());
        assert!(parse_limit(Some("ten"), 10, 50).is_err());
    }

    #[test]
    fn test_response_hides_token() {
        let body = serde_json::to_value(ConnectionResponse::from(connection(None))).unwrap();
        assert!(body.get("encrypted_access_token").is_none());
        assert_eq!(body["status"], "active");
        assert_eq!(body["is_expired"], false);
        assert_eq!(body["username"], "shop");
    }
}
