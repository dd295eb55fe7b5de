//! Instagram OAuth providers.
//!
//! Business accounts are reached through Facebook Login: the user grants the
//! app access to a Facebook Page, and the Instagram business account linked
//! to that page is what gets connected.

use crate::crypto;
use crate::integrations::models::{LinkedAccount, MediaComment, MediaDetail, MediaItem, MediaPage};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration as StdDuration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const GRAPH_API_VERSION: &str = "v24.0";
pub const GRAPH_API_BASE: &str = "https://graph.facebook.com/v24.0";
pub const AUTHORIZE_URL: &str = "https://www.facebook.com/v24.0/dialog/oauth";

pub const REQUIRED_SCOPES: [&str; 6] = [
    "pages_show_list",
    "pages_read_engagement",
    "instagram_basic",
    "instagram_manage_comments",
    "instagram_manage_messages",
    "business_management",
];

/// Lifetime assumed for a long-lived token when Graph omits `expires_in` (60 days)
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 5_184_000;

pub const MOCK_CODE_PREFIX: &str = "mock_code_";
pub const MOCK_TOKEN_PREFIX: &str = "mock_token_";
pub const MOCK_MEDIA_PREFIX: &str = "mock_media_";
/// Posts every mock account owns
pub const MOCK_MEDIA_COUNT: usize = 12;

const MEDIA_FIELDS: &str = "id,caption,media_type,media_url,thumbnail_url,permalink,timestamp,like_count,comments_count,media_product_type";
const COMMENT_FIELDS: &str = "id,text,username,timestamp,like_count";
const COMMENT_PAGE_SIZE: &str = "50";

pub fn required_scopes() -> Vec<String> {
    REQUIRED_SCOPES.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authorization code rejected: {0}")]
    InvalidCode(String),

    #[error("Facebook API error: {0}")]
    Graph(String),

    #[error("No Facebook Page is available for this account")]
    NoFacebookPage,

    #[error("No Instagram business account is linked to the Facebook Pages")]
    NoInstagramBusinessAccount,

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProviderError {
    /// Error code reported to the connect popup
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::InvalidCode(_) => "OAUTH_AUTHORIZATION_FAILED",
            ProviderError::Graph(_) => "FACEBOOK_API_ERROR",
            ProviderError::NoFacebookPage => "NO_FACEBOOK_PAGE",
            ProviderError::NoInstagramBusinessAccount => "NO_INSTAGRAM_BUSINESS_ACCOUNT",
            ProviderError::NotFound(_) => "NOT_FOUND",
            ProviderError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Graph(err.to_string())
    }
}

/// Source of Instagram account links
#[async_trait]
pub trait InstagramProvider: Send + Sync {
    /// `"mock"` or `"production"`
    fn mode(&self) -> &'static str;

    /// URL the user is sent to in order to grant access
    fn authorization_url(&self, redirect_uri: &str, state: &str) -> anyhow::Result<String>;

    /// Complete the code exchange and resolve the business account
    async fn link_account(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<LinkedAccount, ProviderError>;

    /// Check that a stored token still reaches the account
    async fn verify_account(
        &self,
        external_account_id: &str,
        access_token: &str,
    ) -> Result<(), ProviderError>;

    /// One page of the account's posts, newest first
    async fn list_media(
        &self,
        external_account_id: &str,
        access_token: &str,
        limit: u32,
        after: Option<&str>,
    ) -> Result<MediaPage, ProviderError>;

    /// A single post with its first page of comments
    async fn media_detail(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<MediaDetail, ProviderError>;

    /// Private reply to a comment; returns the raw API response
    async fn send_comment_reply(
        &self,
        external_account_id: &str,
        comment_id: &str,
        text: &str,
        access_token: &str,
    ) -> Result<Value, ProviderError>;
}

// ---- Graph API ----

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Page {
    id: String,
    #[serde(default)]
    name: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct PageList {
    #[serde(default)]
    data: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct AccountRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PageAccount {
    instagram_business_account: Option<AccountRef>,
}

#[derive(Debug, Deserialize)]
struct MediaList {
    #[serde(default)]
    data: Vec<MediaItem>,
    #[serde(default)]
    paging: Value,
}

#[derive(Debug, Deserialize)]
struct CommentPage {
    #[serde(default)]
    data: Vec<MediaComment>,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    profile_picture_url: Option<String>,
}

/// Facebook Graph API client
pub struct GraphApiProvider {
    client: Client,
    app_id: String,
    app_secret: String,
    base_url: String,
}

impl GraphApiProvider {
    pub fn new(app_id: String, app_secret: String) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(StdDuration::from_secs(10)).build()?;
        Ok(Self {
            client,
            app_id,
            app_secret,
            base_url: GRAPH_API_BASE.to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let resp = self.client.get(&url).query(query).send().await?;
        Self::read_body(path, resp).await
    }

    async fn read_body<T: serde::de::DeserializeOwned>(
        path: &str,
        resp: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = resp.status();
        let body: Value = resp.json().await?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {status}"));
            warn!("Graph API {} failed: {}", path, message);
            return Err(ProviderError::Graph(message));
        }
        serde_json::from_value(body).map_err(|e| ProviderError::Graph(e.to_string()))
    }

    /// JSON POST with a signed token in the query string
    async fn post_signed(
        &self,
        path: &str,
        access_token: &str,
        payload: &Value,
    ) -> Result<Value, ProviderError> {
        let proof = crypto::appsecret_proof(&self.app_secret, access_token)?;
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let resp = self
            .client
            .post(&url)
            .query(&[("access_token", access_token), ("appsecret_proof", proof.as_str())])
            .json(payload)
            .send()
            .await?;
        Self::read_body(path, resp).await
    }

    /// GET with a user/page token, signed with `appsecret_proof`
    async fn get_signed<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        access_token: &str,
        extra: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let proof = crypto::appsecret_proof(&self.app_secret, access_token)?;
        let mut query = vec![("access_token", access_token), ("appsecret_proof", proof.as_str())];
        query.extend_from_slice(extra);
        self.get(path, &query).await
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String, ProviderError> {
        let token: TokenResponse = self
            .get(
                "oauth/access_token",
                &[
                    ("client_id", self.app_id.as_str()),
                    ("client_secret", self.app_secret.as_str()),
                    ("redirect_uri", redirect_uri),
                    ("code", code),
                ],
            )
            .await?;
        Ok(token.access_token)
    }

    async fn long_lived_token(&self, short_lived: &str) -> Result<TokenResponse, ProviderError> {
        self.get(
            "oauth/access_token",
            &[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.app_id.as_str()),
                ("client_secret", self.app_secret.as_str()),
                ("fb_exchange_token", short_lived),
            ],
        )
        .await
    }
}

#[async_trait]
impl InstagramProvider for GraphApiProvider {
    fn mode(&self) -> &'static str {
        "production"
    }

    fn authorization_url(&self, redirect_uri: &str, state: &str) -> anyhow::Result<String> {
        let scope = REQUIRED_SCOPES.join(",");
        let url = Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("client_id", self.app_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", scope.as_str()),
                ("response_type", "code"),
                ("state", state),
            ],
        )?;
        Ok(url.into())
    }

    async fn link_account(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<LinkedAccount, ProviderError> {
        let short_lived = self.exchange_code(code, redirect_uri).await?;
        let long_lived = self.long_lived_token(&short_lived).await?;
        let expires_in = long_lived.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);

        let pages: PageList = self
            .get_signed("me/accounts", &long_lived.access_token, &[])
            .await?;
        if pages.data.is_empty() {
            return Err(ProviderError::NoFacebookPage);
        }

        // First page with a linked business account wins
        let mut found = None;
        for page in &pages.data {
            match self
                .get_signed::<PageAccount>(
                    &page.id,
                    &page.access_token,
                    &[("fields", "instagram_business_account")],
                )
                .await
            {
                Ok(PageAccount {
                    instagram_business_account: Some(account),
                }) => {
                    found = Some((page, account.id));
                    break;
                }
                Ok(_) => debug!("page {} has no Instagram business account", page.id),
                Err(e) => warn!("skipping page {}: {}", page.id, e),
            }
        }
        let (page, ig_id) = found.ok_or(ProviderError::NoInstagramBusinessAccount)?;

        let info: AccountInfo = self
            .get_signed(
                &ig_id,
                &page.access_token,
                &[("fields", "id,username,name,profile_picture_url")],
            )
            .await?;

        let username = info
            .username
            .clone()
            .or_else(|| info.name.clone())
            .unwrap_or_default();
        info!("📸 Graph API resolved @{} via page {}", username, page.name);

        Ok(LinkedAccount {
            external_account_id: info.id,
            username,
            account_type: "BUSINESS".to_string(),
            access_token: page.access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
            scopes: required_scopes(),
            metadata: json!({
                "facebook_page_id": page.id,
                "facebook_page_name": page.name,
                "name": info.name,
                "profile_picture_url": info.profile_picture_url,
            }),
        })
    }

    async fn verify_account(
        &self,
        external_account_id: &str,
        access_token: &str,
    ) -> Result<(), ProviderError> {
        let _: AccountInfo = self
            .get_signed(external_account_id, access_token, &[("fields", "id,username")])
            .await?;
        Ok(())
    }

    async fn list_media(
        &self,
        external_account_id: &str,
        access_token: &str,
        limit: u32,
        after: Option<&str>,
    ) -> Result<MediaPage, ProviderError> {
        let limit = limit.to_string();
        let mut query = vec![("fields", MEDIA_FIELDS), ("limit", limit.as_str())];
        if let Some(cursor) = after {
            query.push(("after", cursor));
        }
        let page: MediaList = self
            .get_signed(&format!("{external_account_id}/media"), access_token, &query)
            .await?;
        Ok(MediaPage {
            data: page.data,
            paging: page.paging,
        })
    }

    async fn media_detail(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<MediaDetail, ProviderError> {
        let fields = format!("{MEDIA_FIELDS},owner");
        let media: MediaItem = self
            .get_signed(media_id, access_token, &[("fields", fields.as_str())])
            .await?;

        // Comments are best effort; the post itself is what the caller asked for
        let comments = match self
            .get_signed::<CommentPage>(
                &format!("{media_id}/comments"),
                access_token,
                &[("fields", COMMENT_FIELDS), ("limit", COMMENT_PAGE_SIZE)],
            )
            .await
        {
            Ok(page) => page.data,
            Err(e) => {
                warn!("comments for media {} unavailable: {}", media_id, e);
                Vec::new()
            }
        };
        Ok(MediaDetail { media, comments })
    }

    async fn send_comment_reply(
        &self,
        external_account_id: &str,
        comment_id: &str,
        text: &str,
        access_token: &str,
    ) -> Result<Value, ProviderError> {
        let payload = json!({
            "recipient": { "comment_id": comment_id },
            "message": { "text": text },
        });
        self.post_signed(&format!("{external_account_id}/messages"), access_token, &payload)
            .await
    }
}

// ---- Mock ----

/// Development provider: no network, deterministic shapes, random ids
pub struct MockProvider;

fn short_hex(len: usize) -> String {
    uuid::Uuid::new_v4().simple().to_string()[..len].to_string()
}

fn check_mock_token(access_token: &str) -> Result<(), ProviderError> {
    if access_token.starts_with(MOCK_TOKEN_PREFIX) {
        Ok(())
    } else {
        Err(ProviderError::Graph("Invalid OAuth access token".to_string()))
    }
}

/// Posts are numbered 1..=MOCK_MEDIA_COUNT, newest first
fn mock_media(index: usize) -> MediaItem {
    let id = format!("{MOCK_MEDIA_PREFIX}{index}");
    MediaItem {
        caption: Some(format!("Mock post #{index}")),
        media_type: Some(if index % 3 == 0 { "VIDEO" } else { "IMAGE" }.to_string()),
        media_url: Some(format!("https://picsum.photos/seed/{id}/640/640")),
        thumbnail_url: None,
        permalink: Some(format!("https://www.instagram.com/p/{id}/")),
        timestamp: Some((Utc::now() - Duration::days(index as i64)).to_rfc3339()),
        like_count: Some((index * 7) as i64),
        comments_count: Some(3),
        media_product_type: Some("FEED".to_string()),
        id,
    }
}

fn mock_media_index(media_id: &str) -> Option<usize> {
    media_id
        .strip_prefix(MOCK_MEDIA_PREFIX)?
        .parse::<usize>()
        .ok()
        .filter(|i| (1..=MOCK_MEDIA_COUNT).contains(i))
}

#[async_trait]
impl InstagramProvider for MockProvider {
    fn mode(&self) -> &'static str {
        "mock"
    }

    /// Points straight back at the callback with a mock code
    fn authorization_url(&self, redirect_uri: &str, state: &str) -> anyhow::Result<String> {
        let code = format!("{MOCK_CODE_PREFIX}{}", crypto::random_token(16));
        let url = Url::parse_with_params(redirect_uri, &[("code", code.as_str()), ("state", state)])?;
        Ok(url.into())
    }

    async fn link_account(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<LinkedAccount, ProviderError> {
        if !code.starts_with(MOCK_CODE_PREFIX) {
            return Err(ProviderError::InvalidCode("Invalid mock code".to_string()));
        }

        Ok(LinkedAccount {
            external_account_id: format!("mock_ig_{}", short_hex(12)),
            username: format!("mock_user_{}", short_hex(8)),
            account_type: "BUSINESS".to_string(),
            access_token: format!("{MOCK_TOKEN_PREFIX}{}", crypto::random_token(32)),
            expires_at: Utc::now() + Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            scopes: required_scopes(),
            metadata: json!({ "mock": true }),
        })
    }

    async fn verify_account(
        &self,
        _external_account_id: &str,
        access_token: &str,
    ) -> Result<(), ProviderError> {
        check_mock_token(access_token)
    }

    /// `after` is the index of the last post already returned
    async fn list_media(
        &self,
        _external_account_id: &str,
        access_token: &str,
        limit: u32,
        after: Option<&str>,
    ) -> Result<MediaPage, ProviderError> {
        check_mock_token(access_token)?;
        let start = after.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + limit as usize).min(MOCK_MEDIA_COUNT);
        let data: Vec<MediaItem> = (start + 1..=end).map(mock_media).collect();

        let mut paging = json!({
            "cursors": { "before": start.to_string(), "after": end.to_string() }
        });
        if end < MOCK_MEDIA_COUNT {
            paging["next"] = json!(format!("mock://media?after={end}"));
        }
        Ok(MediaPage { data, paging })
    }

    async fn media_detail(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<MediaDetail, ProviderError> {
        check_mock_token(access_token)?;
        let index = mock_media_index(media_id)
            .ok_or_else(|| ProviderError::NotFound(format!("Media {media_id}")))?;

        let comments = (1..=3)
            .map(|n| MediaComment {
                id: format!("{media_id}_comment_{n}"),
                text: format!("Mock comment {n} on post #{index}"),
                username: format!("mock_fan_{n}"),
                timestamp: Some(Utc::now().to_rfc3339()),
                like_count: Some(n),
            })
            .collect();
        Ok(MediaDetail {
            media: mock_media(index),
            comments,
        })
    }

    async fn send_comment_reply(
        &self,
        external_account_id: &str,
        comment_id: &str,
        _text: &str,
        access_token: &str,
    ) -> Result<Value, ProviderError> {
        check_mock_token(access_token)?;
        debug!("mock DM from {} for comment {}", external_account_id, comment_id);
        Ok(json!({
            "recipient_id": format!("mock_recipient_{comment_id}"),
            "message_id": format!("mock_mid_{}", short_hex(16)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_authorization_url() {
        let provider = GraphApiProvider::new("123".to_string(), "shh".to_string()).unwrap();
        let url = provider
            .authorization_url("https://api.example.com/cb", "st&ate")
            .unwrap();
        let parsed = Url::parse(&url).unwrap();

        assert!(url.starts_with(AUTHORIZE_URL));
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "123");
        assert_eq!(pairs["redirect_uri"], "https://api.example.com/cb");
        assert_eq!(pairs["state"], "st&ate");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["scope"], REQUIRED_SCOPES.join(","));
    }

    #[test]
    fn test_mock_authorization_url_targets_callback() {
        let url = MockProvider
            .authorization_url("http://localhost:8000/cb", "abc")
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/cb");

        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert!(pairs["code"].starts_with(MOCK_CODE_PREFIX));
        assert_eq!(pairs["state"], "abc");
    }

    #[tokio::test]
    async fn test_mock_link_account() {
        let account = MockProvider
            .link_account("mock_code_xyz", "unused")
            .await
            .unwrap();
        assert!(account.external_account_id.starts_with("mock_ig_"));
        assert_eq!(account.external_account_id.len(), "mock_ig_".len() + 12);
        assert!(account.username.starts_with("mock_user_"));
        assert!(account.access_token.starts_with(MOCK_TOKEN_PREFIX));
        assert_eq!(account.account_type, "BUSINESS");
        assert_eq!(account.scopes.len(), REQUIRED_SCOPES.len());
        assert!(account.expires_at > Utc::now() + Duration::days(59));

        assert!(MockProvider
            .verify_account(&account.external_account_id, &account.access_token)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_mock_rejects_real_code() {
        let err = MockProvider.link_account("AQDx-real", "cb").await.unwrap_err();
        assert_eq!(err.code(), "OAUTH_AUTHORIZATION_FAILED");
    }

    #[tokio::test]
    async fn test_mock_media_pages() {
        let token = format!("{MOCK_TOKEN_PREFIX}abc");
        let first = MockProvider.list_media("acct", &token, 5, None).await.unwrap();
        assert_eq!(first.data.len(), 5);
        assert_eq!(first.data[0].id, "mock_media_1");
        assert_eq!(first.paging["cursors"]["after"], "5");
        assert!(first.paging.get("next").is_some());

        let last = MockProvider
            .list_media("acct", &token, 50, Some("10"))
            .await
            .unwrap();
        let ids: Vec<_> = last.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["mock_media_11", "mock_media_12"]);
        assert!(last.paging.get("next").is_none());

        let err = MockProvider.list_media("acct", "real", 5, None).await.unwrap_err();
        assert_eq!(err.code(), "FACEBOOK_API_ERROR");
    }

    #[tokio::test]
    async fn test_mock_media_detail() {
        let token = format!("{MOCK_TOKEN_PREFIX}abc");
        let detail = MockProvider.media_detail("mock_media_3", &token).await.unwrap();
        assert_eq!(detail.media.id, "mock_media_3");
        assert_eq!(detail.media.media_type.as_deref(), Some("VIDEO"));
        assert_eq!(detail.comments.len(), 3);

        for missing in ["mock_media_0", "mock_media_13", "17890000"] {
            let err = MockProvider.media_detail(missing, &token).await.unwrap_err();
            assert_eq!(err.code(), "NOT_FOUND");
        }
    }

    #[tokio::test]
    async fn test_mock_comment_reply() {
        let token = format!("{MOCK_TOKEN_PREFIX}abc");
        let resp = MockProvider
            .send_comment_reply("acct", "c1", "hi", &token)
            .await
            .unwrap();
        assert_eq!(resp["recipient_id"], "mock_recipient_c1");
        assert!(resp["message_id"].as_str().unwrap().starts_with("mock_mid_"));

        assert!(MockProvider
            .send_comment_reply("acct", "c1", "hi", "expired")
            .await
            .is_err());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ProviderError::NoFacebookPage.code(), "NO_FACEBOOK_PAGE");
        assert_eq!(
            ProviderError::NoInstagramBusinessAccount.code(),
            "NO_INSTAGRAM_BUSINESS_ACCOUNT"
        );
        assert_eq!(ProviderError::Graph("x".into()).code(), "FACEBOOK_API_ERROR");
    }
}
