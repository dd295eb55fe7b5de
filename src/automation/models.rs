//! Auto-DM Campaign Models
//! Mission: Comment-triggered DM campaigns and their delivery log

use crate::error::{ApiError, ApiResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_MAX_SENDS_PER_HOUR: i64 = 200;
pub const MAX_SENDS_PER_HOUR_CEILING: i64 = 500;
pub const DEFAULT_LOG_LIMIT: u32 = 100;
pub const MAX_LOG_LIMIT: u32 = 500;

const MAX_NAME_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Active,
    Paused,
    Completed,
    Inactive,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "inactive" => Ok(CampaignStatus::Inactive),
            other => Err(format!("\"{other}\" is not a valid campaign status")),
        }
    }
}

/// DM campaign attached to one post of a connected account
#[derive(Debug, Clone, Serialize)]
pub struct Campaign {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub ig_connection_id: Uuid,
    pub ig_username: String,
    pub media_id: String,
    pub media_url: Option<String>,
    pub name: String,
    pub description: String,
    pub message_template: String,
    pub status: CampaignStatus,
    pub max_sends_per_hour: i64,
    pub total_sent: i64,
    pub total_failed: i64,
    /// Non-skipped log rows of the trailing hour, computed at load time
    #[serde(skip_serializing)]
    pub sends_last_hour: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn is_active(&self) -> bool {
        self.status == CampaignStatus::Active
    }

    /// Active and still under the hourly send cap
    pub fn can_send_more(&self) -> bool {
        self.is_active() && self.sends_last_hour < self.max_sends_per_hour
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignResponse {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub is_active: bool,
    pub can_send: bool,
}

impl From<Campaign> for CampaignResponse {
    fn from(campaign: Campaign) -> Self {
        let is_active = campaign.is_active();
        let can_send = campaign.can_send_more();
        Self {
            campaign,
            is_active,
            can_send,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmStatus {
    Pending,
    Sent,
    Failed,
    Skipped,
}

impl DmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmStatus::Pending => "pending",
            DmStatus::Sent => "sent",
            DmStatus::Failed => "failed",
            DmStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for DmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DmStatus::Pending),
            "sent" => Ok(DmStatus::Sent),
            "failed" => Ok(DmStatus::Failed),
            "skipped" => Ok(DmStatus::Skipped),
            other => Err(format!("unknown DM status {other}")),
        }
    }
}

/// One delivery attempt, unique per (campaign, comment)
#[derive(Debug, Clone, Serialize)]
pub struct DmLog {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub campaign_name: String,
    pub comment_id: String,
    pub comment_text: String,
    pub recipient_user_id: String,
    pub recipient_username: String,
    pub message_sent: String,
    pub status: DmStatus,
    pub error_message: String,
    pub error_code: String,
    pub webhook_payload: Value,
    pub api_response: Value,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: i64,
    pub sent: i64,
    pub failed: i64,
    pub pending: i64,
    pub skipped: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub total_sent: i64,
    pub total_failed: i64,
    /// Percentage of attempted sends that succeeded, two decimals
    pub success_rate: f64,
    pub last_24h: StatusCounts,
    pub can_send_more: bool,
    pub status: CampaignStatus,
}

pub fn success_rate(sent: i64, failed: i64) -> f64 {
    let attempted = sent + failed;
    if attempted <= 0 {
        return 0.0;
    }
    let rate = sent as f64 / attempted as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

/// Comment notification taken from a webhook `comments` change
#[derive(Debug, Clone, PartialEq)]
pub struct CommentEvent {
    pub comment_id: String,
    pub text: String,
    pub from_id: String,
    pub from_username: String,
    pub media_id: String,
    pub payload: Value,
}

impl CommentEvent {
    /// `None` unless both the comment id and the media id are present
    pub fn from_change_value(value: &Value) -> Option<Self> {
        let text_of = |v: &Value| v.as_str().map(str::to_string);
        let comment_id = text_of(&value["id"]).filter(|s| !s.is_empty())?;
        let media_id = text_of(&value["media"]["id"]).filter(|s| !s.is_empty())?;
        Some(Self {
            comment_id,
            media_id,
            text: text_of(&value["text"]).unwrap_or_default(),
            from_id: text_of(&value["from"]["id"]).unwrap_or_default(),
            from_username: text_of(&value["from"]["username"]).unwrap_or_default(),
            payload: value.clone(),
        })
    }
}

/// Validated campaign fields, ready to persist
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignDraft {
    pub media_id: String,
    pub media_url: Option<String>,
    pub name: String,
    pub description: String,
    pub message_template: String,
    pub status: CampaignStatus,
    pub max_sends_per_hour: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub media_id: Option<String>,
    pub media_url: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub message_template: Option<String>,
    pub status: Option<String>,
    pub max_sends_per_hour: Option<i64>,
}

/// Body of PUT and PATCH; PUT requires the same fields as create
#[derive(Debug, Default, Deserialize)]
pub struct UpdateCampaignRequest {
    pub media_id: Option<String>,
    pub media_url: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub message_template: Option<String>,
    pub status: Option<String>,
    pub max_sends_per_hour: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CampaignCreateQuery {
    pub workspace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<String>,
}

fn required(field: &str, value: Option<&str>) -> ApiResult<String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        Some(_) => Err(ApiError::validation(format!("{field}: This field may not be blank."))),
        None => Err(ApiError::validation(format!("{field}: This field is required."))),
    }
}

fn check_name(name: String) -> ApiResult<String> {
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(ApiError::validation(format!(
            "name: Ensure this field has no more than {MAX_NAME_LENGTH} characters."
        )));
    }
    Ok(name)
}

fn check_rate(rate: i64) -> ApiResult<i64> {
    if !(1..=MAX_SENDS_PER_HOUR_CEILING).contains(&rate) {
        return Err(ApiError::validation(format!(
            "max_sends_per_hour: Must be between 1 and {MAX_SENDS_PER_HOUR_CEILING}."
        )));
    }
    Ok(rate)
}

/// Blank clears the URL; anything else must be an absolute http(s) URL
fn check_media_url(raw: Option<&str>) -> ApiResult<Option<String>> {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    match reqwest::Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Some(raw.to_string())),
        _ => Err(ApiError::validation("media_url: Enter a valid URL.")),
    }
}

fn check_status(raw: &str) -> ApiResult<CampaignStatus> {
    raw.trim()
        .parse::<CampaignStatus>()
        .map_err(|e| ApiError::validation(format!("status: {e}")))
}

impl CreateCampaignRequest {
    pub fn validate(&self) -> ApiResult<CampaignDraft> {
        Ok(CampaignDraft {
            media_id: required("media_id", self.media_id.as_deref())?,
            media_url: check_media_url(self.media_url.as_deref())?,
            name: check_name(required("name", self.name.as_deref())?)?,
            description: self.description.as_deref().unwrap_or("").trim().to_string(),
            message_template: required("message_template", self.message_template.as_deref())?,
            status: match self.status.as_deref() {
                Some(raw) => check_status(raw)?,
                None => CampaignStatus::Active,
            },
            max_sends_per_hour: check_rate(
                self.max_sends_per_hour.unwrap_or(DEFAULT_MAX_SENDS_PER_HOUR),
            )?,
        })
    }
}

impl UpdateCampaignRequest {
    /// Apply the present fields to `current`. With `partial == false` (PUT)
    /// every required field must be present.
    pub fn apply(&self, current: &Campaign, partial: bool) -> ApiResult<CampaignDraft> {
        if !partial {
            let full = CreateCampaignRequest {
                media_id: self.media_id.clone(),
                media_url: self.media_url.clone(),
                name: self.name.clone(),
                description: self.description.clone(),
                message_template: self.message_template.clone(),
                status: self
                    .status
                    .clone()
                    .or_else(|| Some(current.status.as_str().to_string())),
                max_sends_per_hour: self.max_sends_per_hour.or(Some(current.max_sends_per_hour)),
            };
            return full.validate();
        }

        Ok(CampaignDraft {
            media_id: match self.media_id.as_deref() {
                Some(raw) => required("media_id", Some(raw))?,
                None => current.media_id.clone(),
            },
            media_url: match self.media_url.as_deref() {
                Some(raw) => check_media_url(Some(raw))?,
                None => current.media_url.clone(),
            },
            name: match self.name.as_deref() {
                Some(raw) => check_name(required("name", Some(raw))?)?,
                None => current.name.clone(),
            },
            description: self
                .description
                .as_deref()
                .map(|d| d.trim().to_string())
                .unwrap_or_else(|| current.description.clone()),
            message_template: match self.message_template.as_deref() {
                Some(raw) => required("message_template", Some(raw))?,
                None => current.message_template.clone(),
            },
            status: match self.status.as_deref() {
                Some(raw) => check_status(raw)?,
                None => current.status,
            },
            max_sends_per_hour: check_rate(
                self.max_sends_per_hour.unwrap_or(current.max_sends_per_hour),
            )?,
        })
    }
}
