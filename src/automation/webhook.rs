//! Instagram webhook endpoint.
//!
//! GET answers Meta's subscription handshake; POST acknowledges deliveries
//! immediately and hands `comments` changes to the [`Dispatcher`] in the
//! background.
//!
//! [`Dispatcher`]: crate::automation::Dispatcher

use crate::app::AppState;
use crate::automation::models::CommentEvent;
use crate::crypto;
use crate::error::{ApiError, ApiResult};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const ACK: &str = "EVENT_RECEIVED";

#[derive(Debug, Deserialize)]
pub struct SubscriptionQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Comment events carried by an `instagram` webhook payload
pub fn comment_events(payload: &Value) -> Vec<CommentEvent> {
    let Some(entries) = payload["entry"].as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| entry["changes"].as_array())
        .flatten()
        .filter(|change| change["field"] == "comments")
        .filter_map(|change| CommentEvent::from_change_value(&change["value"]))
        .collect()
}

/// GET /api/v1/integrations/instagram/webhook (public)
pub async fn verify_subscription(
    State(state): State<AppState>,
    Query(query): Query<SubscriptionQuery>,
) -> ApiResult<String> {
    let expected = state.config.webhook_verify_token();
    let accepted = query.mode.as_deref() == Some("subscribe")
        && expected.is_some()
        && query.verify_token.as_deref() == expected;
    if !accepted {
        warn!("❌ Webhook subscription rejected");
        return Err(ApiError::forbidden("Webhook verification failed"));
    }
    info!("🔔 Webhook subscription verified");
    Ok(query.challenge.unwrap_or_default())
}

/// POST /api/v1/integrations/instagram/webhook (public)
pub async fn receive_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<&'static str> {
    // Deliveries are signed with the app secret; unsigned ones are only
    // accepted when no secret is configured (mock mode)
    if !state.config.meta_app_secret.is_empty() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !crypto::verify_webhook_signature(&state.config.meta_app_secret, &body, signature) {
            warn!("❌ Webhook delivery with a bad signature");
            return Err(ApiError::forbidden("Invalid webhook signature"));
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::validation(format!("Invalid JSON body: {e}")))?;
    if payload["object"] != "instagram" {
        debug!("ignoring webhook object {}", payload["object"]);
        return Ok(ACK);
    }

    for event in comment_events(&payload) {
        let dispatcher = state.dispatcher.clone();
        tokio::spawn(async move {
            match dispatcher.handle_comment(&event).await {
                Ok(deliveries) if !deliveries.is_empty() => {
                    info!(
                        "💬 Comment {} on media {} handled by {} campaign(s)",
                        event.comment_id,
                        event.media_id,
                        deliveries.len()
                    );
                }
                Ok(_) => debug!("no active campaign for media {}", event.media_id),
                Err(e) => warn!("comment {} processing failed: {e:#}", event.comment_id),
            }
        });
    }
    Ok(ACK)
}
