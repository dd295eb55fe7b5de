//! Billing API Endpoints
//! Mission: Expose plan limits and monthly usage per workspace

use crate::app::AppState;
use crate::auth::middleware::AuthUser;
use crate::billing::{
    plans::{Plan, PlanLimits, UsageMetric},
    usage::{Period, UsageCounter, UsageReport},
};
use crate::error::{ApiError, ApiResult};
use crate::workspace::{member_access_or_forbidden, Workspace};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub workspace_id: Uuid,
    pub plan: Plan,
    pub plan_display: &'static str,
    pub limits: PlanLimits,
}

impl From<&Workspace> for PlanResponse {
    fn from(workspace: &Workspace) -> Self {
        Self {
            workspace_id: workspace.id,
            plan: workspace.plan,
            plan_display: workspace.plan.display_name(),
            limits: workspace.plan.limits(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdatePlanRequest {
    pub plan: String,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub year: Option<i32>,
    pub month: Option<u32>,
}

impl UsageQuery {
    fn period(&self) -> ApiResult<Option<Period>> {
        match (self.year, self.month) {
            (None, None) => Ok(None),
            (Some(year), Some(month)) => {
                if !(1..=12).contains(&month) {
                    return Err(ApiError::validation("month must be between 1 and 12"));
                }
                if !(2000..=9999).contains(&year) {
                    return Err(ApiError::validation("year is out of range"));
                }
                Ok(Some(Period { year, month }))
            }
            _ => Err(ApiError::validation(
                "year and month must be given together",
            )),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct TestIncrementRequest {
    pub metric: UsageMetric,
    pub amount: i64,
}

impl TestIncrementRequest {
    /// Parse the raw body so every malformed field answers with the JSON
    /// error envelope. `amount` defaults to 1 and must be an integer.
    pub fn parse(body: &[u8]) -> ApiResult<Self> {
        let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(body)
                .map_err(|e| ApiError::validation(format!("Invalid JSON body: {e}")))?
        };
        if !value.is_object() {
            return Err(ApiError::validation("Request body must be a JSON object"));
        }

        let metric = value["metric"]
            .as_str()
            .unwrap_or_default()
            .parse::<UsageMetric>()
            .map_err(|_| ApiError::validation("Invalid metric"))?;

        let amount = match &value["amount"] {
            Value::Null => 1,
            raw => raw
                .as_i64()
                .ok_or_else(|| ApiError::validation("amount: A valid integer is required."))?,
        };

        Ok(Self { metric, amount })
    }
}

#[derive(Debug, Serialize)]
pub struct TestIncrementResponse {
    pub success: bool,
    pub message: String,
    pub usage: UsageReport,
}

/// GET /api/v1/billing/workspaces/:workspace_id/plan
pub async fn get_plan(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<PlanResponse>> {
    let access = member_access_or_forbidden(&state.workspaces, workspace_id, user.id).await?;
    Ok(Json(PlanResponse::from(&access.workspace)))
}

/// PATCH /api/v1/billing/workspaces/:workspace_id/plan
pub async fn update_plan(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
    Json(payload): Json<UpdatePlanRequest>,
) -> ApiResult<Json<PlanResponse>> {
    let access = member_access_or_forbidden(&state.workspaces, workspace_id, user.id).await?;
    access.require_owner()?;

    let plan: Plan = payload.plan.parse().map_err(ApiError::Validation)?;
    let workspace = state
        .workspaces
        .set_plan(workspace_id, plan)
        .await?
        .ok_or_else(|| ApiError::not_found("Workspace not found"))?;

    info!(
        "💳 Plan change for {}: {} -> {}",
        workspace_id, access.workspace.plan, plan
    );
    Ok(Json(PlanResponse::from(&workspace)))
}

/// GET /api/v1/billing/workspaces/:workspace_id/usage?year=&month=
pub async fn get_usage(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<UsageReport>> {
    let period = query.period()?;
    member_access_or_forbidden(&state.workspaces, workspace_id, user.id).await?;
    Ok(Json(state.usage.get_usage(workspace_id, period).await?))
}

/// GET /api/v1/billing/workspaces/:workspace_id/usage/history
pub async fn usage_history(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<Vec<UsageCounter>>> {
    member_access_or_forbidden(&state.workspaces, workspace_id, user.id).await?;
    Ok(Json(state.usage.history(workspace_id).await?))
}

/// POST /api/v1/billing/workspaces/:workspace_id/test-increment
pub async fn test_increment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<TestIncrementResponse>> {
    member_access_or_forbidden(&state.workspaces, workspace_id, user.id).await?;

    let TestIncrementRequest { metric, amount } = TestIncrementRequest::parse(&body)?;

    state
        .usage
        .check_and_increment(workspace_id, metric, amount)
        .await?;
    let usage = state.usage.get_usage(workspace_id, None).await?;

    Ok(Json(TestIncrementResponse {
        success: true,
        message: format!("Incremented {metric} by {amount}"),
        usage,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_query_validation() {
        let none = UsageQuery { year: None, month: None };
        assert!(none.period().unwrap().is_none());

        let ok = UsageQuery { year: Some(2024), month: Some(2) };
        assert_eq!(ok.period().unwrap(), Some(Period { year: 2024, month: 2 }));

        let bad_month = UsageQuery { year: Some(2024), month: Some(13) };
        assert!(bad_month.period().is_err());

        let half = UsageQuery { year: Some(2024), month: None };
        assert!(half.period().is_err());
    }

    #[test]
    fn test_increment_body_parsing() {
        assert_eq!(
            TestIncrementRequest::parse(br#"{"metric":"dm_sent"}"#).unwrap(),
            TestIncrementRequest { metric: UsageMetric::DmSent, amount: 1 }
        );
        assert_eq!(
            TestIncrementRequest::parse(br#"{"metric":"comments_collected","amount":5}"#)
                .unwrap()
                .amount,
            5
        );

        for bad in [
            &br#"{"metric":"dm_sent","amount":1.5}"#[..],
            br#"{"metric":"dm_sent","amount":"3"}"#,
            br#"{"metric":"likes"}"#,
            br#"[1,2]"#,
            br#"{not json"#,
            b"",
        ] {
            let err = TestIncrementRequest::parse(bad).unwrap_err();
            assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        }
    }
}
