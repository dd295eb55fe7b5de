//! Monthly usage counters and limit enforcement.
//!
//! One row per (workspace, year, month), created lazily. Enforcement happens
//! in a single conditional UPDATE so a bounded metric can never overshoot
//! its limit, whatever the interleaving of callers.

use crate::billing::plans::{Plan, PlanLimits, UsageMetric};
use crate::db::{self, Database};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Datelike, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("Plan limit exceeded for {metric}. Current: {current}, Limit: {limit}, Plan: {plan}")]
    LimitExceeded {
        metric: UsageMetric,
        limit: i64,
        current: i64,
        plan: Plan,
    },

    #[error("amount must be a positive integer, got {0}")]
    InvalidAmount(i64),

    #[error("Adding {amount} to {metric} would overflow the counter (current: {current})")]
    Overflow {
        metric: UsageMetric,
        current: i64,
        amount: i64,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for UsageError {
    fn from(err: rusqlite::Error) -> Self {
        UsageError::Storage(err.into())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageCounter {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub year: i32,
    pub month: u32,
    pub comments_collected: i64,
    pub dm_sent: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageCounter {
    pub fn value(&self, metric: UsageMetric) -> i64 {
        match metric {
            UsageMetric::CommentsCollected => self.comments_collected,
            UsageMetric::DmSent => self.dm_sent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn current() -> Self {
        let now = Utc::now();
        Self {
            year: now.year(),
            month: now.month(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricValues {
    pub comments_collected: i64,
    pub dm_sent: i64,
}

/// Usage snapshot for one workspace and period.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub period: Period,
    pub plan: Plan,
    pub usage: MetricValues,
    pub limits: PlanLimits,
    pub remaining: MetricValues,
}

impl UsageReport {
    fn build(period: Period, plan: Plan, comments_collected: i64, dm_sent: i64) -> Self {
        let limits = plan.limits();
        Self {
            period,
            plan,
            usage: MetricValues {
                comments_collected,
                dm_sent,
            },
            limits,
            remaining: MetricValues {
                comments_collected: limits
                    .remaining(UsageMetric::CommentsCollected, comments_collected),
                dm_sent: limits.remaining(UsageMetric::DmSent, dm_sent),
            },
        }
    }
}

const COUNTER_COLUMNS: &str =
    "id, workspace_id, year, month, comments_collected, dm_sent, created_at, updated_at";

fn map_counter(row: &Row<'_>) -> rusqlite::Result<UsageCounter> {
    Ok(UsageCounter {
        id: db::uuid_col(row, 0)?,
        workspace_id: db::uuid_col(row, 1)?,
        year: row.get(2)?,
        month: row.get(3)?,
        comments_collected: row.get(4)?,
        dm_sent: row.get(5)?,
        created_at: db::ts_col(row, 6)?,
        updated_at: db::ts_col(row, 7)?,
    })
}

fn workspace_plan(conn: &Connection, workspace_id: Uuid) -> anyhow::Result<Plan> {
    let plan: Option<String> = conn
        .query_row(
            "SELECT plan FROM workspaces WHERE id = ?1",
            params![workspace_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to load workspace plan")?;
    plan.map(|p| Plan::from_stored(&p))
        .ok_or_else(|| anyhow!("workspace {workspace_id} not found"))
}

fn find_counter(
    conn: &Connection,
    workspace_id: Uuid,
    period: Period,
) -> anyhow::Result<Option<UsageCounter>> {
    let sql = format!(
        "SELECT {COUNTER_COLUMNS} FROM usage_counters
         WHERE workspace_id = ?1 AND year = ?2 AND month = ?3"
    );
    conn.query_row(
        &sql,
        params![workspace_id.to_string(), period.year, period.month],
        map_counter,
    )
    .optional()
    .context("Failed to load usage counter")
}

fn get_or_create(
    conn: &Connection,
    workspace_id: Uuid,
    period: Period,
) -> anyhow::Result<UsageCounter> {
    let now = db::now_ts();
    let created = conn
        .execute(
            "INSERT OR IGNORE INTO usage_counters
                (id, workspace_id, year, month, comments_collected, dm_sent, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?5)",
            params![
                Uuid::new_v4().to_string(),
                workspace_id.to_string(),
                period.year,
                period.month,
                now
            ],
        )
        .context("Failed to create usage counter")?;
    if created > 0 {
        debug!(%workspace_id, year = period.year, month = period.month, "usage counter created");
    }
    find_counter(conn, workspace_id, period)?
        .ok_or_else(|| anyhow!("usage counter vanished for workspace {workspace_id}"))
}

/// SQLite silently promotes an overflowing integer sum to REAL, so the
/// addition is checked before it reaches the UPDATE.
fn ensure_representable(metric: UsageMetric, current: i64, amount: i64) -> Result<(), UsageError> {
    match PlanLimits::next_value(current, amount) {
        Some(_) => Ok(()),
        None => Err(UsageError::Overflow {
            metric,
            current,
            amount,
        }),
    }
}

/// Usage accounting over the shared database.
#[derive(Clone)]
pub struct UsageTracker {
    db: Database,
}

impl UsageTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Counter for the current UTC month, created on first access.
    pub async fn current_period(&self, workspace_id: Uuid) -> Result<UsageCounter, UsageError> {
        let conn = self.db.lock().await;
        Ok(get_or_create(&conn, workspace_id, Period::current())?)
    }

    /// Would `amount` more units fit under the plan limit? Read-only.
    pub async fn check_limit(
        &self,
        workspace_id: Uuid,
        metric: UsageMetric,
        amount: i64,
    ) -> Result<bool, UsageError> {
        let conn = self.db.lock().await;
        let plan = workspace_plan(&conn, workspace_id)?;
        let current = find_counter(&conn, workspace_id, Period::current())?
            .map(|c| c.value(metric))
            .unwrap_or(0);
        Ok(plan.limits().allows(metric, current, amount))
    }

    /// Atomically add `amount` to the metric if the plan limit allows it.
    /// On rejection the counter is left untouched.
    pub async fn check_and_increment(
        &self,
        workspace_id: Uuid,
        metric: UsageMetric,
        amount: i64,
    ) -> Result<UsageCounter, UsageError> {
        if amount < 1 {
            return Err(UsageError::InvalidAmount(amount));
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let plan = workspace_plan(&tx, workspace_id)?;
        let limit = plan.limits().limit(metric);
        let counter = get_or_create(&tx, workspace_id, Period::current())?;
        ensure_representable(metric, counter.value(metric), amount)?;

        let column = metric.column();
        let sql = format!(
            "UPDATE usage_counters
             SET {column} = {column} + ?1, updated_at = ?2
             WHERE id = ?3 AND (?4 < 0 OR {column} + ?1 <= ?4)"
        );
        let updated = tx.execute(
            &sql,
            params![amount, db::now_ts(), counter.id.to_string(), limit],
        )?;

        if updated == 0 {
            let current = counter.value(metric);
            warn!(
                %workspace_id,
                metric = metric.as_str(),
                current,
                limit,
                plan = plan.as_str(),
                "plan limit exceeded"
            );
            return Err(UsageError::LimitExceeded {
                metric,
                limit,
                current,
                plan,
            });
        }

        let counter = find_counter(&tx, workspace_id, Period::current())?
            .ok_or_else(|| anyhow!("usage counter vanished for workspace {workspace_id}"))?;
        tx.commit()?;
        Ok(counter)
    }

    /// Add to a metric without consulting the plan.
    pub async fn increment_usage(
        &self,
        workspace_id: Uuid,
        metric: UsageMetric,
        amount: i64,
    ) -> Result<UsageCounter, UsageError> {
        if amount < 1 {
            return Err(UsageError::InvalidAmount(amount));
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let counter = get_or_create(&tx, workspace_id, Period::current())?;
        ensure_representable(metric, counter.value(metric), amount)?;
        let column = metric.column();
        let sql = format!(
            "UPDATE usage_counters SET {column} = {column} + ?1, updated_at = ?2 WHERE id = ?3"
        );
        tx.execute(&sql, params![amount, db::now_ts(), counter.id.to_string()])?;
        let counter = find_counter(&tx, workspace_id, Period::current())?
            .ok_or_else(|| anyhow!("usage counter vanished for workspace {workspace_id}"))?;
        tx.commit()?;
        Ok(counter)
    }

    /// Usage report for a period, defaulting to the current month.
    /// Past or future periods without a row read as zero and are not created.
    pub async fn get_usage(
        &self,
        workspace_id: Uuid,
        period: Option<Period>,
    ) -> Result<UsageReport, UsageError> {
        let conn = self.db.lock().await;
        let plan = workspace_plan(&conn, workspace_id)?;
        let current = Period::current();
        let period = period.unwrap_or(current);

        let counter = if period == current {
            Some(get_or_create(&conn, workspace_id, period)?)
        } else {
            find_counter(&conn, workspace_id, period)?
        };

        let (comments, dms) = counter
            .map(|c| (c.comments_collected, c.dm_sent))
            .unwrap_or((0, 0));
        Ok(UsageReport::build(period, plan, comments, dms))
    }

    /// All counters of a workspace, newest period first.
    pub async fn history(&self, workspace_id: Uuid) -> Result<Vec<UsageCounter>, UsageError> {
        let conn = self.db.lock().await;
        let sql = format!(
            "SELECT {COUNTER_COLUMNS} FROM usage_counters
             WHERE workspace_id = ?1 ORDER BY year DESC, month DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let counters = stmt
            .query_map(params![workspace_id.to_string()], map_counter)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(plan: &str) -> (UsageTracker, Database, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let user_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        {
            let conn = db.lock().await;
            let now = db::now_ts();
            conn.execute(
                "INSERT INTO users (id, email, password_hash, date_joined) VALUES (?1, 'o@example.com', 'x', ?2)",
                params![user_id.to_string(), now],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO workspaces (id, name, slug, owner_id, plan, created_at, updated_at)
                 VALUES (?1, 'Acme', 'acme', ?2, ?3, ?4, ?4)",
                params![workspace_id.to_string(), user_id.to_string(), plan, now],
            )
            .unwrap();
        }
        (UsageTracker::new(db.clone()), db, workspace_id)
    }

    #[tokio::test]
    async fn test_current_period_is_created_once() {
        let (tracker, _db, ws) = setup("starter").await;
        let first = tracker.current_period(ws).await.unwrap();
        let second = tracker.current_period(ws).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.dm_sent, 0);
        assert_eq!(tracker.history(ws).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_check_and_increment_stops_at_limit() {
        let (tracker, _db, ws) = setup("starter").await;

        let counter = tracker
            .check_and_increment(ws, UsageMetric::DmSent, 99)
            .await
            .unwrap();
        assert_eq!(counter.dm_sent, 99);

        let counter = tracker
            .check_and_increment(ws, UsageMetric::DmSent, 1)
            .await
            .unwrap();
        assert_eq!(counter.dm_sent, 100);

        let err = tracker
            .check_and_increment(ws, UsageMetric::DmSent, 1)
            .await
            .unwrap_err();
        match err {
            UsageError::LimitExceeded {
                metric,
                limit,
                current,
                plan,
            } => {
                assert_eq!(metric, UsageMetric::DmSent);
                assert_eq!(limit, 100);
                assert_eq!(current, 100);
                assert_eq!(plan, Plan::Starter);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let counter = tracker.current_period(ws).await.unwrap();
        assert_eq!(counter.dm_sent, 100);
    }

    #[tokio::test]
    async fn test_rejected_increment_leaves_counter_untouched() {
        let (tracker, _db, ws) = setup("starter").await;
        tracker
            .check_and_increment(ws, UsageMetric::CommentsCollected, 900)
            .await
            .unwrap();

        assert!(tracker
            .check_and_increment(ws, UsageMetric::CommentsCollected, 101)
            .await
            .is_err());
        let counter = tracker.current_period(ws).await.unwrap();
        assert_eq!(counter.comments_collected, 900);
    }

    #[tokio::test]
    async fn test_unlimited_plan_bypasses_check() {
        let (tracker, _db, ws) = setup("enterprise").await;
        let counter = tracker
            .check_and_increment(ws, UsageMetric::DmSent, 1_000_000)
            .await
            .unwrap();
        assert_eq!(counter.dm_sent, 1_000_000);

        let report = tracker.get_usage(ws, None).await.unwrap();
        assert_eq!(report.remaining.dm_sent, -1);
    }

    #[tokio::test]
    async fn test_unlimited_counter_at_ceiling_rejects_cleanly() {
        let (tracker, _db, ws) = setup("enterprise").await;
        let counter = tracker
            .check_and_increment(ws, UsageMetric::DmSent, i64::MAX)
            .await
            .unwrap();
        assert_eq!(counter.dm_sent, i64::MAX);

        assert!(matches!(
            tracker.check_and_increment(ws, UsageMetric::DmSent, 1).await,
            Err(UsageError::Overflow { current: i64::MAX, amount: 1, .. })
        ));
        assert!(matches!(
            tracker.increment_usage(ws, UsageMetric::DmSent, 1).await,
            Err(UsageError::Overflow { .. })
        ));
        assert!(!tracker.check_limit(ws, UsageMetric::DmSent, 1).await.unwrap());

        let counter = tracker.current_period(ws).await.unwrap();
        assert_eq!(counter.dm_sent, i64::MAX);
        assert_eq!(tracker.get_usage(ws, None).await.unwrap().usage.dm_sent, i64::MAX);
    }

    #[tokio::test]
    async fn test_unknown_stored_plan_uses_starter_limits() {
        let (tracker, _db, ws) = setup("legacy-gold").await;
        assert!(tracker.check_limit(ws, UsageMetric::DmSent, 100).await.unwrap());
        assert!(!tracker.check_limit(ws, UsageMetric::DmSent, 101).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let (tracker, _db, ws) = setup("starter").await;
        assert!(matches!(
            tracker.check_and_increment(ws, UsageMetric::DmSent, 0).await,
            Err(UsageError::InvalidAmount(0))
        ));
        assert!(matches!(
            tracker.increment_usage(ws, UsageMetric::DmSent, -5).await,
            Err(UsageError::InvalidAmount(-5))
        ));
    }

    #[tokio::test]
    async fn test_increment_usage_ignores_limit() {
        let (tracker, _db, ws) = setup("starter").await;
        let counter = tracker
            .increment_usage(ws, UsageMetric::DmSent, 150)
            .await
            .unwrap();
        assert_eq!(counter.dm_sent, 150);

        let report = tracker.get_usage(ws, None).await.unwrap();
        assert_eq!(report.remaining.dm_sent, 0);
        assert!(!tracker.check_limit(ws, UsageMetric::DmSent, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_historical_period_reads_zero_without_insert() {
        let (tracker, _db, ws) = setup("pro").await;
        let report = tracker
            .get_usage(ws, Some(Period { year: 2001, month: 3 }))
            .await
            .unwrap();
        assert_eq!(report.usage.comments_collected, 0);
        assert_eq!(report.remaining.comments_collected, 10_000);
        assert_eq!(report.plan, Plan::Pro);
        assert!(tracker.history(ws).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_orders_newest_first() {
        let (tracker, db, ws) = setup("starter").await;
        {
            let conn = db.lock().await;
            for (year, month) in [(2023, 11), (2024, 2), (2023, 12)] {
                conn.execute(
                    "INSERT INTO usage_counters (id, workspace_id, year, month, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![Uuid::new_v4().to_string(), ws.to_string(), year, month, db::now_ts()],
                )
                .unwrap();
            }
        }
        let periods: Vec<(i32, u32)> = tracker
            .history(ws)
            .await
            .unwrap()
            .iter()
            .map(|c| (c.year, c.month))
            .collect();
        assert_eq!(periods, vec![(2024, 2), (2023, 12), (2023, 11)]);
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_overshoot() {
        let (tracker, _db, ws) = setup("starter").await;
        let mut handles = Vec::new();
        for _ in 0..150 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.check_and_increment(ws, UsageMetric::DmSent, 1).await.is_ok()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 100);
        assert_eq!(tracker.current_period(ws).await.unwrap().dm_sent, 100);
    }
}
