//! Plan tiers and their static limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sentinel meaning "no limit" for any numeric plan limit.
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Pro,
    Enterprise,
}

impl Plan {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Plan::Starter => "Starter",
            Plan::Pro => "Pro",
            Plan::Enterprise => "Enterprise",
        }
    }

    /// Parse a stored plan value; anything unknown is treated as `starter`.
    #[must_use]
    pub fn from_stored(s: &str) -> Plan {
        s.parse().unwrap_or(Plan::Starter)
    }

    #[must_use]
    pub fn all() -> [Plan; 3] {
        [Plan::Starter, Plan::Pro, Plan::Enterprise]
    }

    #[must_use]
    pub fn limits(&self) -> PlanLimits {
        match self {
            Plan::Starter => PlanLimits {
                comments_collected_per_month: 1000,
                dm_sent_per_month: 100,
                workspaces: 1,
                team_members: 3,
                automations: 5,
            },
            Plan::Pro => PlanLimits {
                comments_collected_per_month: 10_000,
                dm_sent_per_month: 1000,
                workspaces: 5,
                team_members: 10,
                automations: 50,
            },
            Plan::Enterprise => PlanLimits {
                comments_collected_per_month: UNLIMITED,
                dm_sent_per_month: UNLIMITED,
                workspaces: UNLIMITED,
                team_members: UNLIMITED,
                automations: UNLIMITED,
            },
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "starter" => Ok(Plan::Starter),
            "pro" => Ok(Plan::Pro),
            "enterprise" => Ok(Plan::Enterprise),
            other => Err(format!("Unknown plan: {other}")),
        }
    }
}

/// Metered quantities tracked per workspace per month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMetric {
    CommentsCollected,
    DmSent,
}

impl UsageMetric {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageMetric::CommentsCollected => "comments_collected",
            UsageMetric::DmSent => "dm_sent",
        }
    }

    /// Column in `usage_counters`. Only ever one of two constants, so it is
    /// safe to splice into SQL.
    pub(crate) fn column(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UsageMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "comments_collected" => Ok(UsageMetric::CommentsCollected),
            "dm_sent" => Ok(UsageMetric::DmSent),
            other => Err(format!("Unknown metric: {other}")),
        }
    }
}

/// Numeric limits of a plan; `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub comments_collected_per_month: i64,
    pub dm_sent_per_month: i64,
    pub workspaces: i64,
    pub team_members: i64,
    pub automations: i64,
}

impl PlanLimits {
    pub fn limit(&self, metric: UsageMetric) -> i64 {
        match metric {
            UsageMetric::CommentsCollected => self.comments_collected_per_month,
            UsageMetric::DmSent => self.dm_sent_per_month,
        }
    }

    pub fn is_unlimited(&self, metric: UsageMetric) -> bool {
        self.limit(metric) < 0
    }

    /// Value after adding `amount`, `None` when the counter would overflow.
    pub fn next_value(current: i64, amount: i64) -> Option<i64> {
        current.checked_add(amount)
    }

    /// Whether `current + amount` is representable and within the limit.
    pub fn allows(&self, metric: UsageMetric, current: i64, amount: i64) -> bool {
        match Self::next_value(current, amount) {
            Some(next) => self.is_unlimited(metric) || next <= self.limit(metric),
            None => false,
        }
    }

    /// Headroom left for a metric, `-1` when unlimited.
    pub fn remaining(&self, metric: UsageMetric, current: i64) -> i64 {
        if self.is_unlimited(metric) {
            UNLIMITED
        } else {
            (self.limit(metric) - current).max(0)
        }
    }
}
