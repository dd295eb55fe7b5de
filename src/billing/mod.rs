//! Billing Module
//! Mission: Plan tiers and per-workspace monthly usage accounting

pub mod api;
pub mod plans;
pub mod usage;

pub use plans::{Plan, PlanLimits, UsageMetric, UNLIMITED};
pub use usage::{Period, UsageCounter, UsageError, UsageReport, UsageTracker};
