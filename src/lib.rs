//! InstaFlow Backend Library
//!
//! Multi-tenant Instagram automation backend: accounts, workspaces, plan
//! usage accounting, Instagram business account linking and comment-triggered
//! DM campaigns.

pub mod app;
pub mod auth;
pub mod automation;
pub mod billing;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod health;
pub mod integrations;
pub mod middleware;
pub mod workspace;

pub use app::{build_router, AppState};
pub use config::Config;
pub use db::Database;
pub use error::{ApiError, ApiResult};
