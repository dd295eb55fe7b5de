//! Authentication Module
//! Mission: Email/password accounts with JWT access and refresh tokens

pub mod api;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod user_store;

pub use jwt::JwtHandler;
pub use middleware::{auth_middleware, AuthUser};
pub use user_store::UserStore;
