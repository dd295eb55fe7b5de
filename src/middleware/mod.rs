//! Cross-cutting HTTP middleware.
//!
//! - Request ids (`X-Request-ID`)
//! - Request logging with latency tracking
//! - Rate limiting per client IP

pub mod logging;
pub mod rate_limit;
pub mod request_id;

pub use logging::request_logging;
pub use rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitLayer};
pub use request_id::{request_id_middleware, RequestId, REQUEST_ID_HEADER};
