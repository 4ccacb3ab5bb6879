//! Tower middleware for the gateway and the services.
//!
//! ```text
//! Request → Request ID → Rate Limiter → JWT Auth → Proxy → Response
//!                            ↓              ↓
//!                      429 + RateLimit-*     401
//! ```
//!
//! The services run only [`RequestIdLayer`]; they trust the `x-user-id`
//! header the gateway injects (see [`crate::extract::TrustedUser`]).

pub mod auth;
pub mod ip;
pub mod rate_limit;
pub mod request_id;

pub use auth::JwtAuthLayer;
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use rate_limit::RateLimitLayer;
pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer};
