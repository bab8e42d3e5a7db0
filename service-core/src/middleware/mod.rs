pub mod rate_limit;
pub mod tracing;

pub use rate_limit::{
    IpRateLimiter, client_ip, create_ip_rate_limiter, forwarded_ip, ip_rate_limit_middleware,
};
pub use tracing::{REQUEST_ID_HEADER, RequestId, request_id_middleware};
