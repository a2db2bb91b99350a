// Kubernetes-API-compatible HTTP front-end: authenticates callers, asks the
// external authorizer who they may act as, and forwards the request through
// the tunnel routing layer to the target agent's cluster.

mod auth;
mod authorizer;
mod cache;
mod limiter;
mod middleware;
mod proxy;
mod status;

pub use auth::{AuthError, ParsedToken, TOKEN_TYPE, parse_authorization_header};
pub use authorizer::{
    AccessAs, Authorization, AuthorizeError, Authorizer, HttpAuthorizer, UserAccess,
};
pub use cache::CacheWithErr;
pub use limiter::RequestLimiter;
pub use middleware::{RequestId, request_id};
pub use proxy::{GatewayConfig, GatewayState, ProxyRouter, router};
pub use status::{ErrResp, KubernetesStatus, format_status_message, grpc_to_http, reason_for_code};
