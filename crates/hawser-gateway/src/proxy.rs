use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use hawser_proto::{META_METHOD, META_PATH, META_STATUS, Meta, meta_first, meta_insert};
use hawser_tunnel::{ProxyResponse, RoutedRequest, TunnelRouter};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use crate::auth::{TOKEN_TYPE, parse_authorization_header};
use crate::authorizer::{Authorization, AuthorizeError, Authorizer};
use crate::cache::CacheWithErr;
use crate::limiter::RequestLimiter;
use crate::middleware::{RequestId, request_id};
use crate::status::{ErrResp, grpc_to_http, write_error_response};

/// Marks a 401 as coming from the broker itself rather than from the
/// proxied cluster.
const UNAUTHORIZED_MARKER: &str = "gitlab-unauthorized";

const ALLOWED_METHODS: &str = "GET, HEAD, POST, PUT, DELETE, CONNECT, OPTIONS, TRACE, PATCH";
const PREFLIGHT_MAX_AGE: &str = "86400";

/// Hop-by-hop headers never forwarded to the agent.
const HOP_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Gateway credentials and in-band routing headers, stripped before
/// forwarding.
const AUTH_HEADERS: [HeaderName; 2] = [header::AUTHORIZATION, header::COOKIE];
const AGENT_ID_HEADER: &str = "hawser-agent-id";
const CSRF_TOKEN_HEADER: &str = "x-csrf-token";
const AUTH_QUERY_PARAM: &str = "authorization";

/// Routing seam so handler tests can script the tunnel side.
#[async_trait]
pub trait ProxyRouter: Send + Sync + 'static {
    async fn route(&self, request: RoutedRequest) -> Result<ProxyResponse, Status>;
}

#[async_trait]
impl ProxyRouter for TunnelRouter {
    async fn route(&self, request: RoutedRequest) -> Result<ProxyResponse, Status> {
        TunnelRouter::route(self, request).await
    }
}

pub struct GatewayConfig {
    /// Always normalized to end with `/`.
    pub url_path_prefix: String,
    pub allowed_origins: Vec<String>,
    pub server_name: String,
    pub auth_cache_ttl: Duration,
    pub auth_cache_err_ttl: Duration,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ProxyUserKey {
    agent_id: i64,
    access_type: &'static str,
    access_key: String,
}

struct GatewayInner {
    router: Arc<dyn ProxyRouter>,
    authorizer: Arc<dyn Authorizer>,
    limiter: Option<Arc<dyn RequestLimiter>>,
    auth_cache: CacheWithErr<ProxyUserKey, Authorization>,
    allowed_origins: Vec<String>,
    url_path_prefix: String,
    via: String,
}

#[derive(Clone)]
pub struct GatewayState {
    inner: Arc<GatewayInner>,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        router: Arc<dyn ProxyRouter>,
        authorizer: Arc<dyn Authorizer>,
        limiter: Option<Arc<dyn RequestLimiter>>,
    ) -> Self {
        let mut prefix = config.url_path_prefix;
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            inner: Arc::new(GatewayInner {
                router,
                authorizer,
                limiter,
                auth_cache: CacheWithErr::new(config.auth_cache_ttl, config.auth_cache_err_ttl),
                allowed_origins: config.allowed_origins,
                url_path_prefix: prefix,
                via: format!("gRPC/1.0 {}", config.server_name),
            }),
        }
    }

    /// Drops expired authorization cache entries; driven by the server's
    /// housekeeping ticker.
    pub fn evict_expired_auth(&self) {
        self.inner.auth_cache.evict_expired();
    }
}

/// Every path is proxied, so the handler hangs off the fallback.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .fallback(proxy)
        .layer(axum::middleware::from_fn(request_id))
        .with_state(state)
}

struct ProxyError {
    resp: ErrResp,
    gateway_unauthorized: bool,
}

impl ProxyError {
    fn new(status_code: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            resp: ErrResp::new(status_code, msg),
            gateway_unauthorized: false,
        }
    }

    fn unauthorized(err: impl ToString) -> Self {
        Self {
            resp: ErrResp::with_err(StatusCode::UNAUTHORIZED, "Unauthorized", err),
            gateway_unauthorized: true,
        }
    }

    fn from_status(status: Status) -> Self {
        Self {
            resp: ErrResp::with_err(
                grpc_to_http(status.code()),
                "Failed to proxy request",
                status.message(),
            ),
            gateway_unauthorized: false,
        }
    }
}

async fn proxy(State(state): State<GatewayState>, req: Request<Body>) -> Response {
    let trace_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    state.inner.handle(req, &trace_id).await
}

impl GatewayInner {
    async fn handle(&self, req: Request<Body>, trace_id: &str) -> Response {
        let mut cors_headers = HeaderMap::new();
        if let Some(origin) = req.headers().get(header::ORIGIN) {
            let allowed = origin
                .to_str()
                .is_ok_and(|o| self.allowed_origins.iter().any(|a| a == o));
            if !allowed {
                tracing::debug!(origin = ?origin, "request origin is not in the allowed origins");
                return StatusCode::FORBIDDEN.into_response();
            }
            cors_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            cors_headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
            cors_headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }

        if req.method() == Method::OPTIONS {
            return preflight_response(&cors_headers, req.headers());
        }

        let accept = req
            .headers()
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match self.proxy_request(req, &cors_headers).await {
            Ok(response) => response,
            Err(err) => {
                let mut extra = cors_headers;
                if err.gateway_unauthorized {
                    extra.insert(
                        HeaderName::from_static(UNAUTHORIZED_MARKER),
                        HeaderValue::from_static("true"),
                    );
                }
                write_error_response(accept.as_deref(), trace_id, &extra, err.resp)
            }
        }
    }

    async fn proxy_request(
        &self,
        req: Request<Body>,
        cors_headers: &HeaderMap,
    ) -> Result<Response, ProxyError> {
        let (parts, body) = req.into_parts();

        if !parts.uri.path().starts_with(&self.url_path_prefix) {
            tracing::debug!(path = parts.uri.path(), prefix = %self.url_path_prefix, "path prefix mismatch");
            return Err(ProxyError::new(
                StatusCode::BAD_REQUEST,
                "Bad request: URL does not start with expected prefix",
            ));
        }

        let auth_value = match parts.headers.get(header::AUTHORIZATION) {
            Some(value) => value
                .to_str()
                .map_err(|_| ProxyError::unauthorized("authorization header is not ASCII"))?,
            None => return Err(ProxyError::unauthorized("no valid credentials provided")),
        };
        let parsed = parse_authorization_header(auth_value).map_err(ProxyError::unauthorized)?;
        let agent_id = parsed.agent_id;

        let auth = self.authorize(agent_id, parsed.access_key.clone()).await?;
        if let Some(limiter) = &self.limiter {
            if !limiter.allow(&parsed.access_key).await {
                tracing::debug!(agent_id, "request rejected by the rate limiter");
                return Err(ProxyError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too many requests",
                ));
            }
        }
        let extra = auth.impersonation_extra();

        let meta = self.request_meta(&parts.method, &parts.uri, &parts.headers);
        let body = body
            .into_data_stream()
            .map_err(|e| Status::unavailable(format!("failed to read request body: {e}")));
        let routed = RoutedRequest {
            agent_id,
            method: hawser_proto::KUBERNETES_PROXY_FULL_METHOD.to_string(),
            meta,
            extra,
            body: Box::pin(body),
        };
        let upstream = self
            .router
            .route(routed)
            .await
            .map_err(ProxyError::from_status)?;
        self.upstream_response(cors_headers, upstream)
    }

    async fn authorize(
        &self,
        agent_id: i64,
        access_key: String,
    ) -> Result<Authorization, ProxyError> {
        let key = ProxyUserKey {
            agent_id,
            access_type: TOKEN_TYPE,
            access_key: access_key.clone(),
        };
        let authorizer = self.authorizer.clone();
        self.auth_cache
            .get_or_fetch(key, || async move {
                authorizer
                    .authorize_proxy_user(agent_id, TOKEN_TYPE, &access_key)
                    .await
            })
            .await
            .map_err(|err| match err {
                AuthorizeError::Denied { .. } => {
                    tracing::debug!(agent_id, error = %err, "authorize proxy user denied");
                    ProxyError::unauthorized(err)
                }
                AuthorizeError::Unavailable(_) => {
                    tracing::error!(agent_id, error = %err, "failed to authorize user");
                    ProxyError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to authorize user")
                }
            })
    }

    /// Builds the request metadata forwarded in the tunnel's request-info
    /// frame: `:method`/`:path` pseudo entries plus the scrubbed headers.
    fn request_meta(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> Meta {
        let mut meta = Meta::new();
        meta_insert(&mut meta, META_METHOD, method.as_str());

        // The prefix is normalized to end with '/'; keep that slash on the
        // forwarded path.
        let mut path = uri.path()[self.url_path_prefix.len() - 1..].to_string();
        if let Some(query) = uri.query() {
            let filtered: Vec<&str> = query
                .split('&')
                .filter(|pair| {
                    let key = pair.split('=').next().unwrap_or(pair);
                    key != AUTH_QUERY_PARAM
                })
                .collect();
            if !filtered.is_empty() {
                path.push('?');
                path.push_str(&filtered.join("&"));
            }
        }
        meta_insert(&mut meta, META_PATH, path);

        let mut cleaned = headers.clone();
        clean_request_headers(&mut cleaned);
        for (name, value) in &cleaned {
            if let Ok(value) = value.to_str() {
                meta_insert(&mut meta, name.as_str(), value);
            }
        }
        // Record this hop after any Via values the client sent.
        meta_insert(&mut meta, header::VIA.as_str(), &self.via);
        meta
    }

    fn upstream_response(
        &self,
        cors_headers: &HeaderMap,
        upstream: ProxyResponse,
    ) -> Result<Response, ProxyError> {
        let ProxyResponse { meta, body } = upstream;
        let status_code = meta_first(&meta, META_STATUS)
            .and_then(|s| s.parse::<u16>().ok())
            .and_then(|c| StatusCode::from_u16(c).ok())
            .ok_or_else(|| {
                ProxyError::new(
                    StatusCode::BAD_GATEWAY,
                    "agent response carried no usable status",
                )
            })?;

        let mut response = Response::new(Body::from_stream(ReceiverStream::new(body)));
        *response.status_mut() = status_code;
        let headers = response.headers_mut();
        // The gateway's own headers win; upstream CORS is dropped, Vary is
        // merged, and this hop is appended to Via.
        for (name, value) in cors_headers {
            headers.insert(name.clone(), value.clone());
        }
        for (name, values) in &meta {
            if name.starts_with(':') {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            if is_cors_header(&header_name) {
                continue;
            }
            if header_name == header::VARY {
                for value in &values.values {
                    if let Ok(value) = HeaderValue::from_str(value) {
                        headers.append(header::VARY, value);
                    }
                }
                continue;
            }
            if headers.contains_key(&header_name) {
                continue;
            }
            for value in &values.values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(header_name.clone(), value);
                }
            }
        }
        if let Ok(via) = HeaderValue::from_str(&self.via) {
            headers.append(header::VIA, via);
        }
        Ok(response)
    }
}

fn preflight_response(cors_headers: &HeaderMap, request_headers: &HeaderMap) -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    for (name, value) in cors_headers {
        headers.insert(name.clone(), value.clone());
    }
    if let Some(requested) = request_headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(PREFLIGHT_MAX_AGE),
    );
    response
}

fn clean_request_headers(headers: &mut HeaderMap) {
    // Hop-by-hop options named by the Connection header go first.
    let connection_listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in connection_listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(name);
    }
    for name in AUTH_HEADERS {
        headers.remove(name);
    }
    headers.remove(HeaderName::from_static(AGENT_ID_HEADER));
    headers.remove(HeaderName::from_static(CSRF_TOKEN_HEADER));
    // The agent rebuilds the request against its own cluster host.
    headers.remove(header::HOST);
}

fn is_cors_header(name: &HeaderName) -> bool {
    *name == header::ACCESS_CONTROL_ALLOW_ORIGIN
        || *name == header::ACCESS_CONTROL_ALLOW_HEADERS
        || *name == header::ACCESS_CONTROL_ALLOW_CREDENTIALS
        || *name == header::ACCESS_CONTROL_ALLOW_METHODS
        || *name == header::ACCESS_CONTROL_MAX_AGE
}
