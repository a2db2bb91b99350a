use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Kubernetes `Status` v1 object, the error body every client of the
/// gateway understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesStatus {
    pub kind: String,
    pub api_version: String,
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    pub code: u16,
}

/// Failed request, not yet rendered. `err` is appended to the message when
/// present.
#[derive(Debug)]
pub struct ErrResp {
    pub status_code: StatusCode,
    pub msg: String,
    pub err: Option<String>,
}

impl ErrResp {
    pub fn new(status_code: StatusCode, msg: impl Into<String>) -> Self {
        Self { status_code, msg: msg.into(), err: None }
    }

    pub fn with_err(status_code: StatusCode, msg: impl Into<String>, err: impl ToString) -> Self {
        Self {
            status_code,
            msg: msg.into(),
            err: Some(err.to_string()),
        }
    }
}

/// HTTP code to Kubernetes status reason. Unknown codes render with an
/// empty reason, which clients read as `Unknown`.
pub fn reason_for_code(code: u16) -> &'static str {
    match code {
        400 => "BadRequest",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "NotFound",
        405 => "MethodNotAllowed",
        406 => "NotAcceptable",
        409 => "Conflict",
        410 => "Gone",
        413 => "RequestEntityTooLarge",
        415 => "UnsupportedMediaType",
        422 => "Invalid",
        429 => "TooManyRequests",
        500 => "InternalError",
        503 => "ServiceUnavailable",
        504 => "Timeout",
        _ => "",
    }
}

/// Maps a routing-layer gRPC status onto the HTTP code the client sees.
pub fn grpc_to_http(code: tonic::Code) -> StatusCode {
    match code {
        tonic::Code::InvalidArgument => StatusCode::BAD_REQUEST,
        tonic::Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        tonic::Code::PermissionDenied => StatusCode::FORBIDDEN,
        tonic::Code::NotFound => StatusCode::NOT_FOUND,
        tonic::Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        tonic::Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

pub fn format_status_message(msg: &str, err: Option<&str>, trace_id: &str) -> String {
    let mut out = String::from("Agent-server: ");
    out.push_str(msg);
    if let Some(err) = err {
        out.push_str(": ");
        out.push_str(err);
    }
    if !trace_id.is_empty() {
        out.push_str(". Trace ID: ");
        out.push_str(trace_id);
    }
    out
}

/// Renders an [`ErrResp`] as a content-negotiated Kubernetes `Status`.
/// `extra_headers` carries per-response additions such as the gateway's
/// CORS set or the unauthorized marker.
pub fn write_error_response(
    accept: Option<&str>,
    trace_id: &str,
    extra_headers: &HeaderMap,
    resp: ErrResp,
) -> Response {
    let message = format_status_message(&resp.msg, resp.err.as_deref(), trace_id);
    let code = resp.status_code.as_u16();
    let status = KubernetesStatus {
        kind: "Status".into(),
        api_version: "v1".into(),
        status: "Failure".into(),
        message,
        reason: reason_for_code(code).into(),
        code,
    };
    let wants_yaml = accept.is_some_and(|a| a.contains("application/yaml"));
    let (content_type, body) = if wants_yaml {
        match serde_yaml::to_string(&status) {
            Ok(body) => ("application/yaml", body),
            Err(_) => ("text/plain", status.message.clone()),
        }
    } else {
        match serde_json::to_string(&status) {
            Ok(body) => ("application/json", body),
            Err(_) => ("text/plain", status.message.clone()),
        }
    };
    let mut response = (resp.status_code, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    for (name, value) in extra_headers {
        headers.insert(name.clone(), value.clone());
    }
    response
}
