//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value;
use subtle::ConstantTimeEq;

use crate::bridge::protocol::{
    INTERNAL_ERROR, INVALID_REQUEST, PARSE_ERROR, RequestId, RpcRequest, UNAUTHORIZED,
    error_response,
};
use crate::config::Secret;
use crate::health::HealthResponse;
use crate::service::{BridgeService, CallOutcome};
use crate::version::BRIDGE_VERSION;

#[derive(Debug, Serialize)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub version: &'static str,
    pub transport: &'static str,
    pub endpoints: Endpoints,
}

#[derive(Debug, Serialize)]
pub struct Endpoints {
    pub health: &'static str,
    pub mcp: &'static str,
}

async fn index() -> Json<ServiceDescriptor> {
    Json(ServiceDescriptor {
        name: "mcp-bridge",
        version: BRIDGE_VERSION,
        transport: "stdio",
        endpoints: Endpoints {
            health: "GET /health",
            mcp: "POST /mcp",
        },
    })
}

async fn health_check(State(service): State<Arc<BridgeService>>) -> Json<HealthResponse> {
    Json(service.health())
}

fn rpc_error(
    status: StatusCode,
    id: Option<&RequestId>,
    code: i64,
    message: impl Into<String>,
) -> Response {
    (status, Json(error_response(id, code, message))).into_response()
}

/// Bearer check against the configured token. No token configured means open.
fn is_authorized(expected: Option<&Secret>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match token {
        Some(token) => token.as_bytes().ct_eq(expected.expose().as_bytes()).into(),
        None => false,
    }
}

fn extract_credential(headers: &HeaderMap, name: &str) -> Option<Secret> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(Secret::new)
}

async fn mcp(
    State(service): State<Arc<BridgeService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parsed = serde_json::from_slice::<Value>(&body);
    let caller_id = parsed
        .as_ref()
        .ok()
        .and_then(|v| v.get("id").cloned())
        .and_then(|v| serde_json::from_value::<RequestId>(v).ok());

    if !is_authorized(service.config().auth_token.as_ref(), &headers) {
        tracing::warn!("Rejected /mcp request: missing or invalid bearer token");
        return rpc_error(
            StatusCode::UNAUTHORIZED,
            caller_id.as_ref(),
            UNAUTHORIZED,
            "Unauthorized",
        );
    }

    let parsed = match parsed {
        Ok(value) => value,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                None,
                PARSE_ERROR,
                format!("Parse error: {e}"),
            );
        }
    };
    let request = match serde_json::from_value::<RpcRequest>(parsed) {
        Ok(request) => request,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                caller_id.as_ref(),
                INVALID_REQUEST,
                format!("Invalid Request: {e}"),
            );
        }
    };
    if !request.has_valid_version() {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            caller_id.as_ref(),
            INVALID_REQUEST,
            "Invalid Request: jsonrpc must be \"2.0\"",
        );
    }

    let credential = extract_credential(&headers, &service.config().credential_header);
    let method = request.method.clone();
    match service.call(request, credential).await {
        Ok(CallOutcome::Response(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(CallOutcome::Accepted) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            if e.is_liveness() || e.is_timeout() {
                tracing::warn!(method = %method, error = %e, "MCP call failed");
            } else {
                tracing::error!(method = %method, error = %e, "MCP call failed");
            }
            rpc_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                caller_id.as_ref(),
                INTERNAL_ERROR,
                e.to_string(),
            )
        }
    }
}

pub fn routes(service: Arc<BridgeService>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/mcp", post(mcp))
        .with_state(service)
}
