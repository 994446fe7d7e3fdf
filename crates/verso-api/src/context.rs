//! Request context extraction.
//!
//! In debug mode the workspace and user are supplied via headers for local
//! development. Otherwise both are read from a verified HS256 JWT, using the
//! claim names configured in [`JwtConfig`](crate::config::JwtConfig).

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use uuid::Uuid;

use verso_core::{WorkspaceId, WorkspaceScope};

use crate::error::ApiError;
use crate::server::AppState;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// User name recorded for debug-mode requests that omit `X-User-Name`.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Per-request context derived from authentication and headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Workspace every read and write of this request is scoped to.
    pub workspace_id: WorkspaceId,
    /// Caller identity recorded in audit fields.
    pub user_name: String,
    /// Request ID for tracing/correlation.
    pub request_id: String,
}

impl RequestContext {
    /// Returns the store scope for this request.
    #[must_use]
    pub fn scope(&self) -> WorkspaceScope {
        WorkspaceScope::new(self.workspace_id.clone(), self.user_name.clone())
    }

    /// Converts an error into an [`ApiError`] tagged with this request's ID.
    #[must_use]
    pub fn error(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().with_request_id(self.request_id.clone())
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let headers = &parts.headers;
        let request_id =
            request_id_from_headers(headers).unwrap_or_else(|| Uuid::new_v4().to_string());

        let (workspace, user_name) = if state.config.debug {
            let workspace = header_string(headers, "X-Workspace-Id").ok_or_else(|| {
                ApiError::unauthorized("missing X-Workspace-Id header (debug mode)")
                    .with_request_id(request_id.clone())
            })?;
            let user_name =
                header_string(headers, "X-User-Name").unwrap_or_else(|| ANONYMOUS_USER.to_string());
            (workspace, user_name)
        } else {
            extract_from_jwt(headers, state, &request_id)?
        };

        let workspace_id = WorkspaceId::new(workspace).map_err(|e| {
            ApiError::unauthorized(format!("invalid workspace: {e}"))
                .with_request_id(request_id.clone())
        })?;

        let ctx = Self {
            workspace_id,
            user_name,
            request_id,
        };

        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

fn extract_from_jwt(
    headers: &HeaderMap,
    state: &AppState,
    request_id: &str,
) -> Result<(String, String), ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::missing_auth().with_request_id(request_id.to_string()))?;

    let secret = state.config.jwt.hs256_secret.as_deref().ok_or_else(|| {
        ApiError::internal("jwt.hs256_secret is required when debug=false")
            .with_request_id(request_id.to_string())
    })?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_nbf = true;
    if let Some(iss) = state.config.jwt.issuer.as_deref() {
        validation.set_issuer(&[iss]);
    }
    if let Some(aud) = state.config.jwt.audience.as_deref() {
        validation.set_audience(&[aud]);
    }

    let key = DecodingKey::from_secret(secret.as_bytes());
    let data = jsonwebtoken::decode::<Value>(&token, &key, &validation)
        .map_err(|_| ApiError::invalid_token().with_request_id(request_id.to_string()))?;

    let Some(obj) = data.claims.as_object() else {
        return Err(ApiError::invalid_token().with_request_id(request_id.to_string()));
    };

    let workspace = extract_required_claim(obj, &state.config.jwt.workspace_claim, request_id)?;
    let user_name = extract_required_claim(obj, &state.config.jwt.user_claim, request_id)?;

    Ok((workspace, user_name))
}

fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    header_string(headers, REQUEST_ID_HEADER)
}

fn extract_required_claim(
    obj: &serde_json::Map<String, Value>,
    claim: &str,
    request_id: &str,
) -> Result<String, ApiError> {
    obj.get(claim)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::invalid_token().with_request_id(request_id.to_string()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_string(headers, "Authorization")?;
    let token = raw.strip_prefix("Bearer ")?;
    Some(token.to_string())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?;
    header_value_to_string(value)
}

fn header_value_to_string(value: &HeaderValue) -> Option<String> {
    value
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
