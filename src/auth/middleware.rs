//! Authentication middleware for API routes
//!
//! HTTP routes carry `Authorization: Bearer <token>`; the websocket upgrade
//! carries the same token as `?token=`.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;

use crate::config::Config;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub enabled: bool,
    pub api_token: String,
    pub allowed_origins: Vec<String>,
}

impl AuthConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.authorization.enabled,
            api_token: config.authorization.token.clone(),
            allowed_origins: vec!["*".to_string()],
        }
    }

    /// Whether `token` grants access. Everything is accepted when authorization is off.
    pub fn accepts(&self, token: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        matches!(token, Some(token) if !token.is_empty() && token == self.api_token)
    }
}

/// Check if origin is allowed
fn is_origin_allowed(origin: Option<&str>, allowed_origins: &[String]) -> bool {
    match origin {
        Some(o) => allowed_origins.iter().any(|allowed| allowed == "*" || allowed == o),
        None => true,
    }
}

/// Extract the Bearer token, if any
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|auth| auth.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
}

/// Authentication middleware
pub async fn auth_middleware(
    State(auth_config): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let origin = headers.get("origin").and_then(|h| h.to_str().ok());
    if !is_origin_allowed(origin, &auth_config.allowed_origins) {
        return (
            StatusCode::FORBIDDEN,
            axum::Json(json!({
                "error": "Origin not allowed"
            })),
        )
            .into_response();
    }

    if !auth_config.accepts(bearer_token(&headers)) {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({
                "error": "Invalid or missing Bearer token. Format: Authorization: Bearer <token>"
            })),
        )
            .into_response();
    }

    next.run(request).await
}
