//! Authentication extractor for Axum
//!
//! Checks the shared API token from `Authorization: Bearer`, `X-API-Key`
//! or a `?token=` query parameter, and resolves the calling user from
//! `X-User-Id`.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// User id used when the request names none
pub const ANONYMOUS_USER: &str = "anonymous";

/// Shared-token settings, installed as an `Extension<Arc<AuthSettings>>`
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    api_token: String,
}

impl AuthSettings {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
        }
    }

    /// An empty token disables the check
    pub fn is_enabled(&self) -> bool {
        !self.api_token.is_empty()
    }

    pub fn verify(&self, candidate: &str) -> bool {
        self.api_token
            .as_bytes()
            .ct_eq(candidate.as_bytes())
            .into()
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
}

/// JSON error response for auth failures
#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    success: bool,
    error: String,
    code: &'static str,
}

/// Auth rejection type
#[derive(Debug)]
pub struct AuthRejection {
    status: StatusCode,
    body: AuthErrorResponse,
}

impl AuthRejection {
    fn new(status: StatusCode, error: impl Into<String>, code: &'static str) -> Self {
        Self {
            status,
            body: AuthErrorResponse {
                success: false,
                error: error.into(),
                code,
            },
        }
    }

    fn missing() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "Authentication required. Provide Authorization: Bearer <token> or X-API-Key header.",
            "UNAUTHORIZED",
        )
    }

    fn invalid() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "Invalid token or API key",
            "INVALID_CREDENTIALS",
        )
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Axum extractor that enforces the API token when one is configured.
pub struct RequireAuth(pub Caller);

#[async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let settings = parts
            .extensions
            .get::<Arc<AuthSettings>>()
            .cloned()
            .ok_or_else(|| {
                AuthRejection::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "AuthSettings not configured",
                    "INTERNAL_ERROR",
                )
            })?;

        if settings.is_enabled() {
            let token = extract_token(parts).ok_or_else(AuthRejection::missing)?;
            if !settings.verify(&token) {
                return Err(AuthRejection::invalid());
            }
        }

        Ok(RequireAuth(Caller {
            user_id: extract_user_id(parts),
        }))
    }
}

/// Extract token from request headers or query params
fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    if let Some(value) = parts.headers.get("x-api-key").and_then(|h| h.to_str().ok()) {
        return Some(value.trim().to_string());
    }

    // browsers cannot set headers on WebSocket upgrades
    parts.uri.query().and_then(|query| {
        query
            .split('&')
            .find_map(|param| param.strip_prefix("token="))
            .map(str::to_string)
    })
}

fn extract_user_id(parts: &Parts) -> String {
    parts
        .headers
        .get("x-user-id")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(settings: AuthSettings, request: Request<()>) -> Result<Caller, StatusCode> {
        let (mut parts, _) = request.into_parts();
        parts.extensions.insert(Arc::new(settings));
        RequireAuth::from_request_parts(&mut parts, &())
            .await
            .map(|RequireAuth(caller)| caller)
            .map_err(|rejection| rejection.status)
    }

    #[test]
    fn test_verify_constant_time() {
        let settings = AuthSettings::new("secret");
        assert!(settings.is_enabled());
        assert!(settings.verify("secret"));
        assert!(!settings.verify("secre"));
        assert!(!settings.verify("secret2"));
        assert!(!AuthSettings::default().is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_auth_accepts_anonymous() {
        let request = Request::builder().uri("/").body(()).unwrap();
        let caller = extract(AuthSettings::default(), request).await.unwrap();
        assert_eq!(caller.user_id, ANONYMOUS_USER);
    }

    #[tokio::test]
    async fn test_token_sources() {
        let bearer = Request::builder()
            .header("Authorization", "Bearer secret")
            .header("X-User-Id", "alice")
            .body(())
            .unwrap();
        assert_eq!(
            extract(AuthSettings::new("secret"), bearer).await.unwrap().user_id,
            "alice"
        );

        let api_key = Request::builder()
            .header("X-API-Key", "secret")
            .body(())
            .unwrap();
        tokio_test::assert_ok!(extract(AuthSettings::new("secret"), api_key).await);

        let query = Request::builder()
            .uri("/ws?foo=1&token=secret")
            .body(())
            .unwrap();
        tokio_test::assert_ok!(extract(AuthSettings::new("secret"), query).await);
    }

    #[tokio::test]
    async fn test_missing_or_wrong_token_rejected() {
        let missing = Request::builder().body(()).unwrap();
        assert_eq!(
            extract(AuthSettings::new("secret"), missing).await,
            Err(StatusCode::UNAUTHORIZED)
        );

        let wrong = Request::builder()
            .header("Authorization", "Bearer nope")
            .body(())
            .unwrap();
        assert_eq!(
            extract(AuthSettings::new("secret"), wrong).await,
            Err(StatusCode::UNAUTHORIZED)
        );
    }
}
