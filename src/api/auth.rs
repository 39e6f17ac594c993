use std::sync::Arc;

use axum::{extract::Request, middleware::Next, response::Response};

use super::error::ApiError;
use crate::auth::{Authenticator, Credential};

/// Extract a JWT from the Authorization header. The `Bearer ` prefix is
/// optional.
fn extract_bearer(req: &Request) -> Option<String> {
    let value = req.headers().get("authorization")?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Extract an api key pair from the `x-api-key` and `x-api-secret` headers.
fn extract_api_keys(req: &Request) -> Option<(String, String)> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Some((header("x-api-key")?, header("x-api-secret")?))
}

/// The credential a request presents, if any. Api keys win over a JWT.
pub fn extract_credential(req: &Request) -> Option<Credential> {
    if let Some((key, secret)) = extract_api_keys(req) {
        return Some(Credential::ApiKeys { key, secret });
    }
    extract_bearer(req).map(|jwt| Credential::Jwt { jwt })
}

/// Auth middleware for the HTTP terminal routes.
///
/// On success the [`Principal`](crate::auth::Principal) is stored as a
/// request extension for the handler. WebSocket routes do not use this;
/// they log in with their first message.
pub async fn require_auth(
    authenticator: Arc<dyn Authenticator>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(credential) = extract_credential(&req) else {
        return Err(ApiError::AuthRequired);
    };
    match authenticator.validate(&credential) {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            Ok(next.run(req).await)
        }
        Err(e) => {
            tracing::debug!(?credential, %e, "rejected request credential");
            Err(ApiError::AuthInvalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Principal, StaticAuth};
    use crate::config::UserConfig;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Extension, Router,
    };
    use tower::ServiceExt;

    async fn whoami(Extension(principal): Extension<Principal>) -> String {
        principal.name
    }

    fn test_app() -> Router {
        let auth: Arc<dyn Authenticator> = Arc::new(StaticAuth::new(vec![UserConfig {
            name: "ops".into(),
            jwt: Some("ops-jwt".into()),
            api_key: Some("ops-key".into()),
            api_secret: Some("ops-secret".into()),
            terminal: true,
            admin: false,
        }]));
        Router::new()
            .route("/test", get(whoami))
            .layer(axum::middleware::from_fn(move |req, next| {
                let a = Arc::clone(&auth);
                async move { require_auth(a, req, next).await }
            }))
    }

    // ── extraction ──────────────────────────────────────

    #[test]
    fn extract_bearer_with_and_without_prefix() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer my-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), Some("my-token".to_string()));

        let req = Request::builder()
            .uri("/test")
            .header("authorization", "raw-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), Some("raw-token".to_string()));
    }

    #[test]
    fn extract_api_keys_needs_both_headers() {
        let req = Request::builder()
            .uri("/test")
            .header("x-api-key", "k")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_credential(&req), None);

        let req = Request::builder()
            .uri("/test")
            .header("x-api-key", "k")
            .header("x-api-secret", "s")
            .header("authorization", "Bearer t")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_credential(&req), Some(Credential::api_keys("k", "s")));
    }

    // ── middleware ──────────────────────────────────────

    #[tokio::test]
    async fn missing_credentials_401() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_credentials_403() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let resp = test_app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn valid_credentials_reach_handler_with_principal() {
        let req = Request::builder()
            .uri("/test")
            .header("x-api-key", "ops-key")
            .header("x-api-secret", "ops-secret")
            .body(Body::empty())
            .unwrap();
        let resp = test_app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ops");

        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer ops-jwt")
            .body(Body::empty())
            .unwrap();
        assert_eq!(test_app().oneshot(req).await.unwrap().status(), StatusCode::OK);
    }
}
