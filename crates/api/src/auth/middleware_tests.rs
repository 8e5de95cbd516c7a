//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Token extraction from the Authorization header and session cookie
//! - Client IP extraction behind proxies
//! - Ban expiry
//! - Rejections that happen before any database lookup

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        extract::Extension,
        http::{header, HeaderMap, HeaderValue, Request, StatusCode},
        middleware,
        response::IntoResponse,
        routing::get,
        Router,
    };
    use sqlx::postgres::PgPoolOptions;
    use time::{Duration, OffsetDateTime};
    use tower::ServiceExt;

    use super::super::jwt::JwtManager;
    use super::super::middleware::*;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    /// Auth state whose pool never connects unless a query runs
    fn setup_auth_state() -> AuthState {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/boilerkit_test")
            .expect("lazy pool");
        AuthState {
            jwt_manager: JwtManager::new(SECRET, 24),
            pool,
        }
    }

    fn protected_app() -> Router {
        Router::new()
            .route(
                "/protected",
                get(|Extension(user): Extension<AuthUser>| async move { user.email }),
            )
            .layer(middleware::from_fn_with_state(setup_auth_state(), require_auth))
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    async fn error_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // =========================================================================
    // Token extraction
    // =========================================================================

    #[test]
    fn test_bearer_token_from_header() {
        let h = headers(&[("authorization", "Bearer abc.def.ghi")]);
        assert_eq!(extract_bearer_token(&h).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_token_from_session_cookie() {
        let h = headers(&[("cookie", "theme=dark; boilerkit_session=tok123; other=1")]);
        assert_eq!(extract_bearer_token(&h).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_header_wins_over_cookie() {
        let h = headers(&[
            ("authorization", "Bearer from-header"),
            ("cookie", "boilerkit_session=from-cookie"),
        ]);
        assert_eq!(extract_bearer_token(&h).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_non_bearer_header_falls_back_to_cookie() {
        let h = headers(&[
            ("authorization", "Basic dXNlcjpwYXNz"),
            ("cookie", "boilerkit_session=from-cookie"),
        ]);
        assert_eq!(extract_bearer_token(&h).as_deref(), Some("from-cookie"));
    }

    #[test]
    fn test_cookie_name_must_match_exactly() {
        let h = headers(&[("cookie", "boilerkit_session_old=stale; boilerkit_session=")]);
        assert_eq!(extract_bearer_token(&h), None);
    }

    #[test]
    fn test_multiple_cookie_headers() {
        let h = headers(&[("cookie", "a=1"), ("cookie", "boilerkit_session=second")]);
        assert_eq!(extract_token_from_cookie(&h).as_deref(), Some("second"));
    }

    // =========================================================================
    // Client IP
    // =========================================================================

    #[test]
    fn test_ip_prefers_first_forwarded_hop() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "10.0.0.2"),
        ]);
        assert_eq!(extract_ip_address(&h).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_ip_falls_back_to_cloudflare_then_real_ip() {
        let h = headers(&[("cf-connecting-ip", "198.51.100.4"), ("x-real-ip", "10.0.0.2")]);
        assert_eq!(extract_ip_address(&h).as_deref(), Some("198.51.100.4"));

        let h = headers(&[("x-real-ip", "10.0.0.2")]);
        assert_eq!(extract_ip_address(&h).as_deref(), Some("10.0.0.2"));

        assert_eq!(extract_ip_address(&HeaderMap::new()), None);
    }

    // =========================================================================
    // Bans and cookies
    // =========================================================================

    #[test]
    fn test_ban_expiry() {
        let now = OffsetDateTime::now_utc();
        assert!(!ban_is_active(false, None, now));
        assert!(ban_is_active(true, None, now));
        assert!(ban_is_active(true, Some(now + Duration::hours(1)), now));
        assert!(!ban_is_active(true, Some(now - Duration::seconds(1)), now));
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("tok", 3600, true);
        assert!(cookie.starts_with("boilerkit_session=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(cookie.ends_with("; Secure"));

        let cleared = clear_session_cookie(false);
        assert!(cleared.starts_with("boilerkit_session=;"));
        assert!(cleared.contains("Max-Age=0"));
        assert!(!cleared.contains("Secure"));
    }

    // =========================================================================
    // require_auth
    // =========================================================================

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let response = protected_app()
            .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = error_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Authentication required");
    }

    #[tokio::test]
    async fn test_forged_token_is_401() {
        let forged = JwtManager::new("some-other-secret-some-other-secret", 24)
            .generate_token(uuid::Uuid::new_v4(), "mallory@example.com", "admin")
            .unwrap();

        let response = protected_app()
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(header::AUTHORIZATION, format!("Bearer {}", forged.token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = error_body(response).await;
        assert_eq!(body["error"], "Invalid or expired token");
    }

    #[tokio::test]
    async fn test_auth_error_statuses() {
        let cases = [
            (AuthError::MissingAuth, StatusCode::UNAUTHORIZED),
            (AuthError::SessionRevoked, StatusCode::UNAUTHORIZED),
            (AuthError::Banned(None), StatusCode::FORBIDDEN),
            (AuthError::InsufficientPermissions, StatusCode::FORBIDDEN),
            (AuthError::DatabaseError, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }

        let body = error_body(AuthError::Banned(Some("spam".into())).into_response()).await;
        assert_eq!(body["error"], "Account banned: spam");
        assert_eq!(body["code"], 403);
    }
}
