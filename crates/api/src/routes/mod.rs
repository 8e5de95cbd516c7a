//! HTTP routes

pub mod auth;
pub mod roles;
pub mod subscription;
pub mod upload;
pub mod users;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;

use crate::{auth::require_auth, state::AppState};

/// Multipart framing allowance on top of the file limit
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    let upload_limit = state.config.upload.max_bytes + MULTIPART_OVERHEAD_BYTES;

    let public_routes = Router::new()
        .route("/health", get(health))
        // Auth
        .route("/api/auth/sign-up/email", post(auth::sign_up))
        .route("/api/auth/sign-in/email", post(auth::sign_in))
        .route("/api/auth/verify-email", get(auth::verify_email))
        .route("/api/auth/forget-password", post(auth::forget_password))
        .route("/api/auth/reset-password", post(auth::reset_password))
        .route("/api/auth/delete-user/callback", get(auth::delete_user_callback))
        // Stripe
        .route("/api/stripe/webhook", post(webhooks::stripe_webhook));

    let upload_routes = Router::new()
        .route("/api/v1/upload", post(upload::upload_file))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(upload_limit));

    let protected_routes = Router::new()
        // Auth
        .route("/api/auth/sign-out", post(auth::sign_out))
        .route("/api/auth/delete-user", post(auth::delete_user))
        // Users
        .route("/api/v1/users/session", get(users::session))
        .route("/api/v1/users/stripe/{price_id}", get(users::stripe_redirect))
        .route("/api/stripe/open-portal/{user_stripe_id}", get(users::open_portal))
        // Subscription
        .route("/api/v1/subscription/create", post(subscription::create))
        .route("/api/v1/subscription/status", get(subscription::status))
        .route("/api/v1/subscription/change", post(subscription::change))
        .route("/api/v1/subscription/cancel", post(subscription::cancel))
        .route("/api/v1/subscription/history", get(subscription::history))
        .route("/api/v1/subscription/trial", post(subscription::start_trial))
        // Upload
        .merge(upload_routes)
        .route("/api/v1/upload/{*public_id}", delete(upload::delete_file))
        // RBAC
        .route("/api/v1/permissions/me", get(roles::my_permissions))
        .route("/api/v1/roles", get(roles::list).post(roles::create))
        .route("/api/v1/users/{user_id}/roles", post(roles::assign))
        .route("/api/v1/users/{user_id}/roles/{role_id}", delete(roles::remove))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .fallback(not_found)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "message": "route not found" })),
    )
}


#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };

    use super::test_support::{app, send};

    #[tokio::test]
    async fn test_health() {
        let (response, body) = send(
            app(false),
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (response, body) = send(
            app(false),
            Request::builder().uri("/api/v1/nope").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "route not found");
    }

    #[tokio::test]
    async fn test_protected_routes_require_auth() {
        for (method, uri) in [
            ("GET", "/api/v1/users/session"),
            ("GET", "/api/v1/subscription/status"),
            ("POST", "/api/v1/subscription/cancel"),
            ("POST", "/api/v1/upload"),
            ("DELETE", "/api/v1/upload/general/a.png"),
            ("GET", "/api/v1/roles"),
            ("POST", "/api/auth/sign-out"),
        ] {
            let (response, _) = send(
                app(true),
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{method} {uri}");
        }
    }
}
