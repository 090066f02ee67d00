// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `run:app` application, operational endpoints only.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error};

use crate::app::{AppLoadError, AppSettings};

pub const MODULE: &str = "run";
pub const OBJECT: &str = "app";

const VERSION: &str = env!("CARGO_PKG_VERSION");
const CORS_MAX_AGE: Duration = Duration::from_secs(3600);

/// Path, endpoint name and methods of every route, listed by `/api/routes`
const ROUTES: &[(&str, &str, &[&str])] = &[
    ("/", "index", &["GET"]),
    ("/api/routes", "list_routes", &["GET"]),
    ("/health", "health", &["GET"]),
];

fn load_failure(reason: String) -> AppLoadError {
    AppLoadError::Failed {
        reference: format!("{}:{}", MODULE, OBJECT),
        reason,
    }
}

pub fn app(settings: &AppSettings) -> Result<Router, AppLoadError> {
    let origins = settings
        .allowed_origins
        .iter()
        .map(|origin| {
            // credentials are allowed, so every origin must be explicit
            if origin.trim() == "*" {
                return Err(load_failure(
                    "wildcard origin cannot be combined with credentials".to_string(),
                ));
            }

            HeaderValue::from_str(origin).map_err(|_| {
                load_failure(format!(
                    "allowed origin `{}` is not a valid header value",
                    origin
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let router = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/routes", get(routes))
        .fallback(not_found);

    Ok(with_layers(router, origins))
}

/// CORS, preflight filtering and panic recovery around `router`
fn with_layers(router: Router, origins: Vec<HeaderValue>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins.clone()))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            ACCEPT,
            HeaderName::from_static("x-requested-with"),
        ])
        .allow_credentials(true)
        .max_age(CORS_MAX_AGE);

    router
        .layer(cors)
        .layer(middleware::from_fn_with_state(
            Arc::new(origins),
            reject_unknown_preflight,
        ))
        .layer(CatchPanicLayer::custom(internal_error))
}

async fn index() -> Json<Value> {
    Json(json!({
        "message": "minium worker pool",
        "version": VERSION,
        "status": "running",
        "endpoints": {
            "health": "/health",
            "routes": "/api/routes",
        },
    }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Backend is running",
        "version": VERSION,
    }))
}

async fn routes() -> Json<Value> {
    let routes = ROUTES
        .iter()
        .map(|(path, endpoint, methods)| {
            json!({ "path": path, "endpoint": endpoint, "methods": methods })
        })
        .collect::<Vec<_>>();

    Json(json!({
        "total": routes.len(),
        "routes": routes,
    }))
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not found",
            "message": "The requested resource was not found",
        })),
    )
}

fn internal_error(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic");
    error!(panic = detail, "request handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "Internal server error",
            "message": "Something went wrong",
        })),
    )
        .into_response()
}

/// Preflights from origins outside the allow list are refused outright
async fn reject_unknown_preflight(
    State(origins): State<Arc<Vec<HeaderValue>>>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS {
        let origin = req.headers().get(ORIGIN);
        if !origin.map_or(false, |origin| origins.contains(origin)) {
            debug!(?origin, "blocked preflight");
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "Origin not allowed" })),
            )
                .into_response();
        }
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_METHOD};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use super::*;

    fn settings() -> AppSettings {
        AppSettings {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            ..AppSettings::default()
        }
    }

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        let response = app(&settings())
            .expect("app")
            .oneshot(HttpRequest::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    #[tokio::test]
    async fn test_index() {
        let (status, body) = get_json("/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["endpoints"]["health"], "/health");
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], VERSION);
    }

    #[tokio::test]
    async fn test_routes_lists_every_route() {
        let (status, body) = get_json("/api/routes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], ROUTES.len());
        assert_eq!(body["routes"][0]["path"], "/");
        assert_eq!(body["routes"][0]["endpoint"], "index");
        assert_eq!(body["routes"][0]["methods"][0], "GET");
    }

    #[tokio::test]
    async fn test_not_found() {
        let (status, body) = get_json("/api/trades").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found");
    }

    fn preflight(origin: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(Method::OPTIONS)
            .uri("/health")
            .header(ORIGIN, origin)
            .header(ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_preflight_allowed_origin() {
        let response = app(&settings())
            .expect("app")
            .oneshot(preflight("http://localhost:3000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
    }

    #[tokio::test]
    async fn test_preflight_unknown_origin() {
        let response = app(&settings())
            .expect("app")
            .oneshot(preflight("http://evil.example"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_simple_request_gets_cors_headers() {
        let response = app(&settings())
            .expect("app")
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .header(ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
    }

    #[test]
    fn test_invalid_origin_fails_load() {
        let settings = AppSettings {
            allowed_origins: vec!["http://bad\norigin".to_string()],
            ..AppSettings::default()
        };

        match app(&settings) {
            Err(AppLoadError::Failed { reference, .. }) => assert_eq!(reference, "run:app"),
            other => panic!("expected load failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_wildcard_origin_fails_load() {
        let settings = AppSettings {
            allowed_origins: vec!["http://localhost:3000".to_string(), "*".to_string()],
            ..AppSettings::default()
        };

        match app(&settings) {
            Err(AppLoadError::Failed { reason, .. }) => {
                assert!(reason.contains("wildcard origin"), "{}", reason)
            }
            other => panic!("expected load failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_is_internal_error() {
        async fn boom() -> &'static str {
            panic!("boom")
        }

        let router = with_layers(
            Router::new().route("/boom", get(boom)),
            vec![HeaderValue::from_static("http://localhost:3000")],
        );
        let response = router
            .oneshot(HttpRequest::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["message"], "Something went wrong");
    }
}
