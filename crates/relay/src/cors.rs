// CORS for the read-only lock status route.
//
// Browsers only ever read `GET /v1/documents/{id}/lock`; lock commands go
// through the WebSocket behind the gateway, which CORS does not cover.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

const DEFAULT_DEV_ORIGINS: &[&str] = &["http://localhost:3000", "http://127.0.0.1:3000"];

/// `None` allows the development origins, `"*"` any origin, anything else
/// is a comma-separated allow list.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([HeaderName::from_static("x-request-id")])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .max_age(std::time::Duration::from_secs(600));

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()),
        Some(origins) => base.allow_origin(parse_origins(origins)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    fn test_app(origins: Option<&str>) -> Router {
        Router::new()
            .route("/v1/documents/{id}/lock", get(|| async { "{}" }))
            .layer(cors_layer(origins))
    }

    fn preflight(origin: &str, method: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/v1/documents/00000000-0000-0000-0000-000000000000/lock")
            .header("origin", origin)
            .header("access-control-request-method", method)
            .body(Body::empty())
            .expect("preflight request should build")
    }

    #[tokio::test]
    async fn default_origins_allow_local_dashboard() {
        let response = test_app(None)
            .oneshot(preflight("http://localhost:3000", "GET"))
            .await
            .expect("preflight should return a response");

        assert_eq!(
            response.headers().get("access-control-allow-origin").map(HeaderValue::as_bytes),
            Some(&b"http://localhost:3000"[..])
        );
    }

    #[tokio::test]
    async fn unknown_origin_gets_no_allow_header() {
        let response = test_app(Some("https://locks.example.com"))
            .oneshot(preflight("https://evil.example.com", "GET"))
            .await
            .expect("preflight should return a response");

        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_allows_any_origin() {
        let response = test_app(Some("*"))
            .oneshot(preflight("https://anything.example.com", "GET"))
            .await
            .expect("preflight should return a response");

        assert_eq!(
            response.headers().get("access-control-allow-origin").map(HeaderValue::as_bytes),
            Some(&b"*"[..])
        );
    }
}
