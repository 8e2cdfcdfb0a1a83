pub mod auth;
pub mod error;
mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::session::PLAYLIST_URL_PREFIX;
use crate::source::{RtspUrlResolver, SourceResolver};
use crate::supervisor::Supervisor;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    /// Turns `device` start requests into source URIs.
    pub resolver: Arc<dyn SourceResolver>,
}

impl AppState {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            resolver: Arc::new(RtspUrlResolver),
        }
    }
}

/// Configuration for the HTTP router.
///
/// Controls authentication, CORS and rate limiting.
/// Use `RouterConfig::default()` in tests for a minimal no-auth setup.
pub struct RouterConfig {
    pub token: Option<String>,
    pub bind: SocketAddr,
    pub cors_origins: Vec<String>,
    pub rate_limit: Option<u32>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            token: None,
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            cors_origins: vec![],
            rate_limit: None,
        }
    }
}

/// Build the HTTP router.
///
/// `/streams/*` is protected by bearer auth when a token is configured.
/// `/health` and the static `/hls` tree are always public so players can
/// fetch playlists without credentials.
pub fn router(state: AppState, config: RouterConfig) -> Router {
    let hls = ServeDir::new(&state.supervisor.config().hls_root);

    let stream_routes = Router::new()
        .route("/streams/start", post(stream_start))
        .route("/streams/stop", post(stream_stop))
        .route("/streams/active", get(streams_active))
        .route("/streams/stats/overview", get(stats_overview))
        .route("/streams/bulk/start", post(bulk_start))
        .route("/streams/bulk/stop", post(bulk_stop))
        .route("/streams/{id}", get(stream_get))
        .with_state(state.clone());

    // Apply rate limiting to the protected routes if configured.
    let protected = match config.rate_limit {
        Some(rps) => {
            use tower_governor::{
                governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
            };
            let governor_conf = GovernorConfigBuilder::default()
                .per_second(u64::from(rps))
                .burst_size(rps)
                .key_extractor(PeerIpKeyExtractor)
                .finish();
            match governor_conf {
                Some(conf) => stream_routes.layer(GovernorLayer::new(Arc::new(conf))),
                None => {
                    tracing::warn!(rps, "invalid rate limit, rate limiting disabled");
                    stream_routes
                }
            }
        }
        None => stream_routes,
    };

    let protected = match config.token {
        Some(token) => protected.layer(axum::middleware::from_fn(move |req, next| {
            let t = token.clone();
            async move { auth::require_auth(t, req, next).await }
        })),
        None => {
            if !config.bind.ip().is_loopback() {
                tracing::warn!(bind = %config.bind, "stream API exposed without authentication");
            }
            protected
        }
    };

    let router = Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(protected)
        .nest_service(PLAYLIST_URL_PREFIX, hls)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(TraceLayer::new_for_http());

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for oneshot()

    async fn create_test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig {
            hls_root: dir.path().join("hls"),
            ffmpeg_path: dir.path().join("no-such-ffmpeg"),
            ..SupervisorConfig::default()
        };
        let supervisor = Supervisor::new(config).await.unwrap();
        (AppState::new(supervisor), dir)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let (state, _dir) = create_test_state().await;
        let app = router(
            state,
            RouterConfig {
                token: Some("secret".into()),
                ..RouterConfig::default()
            },
        );
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_streams"], 0);
    }

    #[tokio::test]
    async fn streams_require_token_when_configured() {
        let (state, _dir) = create_test_state().await;
        let app = router(
            state,
            RouterConfig {
                token: Some("secret".into()),
                ..RouterConfig::default()
            },
        );
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/streams/active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/streams/active")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn active_is_empty_initially() {
        let (state, _dir) = create_test_state().await;
        let app = router(state, RouterConfig::default());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/streams/active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total_streams"], 0);
        assert_eq!(json["streams"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn start_rejects_out_of_range_duration() {
        let (state, _dir) = create_test_state().await;
        let app = router(state, RouterConfig::default());
        let resp = app
            .oneshot(post_json(
                "/streams/start",
                serde_json::json!({ "source_uri": "rtsp://cam/1", "duration": 10 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn start_requires_a_source() {
        let (state, _dir) = create_test_state().await;
        let app = router(state, RouterConfig::default());
        let resp = app
            .oneshot(post_json("/streams/start", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn start_rejects_unknown_brand() {
        let (state, _dir) = create_test_state().await;
        let app = router(state, RouterConfig::default());
        let resp = app
            .oneshot(post_json(
                "/streams/start",
                serde_json::json!({
                    "device": {
                        "brand": "axis",
                        "host": "10.0.0.9",
                        "username": "u",
                        "password": "p"
                    }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], "invalid_source");
    }

    #[tokio::test]
    async fn start_with_missing_binary_fails_and_leaves_nothing() {
        let (state, _dir) = create_test_state().await;
        let supervisor = state.supervisor.clone();
        let app = router(state, RouterConfig::default());
        let resp = app
            .oneshot(post_json(
                "/streams/start",
                serde_json::json!({ "source_uri": "rtsp://cam/1", "stream_id": "cam1" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], "stream_start_failed");
        assert!(supervisor.get("cam1").is_none());
        assert!(!supervisor.config().hls_root.join("cam1").exists());
    }

    #[tokio::test]
    async fn stop_unknown_is_not_found() {
        let (state, _dir) = create_test_state().await;
        let app = router(state, RouterConfig::default());
        let resp = app
            .oneshot(post_json(
                "/streams/stop",
                serde_json::json!({ "stream_id": "ghost" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], "stream_not_found");
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let (state, _dir) = create_test_state().await;
        let app = router(state, RouterConfig::default());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/streams/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bulk_stop_reports_each_item() {
        let (state, _dir) = create_test_state().await;
        let app = router(state, RouterConfig::default());
        let resp = app
            .oneshot(post_json(
                "/streams/bulk/stop",
                serde_json::json!(["a", "b"]),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total_requests"], 2);
        assert_eq!(json["successful"], 0);
        assert_eq!(json["failed"], 2);
        assert_eq!(json["results"][0]["status"], "error");
    }

    #[tokio::test]
    async fn stats_overview_counts_segments() {
        let (state, _dir) = create_test_state().await;
        let root = state.supervisor.config().hls_root.clone();
        std::fs::create_dir_all(root.join("leftover")).unwrap();
        std::fs::write(root.join("leftover/segment_000.ts"), b"x").unwrap();
        let app = router(state, RouterConfig::default());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/streams/stats/overview")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["active_streams"], 0);
        assert_eq!(json["total_segment_files"], 1);
    }

    #[tokio::test]
    async fn hls_tree_is_served_without_auth() {
        let (state, _dir) = create_test_state().await;
        let root = state.supervisor.config().hls_root.clone();
        std::fs::create_dir_all(root.join("cam1")).unwrap();
        std::fs::write(root.join("cam1/stream.m3u8"), "#EXTM3U\n").unwrap();
        let app = router(
            state,
            RouterConfig {
                token: Some("secret".into()),
                ..RouterConfig::default()
            },
        );
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/hls/cam1/stream.m3u8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"#EXTM3U\n");
    }

    #[tokio::test]
    async fn security_headers_present() {
        let (state, _dir) = create_test_state().await;
        let app = router(state, RouterConfig::default());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.headers().get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }
}
