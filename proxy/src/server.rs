//! The HTTP/WebSocket front end.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path as UrlPath, State, WebSocketUpgrade};
use axum::http::{header, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use log::{info, warn};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use crate::config::{Config, CorsConfig};
use crate::hub::StreamHub;
use crate::session;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<StreamHub>,
    doc_root: Option<PathBuf>,
}

/// Builds the router: the JSON stream index, the WebSocket endpoint under
/// the configured prefix, and (when enabled) static files from `doc_root`.
pub fn build_router(hub: Arc<StreamHub>, config: &Config) -> Router {
    let doc_root = if config.server.http.enable && !config.server.http.doc_root.is_empty() {
        Some(PathBuf::from(&config.server.http.doc_root))
    } else {
        None
    };
    let state = AppState {
        hub,
        doc_root: doc_root.clone(),
    };

    let mut index = Router::new().route(&config.server.stream.http_target, get(stream_index));
    if let Some(cors) = cors_layer(&config.server.cors) {
        index = index.layer(cors);
    }

    let mut prefix = config.server.stream.ws_target_prefix.clone();
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    let ws_path = format!("{}{{id}}", prefix);

    let mut router = Router::new().merge(index).route(&ws_path, get(ws_upgrade));
    if doc_root.is_some() {
        router = router.fallback(static_files);
    }
    router.with_state(state)
}

async fn stream_index(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stream_index())
}

async fn ws_upgrade(
    UrlPath(id): UrlPath<String>,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("ws stream requested, id={} client={}", id, peer);
    if !state.hub.contains(&id) {
        // Still upgraded: the session is accepted and then closed without
        // pushing any packets.
        info!("ws stream not found, id={}", id);
    }
    ws.on_upgrade(move |socket| session::run(socket, id, peer.to_string(), state.hub))
}

/// Serves files under `doc_root`: 400 for non-GET/HEAD, 404 for missing or
/// traversal-rejected paths, 500 on read errors.
async fn static_files(State(state): State<AppState>, req: Request<Body>) -> Response {
    let doc_root = match &state.doc_root {
        Some(root) => root,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    let head = if req.method() == Method::GET {
        false
    } else if req.method() == Method::HEAD {
        true
    } else {
        return (StatusCode::BAD_REQUEST, "Unknown HTTP-method").into_response();
    };
    let full = match resolve(doc_root, req.uri().path()) {
        Some(p) => p,
        None => return (StatusCode::NOT_FOUND, "Not found").into_response(),
    };
    match tokio::fs::read(&full).await {
        Ok(body) => {
            let mime = mime_guess::from_path(&full).first_or_octet_stream();
            let builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, mime.as_ref())
                .header(header::CONTENT_LENGTH, body.len());
            let body = if head { Body::empty() } else { Body::from(body) };
            builder.body(body).expect("static response")
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "Not found").into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response(),
    }
}

/// Maps a request path into `doc_root`, refusing anything that would step
/// outside it. Directory requests get `index.html` appended.
fn resolve(doc_root: &Path, target: &str) -> Option<PathBuf> {
    let rel = target.trim_start_matches('/');
    let rel = if rel.is_empty() || rel.ends_with('/') {
        format!("{}index.html", rel)
    } else {
        rel.to_string()
    };
    let rel = Path::new(&rel);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(doc_root.join(rel))
}

/// Maps the configured CORS options onto a tower-http layer. `None` when
/// disabled.
fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if !config.enabled {
        return None;
    }
    let mut layer = CorsLayer::new();

    let any_origin = config.allowed_origins.iter().any(|o| o == "*");
    layer = if any_origin && config.allowed_credentials {
        // "*" with credentials must echo the request origin instead.
        layer.allow_origin(AllowOrigin::mirror_request())
    } else if any_origin {
        layer.allow_origin(AllowOrigin::any())
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(origins)
    };

    let methods: Vec<Method> = config
        .allowed_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    layer = if methods.is_empty() {
        layer.allow_methods(vec![Method::GET, Method::HEAD, Method::POST])
    } else {
        layer.allow_methods(methods)
    };

    if config.allowed_headers.iter().any(|h| h == "*") {
        layer = layer.allow_headers(AllowHeaders::mirror_request());
    } else if !config.allowed_headers.is_empty() {
        let headers: Vec<HeaderName> = config
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer = layer.allow_headers(headers);
    }
    if !config.exposed_headers.is_empty() {
        let headers: Vec<HeaderName> = config
            .exposed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer = layer.expose_headers(headers);
    }
    if config.allowed_credentials {
        layer = layer.allow_credentials(true);
    }
    if let Some(secs) = config.max_age {
        layer = layer.max_age(Duration::from_secs(secs));
    }
    if config.debug {
        warn!("cors debug logging is folded into the access log");
    }
    Some(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::StreamHub;
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use strand_media::CodecParameters;
    use strand_wire::{self as wire, MediaType};
    use tower::ServiceExt;

    fn test_config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn hub_with_stream(id: &str) -> Arc<StreamHub> {
        let hub = Arc::new(StreamHub::new(5));
        let params = CodecParameters {
            codec_type: 0,
            codec_id: 27,
            width: Some(640),
            height: Some(480),
            ..CodecParameters::default()
        };
        let pkt = wire::Packet {
            media_type: MediaType::Video,
            pts: 0,
            dts: 0,
            payload: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            stream_index: 0,
            flags: wire::FLAG_KEY,
            side_data: Vec::new(),
            duration: 1,
            pos: -1,
        };
        hub.publish(id, MediaType::Video, &params, &pkt);
        hub
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn streams_index_lists_registered_streams() {
        let hub = hub_with_stream("A");
        hub.publish(
            "B",
            MediaType::Video,
            &CodecParameters {
                codec_type: 0,
                codec_id: 27,
                ..CodecParameters::default()
            },
            &wire::Packet {
                media_type: MediaType::Video,
                pts: 0,
                dts: 0,
                payload: Bytes::new(),
                stream_index: 0,
                flags: 0,
                side_data: Vec::new(),
                duration: 0,
                pos: -1,
            },
        );
        let config = test_config("streams:\n  - id: A\n    method: file\n    input_url: /a\n");
        let router = build_router(hub, &config);

        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/streams")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            HeaderValue::from_static("application/json")
        );
        let json = body_json(resp).await;
        let arr = json.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["id"], "A");
        assert_eq!(arr[1]["id"], "B");
        // codec_type carries the video media-type integer.
        assert_eq!(arr[0]["video"]["codecpar"]["codec_type"], 0);
    }

    #[tokio::test]
    async fn static_handler_rejects_non_get() {
        let hub = hub_with_stream("A");
        let config = test_config(
            "server:\n  http:\n    doc_root: /nonexistent-root\n\
             streams:\n  - id: A\n    method: file\n    input_url: /a\n",
        );
        let router = build_router(hub, &config);
        let resp = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/index.html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn static_handler_404s_missing_files() {
        let hub = hub_with_stream("A");
        let config = test_config(
            "server:\n  http:\n    doc_root: /nonexistent-root\n\
             streams:\n  - id: A\n    method: file\n    input_url: /a\n",
        );
        let router = build_router(hub, &config);
        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/missing.html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn resolve_refuses_traversal() {
        let root = Path::new("/srv/www");
        assert_eq!(
            resolve(root, "/player.html"),
            Some(PathBuf::from("/srv/www/player.html"))
        );
        assert_eq!(
            resolve(root, "/"),
            Some(PathBuf::from("/srv/www/index.html"))
        );
        assert_eq!(
            resolve(root, "/sub/"),
            Some(PathBuf::from("/srv/www/sub/index.html"))
        );
        assert!(resolve(root, "/../etc/passwd").is_none());
        assert!(resolve(root, "/a/../../etc/passwd").is_none());
    }

    #[test]
    fn cors_layer_only_when_enabled() {
        assert!(cors_layer(&CorsConfig::default()).is_none());
        let config = CorsConfig {
            enabled: true,
            allowed_origins: vec!["*".into()],
            allowed_methods: vec!["GET".into()],
            ..CorsConfig::default()
        };
        assert!(cors_layer(&config).is_some());
    }
}
