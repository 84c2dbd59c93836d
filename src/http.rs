use crate::collectors::now_unix;
use crate::control::{ControlDispatcher, KillRequest};
use crate::history::HistoryStore;
use crate::metrics::Metrics;
use crate::state::{GpuSnapshot, ServiceStatusSnapshot, SnapshotStore};
use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

const REALTIME_PERIOD: Duration = Duration::from_secs(1);
const PROXY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub store: Arc<SnapshotStore>,
    pub history: Arc<HistoryStore>,
    pub dispatcher: Arc<ControlDispatcher>,
    pub client: Client,
    pub default_endpoint: Option<String>,
    pub history_default_range_secs: u64,
    pub shutdown: watch::Receiver<bool>,
}

/// Envelope shared by the JSON routes: `data` on success, `message` on
/// failure.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            status: true,
            data: Some(data),
            message: None,
        }
    }
}

impl ApiResponse<()> {
    fn message(status: bool, message: impl Into<String>) -> Self {
        Self {
            status,
            data: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct RealtimeFrame<'a> {
    nvidia: &'a GpuSnapshot,
    ollama: &'a ServiceStatusSnapshot,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    range: Option<u64>,
    start: Option<i64>,
    end: Option<i64>,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/nvidia/now", get(nvidia_now))
        .route("/api/nvidia/history", get(nvidia_history))
        .route("/api/ollama/*path", get(ollama_handler))
        .route("/api/kill", post(kill_handler))
        .route("/api/realtime", get(realtime_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn nvidia_now(State(state): State<HttpAppState>) -> impl IntoResponse {
    let snapshot = state.store.current_gpu().await;
    if snapshot.is_empty() {
        debug!("no GPU snapshot collected yet");
    }
    Json(ApiResponse::ok(GpuSnapshot::clone(&snapshot)))
}

async fn nvidia_history(
    State(state): State<HttpAppState>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> Response {
    let params = match params {
        Ok(Query(params)) => params,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::message(false, rejection.body_text())),
            )
                .into_response();
        }
    };
    let now = now_unix();
    let bounds = match (params.start, params.end) {
        (Some(start), end) => Some((start, end.unwrap_or(now))),
        (None, Some(_)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::message(false, "end requires start")),
            )
                .into_response();
        }
        (None, None) => None,
    };
    let range = params.range.unwrap_or(state.history_default_range_secs);

    let history = state.history.clone();
    let result = tokio::task::spawn_blocking(move || match bounds {
        Some((start, end)) => history.query_range(start, end),
        None => history.query_recent(range, now),
    })
    .await;
    match result {
        Ok(Ok(records)) => {
            debug!(?bounds, range, records = records.len(), "history served");
            Json(ApiResponse::ok(records)).into_response()
        }
        Ok(Err(err)) => {
            warn!(?bounds, range, error = %err, "history query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::message(false, err.to_string())),
            )
                .into_response()
        }
        Err(err) => {
            warn!(error = %err, "history query task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::message(false, "history query aborted")),
            )
                .into_response()
        }
    }
}

/// `ps` is answered from the collected snapshot; anything else is forwarded
/// to the default endpoint.
async fn ollama_handler(
    State(state): State<HttpAppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    if path == "ps" {
        let snapshot = state.store.current_service_status().await;
        return Json(ServiceStatusSnapshot::clone(&snapshot)).into_response();
    }

    let Some(base) = state.default_endpoint.as_deref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::message(false, "no service endpoint configured")),
        )
            .into_response();
    };
    let mut url = format!("{}/api/{}", base.trim_end_matches('/'), path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(&query);
    }
    proxy_get(&state.client, &url).await
}

async fn proxy_get(client: &Client, url: &str) -> Response {
    let upstream = match client.get(url).timeout(PROXY_TIMEOUT).send().await {
        Ok(resp) => resp,
        Err(err) => {
            warn!(url, error = %err, "proxy request failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::message(false, err.to_string())),
            )
                .into_response();
        }
    };

    let status = upstream.status();
    let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
    match upstream.bytes().await {
        Ok(body) => {
            let mut response = (status, body).into_response();
            if let Some(content_type) = content_type {
                response.headers_mut().insert(CONTENT_TYPE, content_type);
            }
            response
        }
        Err(err) => {
            warn!(url, error = %err, "proxy body read failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::message(false, err.to_string())),
            )
                .into_response()
        }
    }
}

async fn kill_handler(
    State(state): State<HttpAppState>,
    body: Result<Json<KillRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            state.metrics.inc_kill_request("invalid", false);
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::message(false, rejection.body_text())),
            )
                .into_response();
        }
    };

    let outcome = state.dispatcher.dispatch(&request).await;
    state
        .metrics
        .inc_kill_request(request.kind(), outcome.success);
    Json(ApiResponse::message(outcome.success, outcome.message)).into_response()
}

async fn realtime_frame(store: &SnapshotStore) -> Result<String, serde_json::Error> {
    let gpu = store.current_gpu().await;
    let services = store.current_service_status().await;
    serde_json::to_string(&RealtimeFrame {
        nvidia: &gpu,
        ollama: &services,
    })
}

async fn realtime_handler(ws: WebSocketUpgrade, State(state): State<HttpAppState>) -> Response {
    ws.on_upgrade(move |socket| push_realtime(socket, state))
}

async fn push_realtime(mut socket: WebSocket, state: HttpAppState) {
    let mut shutdown = state.shutdown.clone();
    let mut ticker = tokio::time::interval(REALTIME_PERIOD);
    debug!("realtime client connected");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = ticker.tick() => {
                let text = match realtime_frame(&state.store).await {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode realtime frame");
                        break;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    debug!("realtime client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GpuReading;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    struct Fixture {
        state: HttpAppState,
        shutdown: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn fixture(default_endpoint: Option<String>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let history = HistoryStore::open(dir.path().join("history")).unwrap();
        let (tx, rx) = watch::channel(false);
        let state = HttpAppState {
            metrics: Metrics::new().expect("metrics init"),
            store: Arc::new(SnapshotStore::new()),
            history: Arc::new(history),
            dispatcher: Arc::new(ControlDispatcher::new(
                "/nonexistent/ollama",
                default_endpoint.clone(),
            )),
            client: Client::new(),
            default_endpoint,
            history_default_range_secs: 120,
            shutdown: rx,
        };
        Fixture {
            state,
            shutdown: tx,
            _dir: dir,
        }
    }

    fn sample(timestamp: i64) -> GpuSnapshot {
        GpuSnapshot {
            gpus: vec![GpuReading {
                device_id: "0x2684".to_string(),
                bus_id: "00000000:01:00.0".to_string(),
                name: "NVIDIA GeForce RTX 4090".to_string(),
                memory_total_bytes: 24564,
                memory_used_bytes: 1024,
                utilization_percent: 12,
                temperature_celsius: 45,
                power_draw_watts: 60.5,
                power_limit_watts: 450.0,
            }],
            processes: vec![],
            timestamp,
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let (status, body) = send(
            app,
            Request::builder().uri(uri).body(Body::empty()).unwrap(),
        )
        .await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_kill(app: Router, body: &str) -> (StatusCode, Value) {
        let (status, body) = send(
            app,
            Request::builder()
                .method("POST")
                .uri("/api/kill")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let fx = fixture(None);
        let (status, body) = send(
            build_router(fx.state.clone()),
            Request::builder().uri("/healthz").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn metrics_contains_gpu_series() {
        let fx = fixture(None);
        fx.state.metrics.update_gpu(&sample(1_700_000_000));
        let (status, body) = send(
            build_router(fx.state.clone()),
            Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("agent_uptime_seconds"));
        assert!(text.contains("agent_gpu_utilization_percent"));
        assert!(text.contains("agent_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn nvidia_now_serves_latest_snapshot() {
        let fx = fixture(None);
        let (_, body) = get_json(build_router(fx.state.clone()), "/api/nvidia/now").await;
        assert_eq!(body["status"], true);
        assert_eq!(body["data"]["timestamp"], 0);
        assert_eq!(body["data"]["gpu_info"], json!([]));

        fx.state.store.publish_gpu(sample(42)).await;
        let (status, body) = get_json(build_router(fx.state.clone()), "/api/nvidia/now").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["timestamp"], 42);
        assert_eq!(body["data"]["gpu_info"][0]["mem_used"], 1024);
    }

    #[tokio::test]
    async fn history_honours_range_and_explicit_bounds() {
        let fx = fixture(None);
        let now = now_unix();
        for ts in [now - 500, now - 30, now - 10] {
            fx.state.history.append(&sample(ts)).unwrap();
        }

        let (_, body) = get_json(
            build_router(fx.state.clone()),
            "/api/nvidia/history?range=60",
        )
        .await;
        assert_eq!(body["status"], true);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let (_, body) = get_json(build_router(fx.state.clone()), "/api/nvidia/history").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let uri = format!("/api/nvidia/history?start={}&end={}", now - 600, now - 400);
        let (_, body) = get_json(build_router(fx.state.clone()), &uri).await;
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["timestamp"], now - 500);

        let (status, body) =
            get_json(build_router(fx.state.clone()), "/api/nvidia/history?end=5").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], false);
    }

    #[tokio::test]
    async fn history_rejects_malformed_query_with_json() {
        let fx = fixture(None);
        let (status, body) =
            get_json(build_router(fx.state.clone()), "/api/nvidia/history?range=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], false);
        assert!(body["message"].as_str().unwrap().contains("invalid digit"));
    }

    #[tokio::test]
    async fn realtime_frame_carries_both_snapshots() {
        let store = SnapshotStore::new();
        store.publish_gpu(sample(31)).await;
        let frame: Value = serde_json::from_str(&realtime_frame(&store).await.unwrap()).unwrap();
        assert_eq!(frame["nvidia"]["timestamp"], 31);
        assert_eq!(frame["nvidia"]["gpu_info"][0]["device_id"], "0x2684");
        assert_eq!(frame["ollama"]["state"], "uninitialized");
    }

    #[tokio::test]
    async fn realtime_socket_pushes_until_shutdown() {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let fx = fixture(None);
        fx.state.store.publish_gpu(sample(77)).await;
        let app = build_router(fx.state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/realtime"))
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("first frame within the push period")
            .unwrap()
            .unwrap();
        let frame: Value = match first {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(frame["nvidia"]["timestamp"], 77);
        assert_eq!(frame["ollama"]["state"], "uninitialized");

        fx.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(message) = socket.next().await {
                match message {
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("socket closes after shutdown");
    }

    #[tokio::test]
    async fn kill_reports_validation_failure() {
        let fx = fixture(None);
        let (status, body) = post_kill(
            build_router(fx.state.clone()),
            r#"{"type":"process","pid":0}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], false);
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("pid must be positive"));

        let text = String::from_utf8(fx.state.metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("agent_kill_requests_total{kind=\"process\",result=\"error\"} 1"));
    }

    #[tokio::test]
    async fn kill_rejects_unknown_request_type() {
        let fx = fixture(None);
        let (status, body) =
            post_kill(build_router(fx.state.clone()), r#"{"type":"reboot"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], false);
    }

    #[tokio::test]
    async fn ollama_ps_serves_collected_status() {
        let fx = fixture(None);
        let (status, body) = get_json(build_router(fx.state.clone()), "/api/ollama/ps").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "uninitialized");

        fx.state
            .store
            .publish_service_status(ServiceStatusSnapshot::not_configured(9))
            .await;
        let (_, body) = get_json(build_router(fx.state.clone()), "/api/ollama/ps").await;
        assert_eq!(body["state"], "not_configured");
        assert_eq!(body["timestamp"], 9);
    }

    #[tokio::test]
    async fn proxy_without_endpoint_is_unavailable() {
        let fx = fixture(None);
        let (status, body) = get_json(build_router(fx.state.clone()), "/api/ollama/tags").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], false);
    }

    #[tokio::test]
    async fn proxy_forwards_to_default_endpoint() {
        let upstream = Router::new().route(
            "/api/tags",
            get(|RawQuery(q): RawQuery| async move {
                Json(json!({"models": [{"name": "llama3:8b"}], "query": q}))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let fx = fixture(Some(format!("http://{addr}")));
        let (status, body) =
            get_json(build_router(fx.state.clone()), "/api/ollama/tags?verbose=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["models"][0]["name"], "llama3:8b");
        assert_eq!(body["query"], "verbose=1");

        let (status, _) = send(
            build_router(fx.state.clone()),
            Request::builder()
                .uri("/api/ollama/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
