//! HTTP surface: device writes, chart queries and the chart page.
//!
//! Store calls block on SQLite, so every handler hops onto the blocking pool.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tower_http::cors::CorsLayer;

use crate::db::models::{Measurement, WindowPoint};
use crate::db::store::{Store, StoreError};
use crate::services::ingest::{IngestHandler, WriteResponse};
use crate::services::query::{QueryHandler, RECENT_WINDOW};

const CHART_TEMPLATE: &str = include_str!("chart.html");

#[derive(Clone)]
pub struct AppState {
    pub ingest: IngestHandler,
    pub query: QueryHandler,
}

impl AppState {
    pub fn new(store: Arc<Store>, chart_field: Measurement) -> Self {
        AppState {
            ingest: IngestHandler::new(store.clone()),
            query: QueryHandler::new(store, chart_field),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/data", post(receive_reading))
        // plain-HTTP alias for devices that cannot follow an HTTPS redirect
        .route("/data_http", post(receive_reading))
        .route("/latest", get(latest))
        .route("/latest/{field}", get(latest_for_field))
        .route("/chart", get(chart_page))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested; draining in-flight requests"),
        Err(e) => {
            error!("Unable to listen for Ctrl-C ({}); running until killed", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn receive_reading(State(state): State<AppState>, body: Bytes) -> Response {
    let ingest = state.ingest;
    let outcome = match tokio::task::spawn_blocking(move || ingest.handle(&body)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Ingest task failed: {}", e);
            return server_error("ingest task failed");
        }
    };
    let (status, response) = WriteResponse::from_outcome(&outcome);
    (status, Json(response)).into_response()
}

async fn latest(State(state): State<AppState>) -> Response {
    let query = state.query;
    let field = query.field();
    window_response(field, tokio::task::spawn_blocking(move || query.latest()).await)
}

async fn latest_for_field(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let field = match name.parse::<Measurement>() {
        Ok(field) => field,
        Err(reason) => {
            return (StatusCode::NOT_FOUND, Json(json!({"status": "fail", "reason": reason}))).into_response();
        }
    };
    let query = state.query;
    window_response(field, tokio::task::spawn_blocking(move || query.latest_for(field)).await)
}

fn window_response(field: Measurement, joined: Result<Result<Vec<WindowPoint>, StoreError>, JoinError>) -> Response {
    match joined {
        Ok(Ok(points)) => Json(points).into_response(),
        Ok(Err(e)) => {
            error!("Failed to read {} window: {}", field, e);
            server_error(&e.to_string())
        }
        Err(e) => {
            error!("Query task failed: {}", e);
            server_error("query task failed")
        }
    }
}

async fn chart_page(State(state): State<AppState>) -> Html<String> {
    let field = state.query.field();
    Html(
        CHART_TEMPLATE
            .replace("{{LABEL}}", field.label())
            .replace("{{WINDOW}}", &RECENT_WINDOW.to_string())
            .replace("{{SOURCE}}", "/latest"),
    )
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn server_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"status": "error", "message": message})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::temp_store;
    use diesel::connection::SimpleConnection;
    use diesel::{Connection, SqliteConnection};
    use serde_json::Value;
    use tempfile::TempDir;

    struct TestServer {
        // dropped first so the server stops before its database goes away
        _runtime: tokio::runtime::Runtime,
        base: String,
        store: Arc<Store>,
        _dir: TempDir,
    }

    impl TestServer {
        fn start(chart_field: Measurement) -> Self {
            let (dir, store) = temp_store();
            let store = Arc::new(store);
            let state = AppState::new(store.clone(), chart_field);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("runtime");
            let listener = runtime
                .block_on(TcpListener::bind("127.0.0.1:0"))
                .expect("bind");
            let addr = listener.local_addr().expect("local addr");
            runtime.spawn(async move {
                let _ = axum::serve(listener, router(state)).await;
            });

            TestServer {
                _runtime: runtime,
                base: format!("http://{}", addr),
                store,
                _dir: dir,
            }
        }

        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }
    }

    fn agent() -> ureq::Agent {
        ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into()
    }

    fn post_json(server: &TestServer, path: &str, body: &str) -> (u16, Value) {
        let mut resp = agent()
            .post(server.url(path))
            .header("Content-Type", "application/json")
            .send(body)
            .expect("request");
        let status = resp.status().as_u16();
        (status, resp.body_mut().read_json::<Value>().expect("json body"))
    }

    fn get_json(server: &TestServer, path: &str) -> (u16, Value) {
        let mut resp = agent().get(server.url(path)).call().expect("request");
        let status = resp.status().as_u16();
        (status, resp.body_mut().read_json::<Value>().expect("json body"))
    }

    #[test]
    fn write_then_read_latest() {
        let server = TestServer::start(Measurement::Noise);

        let (status, body) = post_json(&server, "/data", r#"{"noise": 5, "temperature": 20.5}"#);
        assert_eq!(status, 200);
        assert_eq!(body, json!({"status": "success"}));

        let (status, body) = get_json(&server, "/latest");
        assert_eq!(status, 200);
        let rows = body.as_array().expect("array");
        assert_eq!(rows.len(), 1);
        assert!(rows[0][0].is_string());
        assert_eq!(rows[0][1], json!(5));
    }

    #[test]
    fn alias_route_accepts_writes() {
        let server = TestServer::start(Measurement::Noise);
        let (status, body) = post_json(&server, "/data_http", r#"{"luminance": 300}"#);
        assert_eq!(status, 200);
        assert_eq!(body, json!({"status": "success"}));
        assert_eq!(server.store.count().expect("count"), 1);
    }

    #[test]
    fn empty_body_is_rejected() {
        let server = TestServer::start(Measurement::Noise);
        let mut resp = agent().post(server.url("/data")).send_empty().expect("request");
        assert_eq!(resp.status().as_u16(), 400);
        let body = resp.body_mut().read_json::<Value>().expect("json body");
        assert_eq!(body, json!({"status": "fail", "reason": "No JSON"}));
        assert_eq!(server.store.count().expect("count"), 0);
    }

    #[test]
    fn invalid_field_is_rejected() {
        let server = TestServer::start(Measurement::Noise);
        let (status, body) = post_json(&server, "/data", r#"{"noise": "loud"}"#);
        assert_eq!(status, 400);
        assert_eq!(body["status"], json!("error"));
        assert!(body["message"].as_str().expect("message").contains("noise"));
        assert_eq!(server.store.count().expect("count"), 0);
    }

    #[test]
    fn serves_other_fields_by_name() {
        let server = TestServer::start(Measurement::Noise);
        post_json(&server, "/data", r#"{"temperature": 19.5, "noise": 3}"#);

        let (status, body) = get_json(&server, "/latest/temperature");
        assert_eq!(status, 200);
        assert_eq!(body[0][1], json!(19.5));

        let (status, body) = get_json(&server, "/latest/pressure");
        assert_eq!(status, 404);
        assert_eq!(body["status"], json!("fail"));
    }

    #[test]
    fn empty_store_serves_empty_array() {
        let server = TestServer::start(Measurement::Temperature);
        let (status, body) = get_json(&server, "/latest");
        assert_eq!(status, 200);
        assert_eq!(body, json!([]));
    }

    fn header<'a>(resp: &'a http::Response<ureq::Body>, name: &str) -> Option<&'a str> {
        resp.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn responses_allow_any_origin() {
        let server = TestServer::start(Measurement::Noise);
        let resp = agent()
            .get(server.url("/latest"))
            .header("Origin", "http://dashboard.example")
            .call()
            .expect("request");
        assert_eq!(header(&resp, "access-control-allow-origin"), Some("*"));
    }

    #[test]
    fn cross_origin_preflight_for_json_writes_is_accepted() {
        let server = TestServer::start(Measurement::Noise);
        let resp = agent()
            .options(server.url("/data"))
            .header("Origin", "http://dashboard.example")
            .header("Access-Control-Request-Method", "POST")
            .header("Access-Control-Request-Headers", "content-type")
            .call()
            .expect("request");

        assert!(resp.status().is_success(), "preflight status {}", resp.status());
        assert_eq!(header(&resp, "access-control-allow-origin"), Some("*"));
        let methods = header(&resp, "access-control-allow-methods").unwrap_or_default();
        assert!(methods.to_ascii_uppercase().contains("POST"), "allow-methods: {}", methods);
        let headers = header(&resp, "access-control-allow-headers").unwrap_or_default();
        assert!(headers.to_ascii_lowercase().contains("content-type"), "allow-headers: {}", headers);
        assert_eq!(server.store.count().expect("count"), 0);
    }

    #[test]
    fn window_reads_surface_storage_faults() {
        let server = TestServer::start(Measurement::Noise);
        post_json(&server, "/data", r#"{"noise": 1}"#);
        let mut other = SqliteConnection::establish(&server.store.path().to_string_lossy()).expect("connect");
        other.batch_execute("DROP TABLE sensor_data;").expect("drop");

        for path in ["/latest", "/latest/temperature"] {
            let (status, body) = get_json(&server, path);
            assert_eq!(status, 500, "{}", path);
            assert_eq!(body["status"], json!("error"), "{}", path);
            assert!(body["message"].is_string(), "{}", path);
        }
    }

    #[test]
    fn chart_page_is_labelled_with_configured_field() {
        let server = TestServer::start(Measurement::Temperature);
        let mut resp = agent().get(server.url("/chart")).call().expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        let page = resp.body_mut().read_to_string().expect("html");
        assert!(page.contains("Live Temperature (°C) (last 50 readings)"));
        assert!(page.contains("'/latest'"));
        assert!(!page.contains("{{"));
    }

    #[test]
    fn concurrent_device_writes_are_all_kept() {
        const DEVICES: i64 = 8;
        let server = TestServer::start(Measurement::Noise);

        std::thread::scope(|scope| {
            for n in 0..DEVICES {
                let server = &server;
                scope.spawn(move || {
                    let (status, _) = post_json(server, "/data", &format!(r#"{{"noise": {}}}"#, n));
                    assert_eq!(status, 200);
                });
            }
        });

        let rows = server.store.recent_readings(100).expect("read");
        assert_eq!(rows.len() as i64, DEVICES);
        assert!(rows.windows(2).all(|pair| pair[0].id < pair[1].id));
        let mut noise: Vec<i64> = rows.iter().map(|r| r.noise).collect();
        noise.sort_unstable();
        assert_eq!(noise, (0..DEVICES).collect::<Vec<_>>());
    }
}
