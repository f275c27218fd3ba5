//! HTTP status surface advertised to discovery probes.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Result;
use axum::{extract::State, http::header, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::relay::RelayEngine;

/// Service string that identifies a station to probes.
pub const SERVICE_NAME: &str = "Geogram Station Server";

/// Geographic location advertised by a station.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// Status document served on `/api/status` and parsed back by probes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusDocument {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub callsign: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub connected_devices: u32,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Static identity advertised by this station.
#[derive(Debug, Clone)]
pub struct StationInfo {
    pub name: String,
    pub callsign: String,
    pub description: String,
    pub location: Option<Location>,
}

struct HttpState {
    engine: Arc<RelayEngine>,
    info: StationInfo,
    started: Instant,
}

fn new_state(engine: Arc<RelayEngine>, info: StationInfo) -> Arc<HttpState> {
    Arc::new(HttpState {
        engine,
        info,
        started: Instant::now(),
    })
}

fn base_router() -> Router<Arc<HttpState>> {
    Router::new()
        .route("/api/status", get(status))
        // Older stations exposed the document here; probes still try it.
        .route("/station/status", get(status))
}

/// Status routes including the landing page, for the dedicated HTTP port.
pub fn router(engine: Arc<RelayEngine>, info: StationInfo) -> Router {
    base_router()
        .route("/", get(status))
        .with_state(new_state(engine, info))
}

/// Status routes without the landing page, merged into the relay listener
/// so one station URL answers both the handshake and the status probe.
pub fn api_router(engine: Arc<RelayEngine>, info: StationInfo) -> Router {
    base_router().with_state(new_state(engine, info))
}

/// Start the status HTTP server on `addr`.
pub async fn serve_http(
    addr: SocketAddr,
    engine: Arc<RelayEngine>,
    info: StationInfo,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_http_on(listener, engine, info, shutdown).await
}

/// Serve the status endpoints on an already-bound listener.
pub async fn serve_http_on(
    listener: TcpListener,
    engine: Arc<RelayEngine>,
    info: StationInfo,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(engine, info);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn status(State(state): State<Arc<HttpState>>) -> impl axum::response::IntoResponse {
    let doc = StatusDocument {
        service: SERVICE_NAME.into(),
        name: state.info.name.clone(),
        callsign: state.info.callsign.clone(),
        description: state.info.description.clone(),
        version: env!("CARGO_PKG_VERSION").into(),
        connected_devices: state.engine.connection_count() as u32,
        uptime: state.started.elapsed().as_secs(),
        location: state.info.location.clone(),
    };
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Json(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        relay::RelayPolicy,
        replicate::Replicator,
        store::EventStore,
    };
    use reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN;
    use tempfile::TempDir;

    fn test_info() -> StationInfo {
        StationInfo {
            name: "test-station".into(),
            callsign: "X3ABC123".into(),
            description: "bench station".into(),
            location: Some(Location {
                latitude: 38.7,
                longitude: -9.1,
                city: Some("Lisbon".into()),
                country: Some("PT".into()),
            }),
        }
    }

    async fn spawn_server() -> (String, TempDir, tokio::task::JoinHandle<()>) {
        let dir = TempDir::new().unwrap();
        let store = EventStore::new(dir.path().to_path_buf());
        store.init().unwrap();
        let engine = Arc::new(RelayEngine::new(
            store,
            RelayPolicy {
                auth_required: false,
                open_relay: false,
            },
            Replicator::new(dir.path().to_path_buf(), false),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            serve_http_on(listener, engine, test_info(), std::future::pending())
                .await
                .unwrap();
        });
        (format!("http://{}", addr), dir, handle)
    }

    #[tokio::test]
    async fn api_status_reports_station() {
        let (base, _dir, handle) = spawn_server().await;
        let resp = reqwest::get(format!("{base}/api/status")).await.unwrap();
        assert_eq!(
            resp.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        let doc: StatusDocument = resp.json().await.unwrap();
        assert_eq!(doc.service, SERVICE_NAME);
        assert_eq!(doc.callsign, "X3ABC123");
        assert_eq!(doc.connected_devices, 0);
        assert_eq!(doc.location.unwrap().city.as_deref(), Some("Lisbon"));
        handle.abort();
    }

    #[tokio::test]
    async fn legacy_and_root_paths_serve_same_document() {
        let (base, _dir, handle) = spawn_server().await;
        for path in ["/station/status", "/"] {
            let doc: StatusDocument = reqwest::get(format!("{base}{path}"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(doc.service, SERVICE_NAME);
        }
        handle.abort();
    }

    #[tokio::test]
    async fn serve_http_bind_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dir = TempDir::new().unwrap();
        let store = EventStore::new(dir.path().to_path_buf());
        let engine = Arc::new(RelayEngine::new(
            store,
            RelayPolicy {
                auth_required: false,
                open_relay: false,
            },
            Replicator::new(dir.path().to_path_buf(), false),
        ));
        assert!(
            serve_http(addr, engine, test_info(), std::future::pending())
                .await
                .is_err()
        );
    }
}
