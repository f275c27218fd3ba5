use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use std::{fs, net::TcpListener, process::Command, time::Duration};
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_env(dir: &TempDir, http_port: u16, ws_port: u16, extra: &str) -> String {
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!(
            "DATA_ROOT={}\nBIND_HTTP=127.0.0.1:{}\nBIND_WS=127.0.0.1:{}\n{}",
            dir.path().join("data").display(),
            http_port,
            ws_port,
            extra
        ),
    )
    .unwrap();
    env_path.to_str().unwrap().to_string()
}

#[tokio::test]
async fn serve_cli_runs_status_and_relay() {
    let dir = TempDir::new().unwrap();
    let http_port = free_port();
    let ws_port = free_port();
    let env_path = write_env(&dir, http_port, ws_port, "");

    let mut child = Command::cargo_bin("geogram-station")
        .unwrap()
        .args(["--env", &env_path, "serve"])
        .spawn()
        .unwrap();

    // allow servers to start
    sleep(Duration::from_millis(300)).await;

    // the status document identifies a station service
    let url = format!("http://127.0.0.1:{}/api/status", http_port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["service"], "Geogram Station Server");

    // relay answers a subscription with EOSE
    let ws_url = format!("ws://127.0.0.1:{}/", ws_port);
    let (mut ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    let req = serde_json::json!(["REQ", "s", {}]);
    ws_stream
        .send(Message::Text(req.to_string()))
        .await
        .unwrap();
    let mut got_eose = false;
    while let Some(msg) = ws_stream.next().await {
        match msg.unwrap() {
            Message::Text(t) if t.contains("EOSE") => {
                got_eose = true;
                break;
            }
            _ => {}
        }
    }
    assert!(got_eose);

    child.kill().unwrap();
    let _ = child.wait();
}

#[tokio::test]
async fn serve_cli_requires_auth_when_configured() {
    let dir = TempDir::new().unwrap();
    let http_port = free_port();
    let ws_port = free_port();
    let env_path = write_env(&dir, http_port, ws_port, "AUTH_REQUIRED=1\n");

    let mut child = Command::cargo_bin("geogram-station")
        .unwrap()
        .args(["--env", &env_path, "serve"])
        .spawn()
        .unwrap();

    sleep(Duration::from_millis(300)).await;

    let ws_url = format!("ws://127.0.0.1:{}/", ws_port);
    let (mut ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    // the server greets with an AUTH challenge
    let mut challenge = None;
    while let Some(msg) = ws_stream.next().await {
        if let Message::Text(t) = msg.unwrap() {
            let v: serde_json::Value = serde_json::from_str(&t).unwrap();
            if v[0] == "AUTH" {
                challenge = v[1].as_str().map(|s| s.to_string());
                break;
            }
        }
    }
    assert_eq!(challenge.unwrap().len(), 32);

    child.kill().unwrap();
    let _ = child.wait();
}
