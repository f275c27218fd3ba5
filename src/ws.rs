//! WebSocket front-end for the relay engine.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::mpsc::unbounded_channel};

use crate::{
    relay::RelayEngine,
    server::{self, StationInfo},
};

/// Start the relay WebSocket server on `addr`.
pub async fn serve_ws(
    addr: SocketAddr,
    engine: Arc<RelayEngine>,
    info: StationInfo,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_ws_on(listener, engine, info, shutdown).await
}

/// Serve relay connections on an already-bound listener. Binding is left to
/// the caller so lifecycle code can observe bind failures synchronously.
/// The status document rides on the same listener so a single station URL
/// answers both the relay handshake and the status probe.
pub async fn serve_ws_on(
    listener: TcpListener,
    engine: Arc<RelayEngine>,
    info: StationInfo,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = Router::new()
        .route("/", get(handler))
        .with_state(engine.clone())
        .merge(server::api_router(engine, info));
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(ws: WebSocketUpgrade, State(engine): State<Arc<RelayEngine>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move { process(socket, engine).await })
}

/// Pump one connection: register with the engine, forward its outbound
/// frames to the socket, and feed inbound text frames to the dispatcher.
async fn process(socket: WebSocket, engine: Arc<RelayEngine>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = unbounded_channel::<String>();
    let id = engine.register(tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(txt) => engine.handle_frame(id, &txt),
            Message::Close(_) => break,
            _ => {}
        }
    }

    engine.unregister(id);
    writer.abort();
}
