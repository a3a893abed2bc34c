//! Shared fixtures: an axum WebSocket echo server guarded by the same
//! origin validator the client uses, plus small sync helpers.

#![allow(dead_code)]

use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use parking_lot::{Condvar, Mutex};

use ferrule_client::{HandshakeRequest, HandshakeValidator};

/// Boot an echo server on an ephemeral port; returns its base URL
/// (`ws://127.0.0.1:<port>`). `/echo` echoes, `/close` closes right away.
pub async fn spawn_server(validator: HandshakeValidator) -> String {
    let app = Router::new()
        .route("/echo", get(echo_handler))
        .route("/close", get(close_handler))
        .with_state(validator);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}")
}

fn check(headers: &HeaderMap, validator: &HandshakeValidator, path: &str) -> Result<(), Response> {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let request = HandshakeRequest::new(path).with_origin_opt(origin);
    validator.evaluate(&request).map_err(|rejection| {
        let status = StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::FORBIDDEN);
        (status, rejection.reason).into_response()
    })
}

async fn echo_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(validator): State<HandshakeValidator>,
) -> Response {
    match check(&headers, &validator, "/echo") {
        Ok(()) => ws.on_upgrade(echo),
        Err(rejection) => rejection,
    }
}

async fn close_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(validator): State<HandshakeValidator>,
) -> Response {
    match check(&headers, &validator, "/close") {
        Ok(()) => ws.on_upgrade(|mut socket: WebSocket| async move {
            let _ = socket.send(Message::Close(None)).await;
        }),
        Err(rejection) => rejection,
    }
}

async fn echo(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Latch that blocks pool threads until released.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }

    pub fn release(&self) {
        *self.open.lock() = true;
        let _ = self.cv.notify_all();
    }
}
