#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

pub const TEST_TOKEN: &str = "secret-token";

/// Canned response served by [`HttpServer`].
#[derive(Clone, Debug)]
pub struct Canned {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl Canned {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status: StatusCode::from_u16(status).expect("valid status"),
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status: StatusCode::from_u16(status).expect("valid status"),
            content_type: "text/plain; charset=utf-8",
            body: body.to_string(),
        }
    }

    pub fn raw(status: u16, content_type: &'static str, body: &str) -> Self {
        Self {
            status: StatusCode::from_u16(status).expect("valid status"),
            content_type,
            body: body.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
}

struct HttpScript {
    responses: Mutex<VecDeque<Canned>>,
    last: Mutex<Option<Canned>>,
    hits: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Serves canned responses in order; the last one repeats once the script
/// runs out.
pub struct HttpServer {
    pub addr: SocketAddr,
    script: Arc<HttpScript>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HttpServer {
    pub async fn spawn(responses: Vec<Canned>) -> Self {
        let script = Arc::new(HttpScript {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
            hits: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .fallback(scripted_response)
            .with_state(Arc::clone(&script));
        let (addr, shutdown, task) = spawn_server(app).await;
        Self {
            addr,
            script,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.script.hits.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.script.requests.lock().await.clone()
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.expect("mock http server task should join");
        }
    }
}

async fn scripted_response(
    State(script): State<Arc<HttpScript>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    script.hits.fetch_add(1, Ordering::SeqCst);
    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    script.requests.lock().await.push(RecordedRequest {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        authorization: header_value(header::AUTHORIZATION),
        content_type: header_value(header::CONTENT_TYPE),
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    let next = script.responses.lock().await.pop_front();
    let canned = match next {
        Some(canned) => {
            *script.last.lock().await = Some(canned.clone());
            canned
        }
        None => script
            .last
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| Canned::text(500, "script exhausted")),
    };

    (
        canned.status,
        [(header::CONTENT_TYPE, canned.content_type)],
        canned.body,
    )
        .into_response()
}

/// Behaviour of [`WsServer`] connections.
#[derive(Clone, Debug, Default)]
pub struct WsScript {
    /// Frames sent right after the upgrade.
    pub on_connect: Vec<String>,
    /// The first `close_first` connections are closed immediately.
    pub close_first: usize,
    /// Answer `{"type":"ping"}` with a bare `pong` frame.
    pub reply_pong: bool,
}

struct WsState {
    script: WsScript,
    connections: AtomicUsize,
    sessions: Mutex<Vec<(String, String)>>,
    received: mpsc::UnboundedSender<String>,
}

/// Websocket mock serving `/ws/debates/{session_key}`.
///
/// A client frame `{"type":"emit","frames":[...]}` makes the server send
/// each listed string back verbatim.
pub struct WsServer {
    pub addr: SocketAddr,
    state: Arc<WsState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WsServer {
    pub async fn spawn(script: WsScript) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let state = Arc::new(WsState {
            script,
            connections: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            received: received_tx,
        });
        let app = Router::new()
            .route("/ws/debates/{session_key}", get(ws_handler))
            .with_state(Arc::clone(&state));
        let (addr, shutdown, task) = spawn_server(app).await;
        (
            Self {
                addr,
                state,
                shutdown: Some(shutdown),
                task: Some(task),
            },
            received_rx,
        )
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// `(session_key, token)` pairs seen at upgrade time.
    pub async fn sessions(&self) -> Vec<(String, String)> {
        self.state.sessions.lock().await.clone()
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn ws_handler(
    State(state): State<Arc<WsState>>,
    Path(session_key): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.get("token").cloned() else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    state.sessions.lock().await.push((session_key, token));
    ws.on_upgrade(move |socket| run_ws_session(socket, state))
}

async fn run_ws_session(mut socket: WebSocket, state: Arc<WsState>) {
    let index = state.connections.fetch_add(1, Ordering::SeqCst);
    if index < state.script.close_first {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    for frame in &state.script.on_connect {
        if socket.send(Message::Text(frame.clone().into())).await.is_err() {
            return;
        }
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let text = text.as_str().to_string();
        let _ = state.received.send(text.clone());

        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("ping") if state.script.reply_pong => {
                if socket.send(Message::Text("pong".into())).await.is_err() {
                    return;
                }
            }
            Some("emit") => {
                let frames = value
                    .get("frames")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for frame in frames {
                    let Some(frame) = frame.as_str() else {
                        continue;
                    };
                    if socket
                        .send(Message::Text(frame.to_string().into()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            _ => {}
        }
    }
}

async fn spawn_server(app: Router) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}

/// Raw TCP responder that promises a longer body than it writes, then
/// closes the socket.
pub struct TruncatedServer {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TruncatedServer {
    pub async fn spawn(status_line: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind truncated server listener");
        let addr = listener.local_addr().expect("truncated server address");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::new();
                let mut buf = [0_u8; 1024];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => request.extend_from_slice(&buf[..read]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-type: text/plain\r\ncontent-length: 100\r\nconnection: close\r\n\r\n0123456789"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        Self { addr, hits, task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

/// Returns a loopback address with nothing listening on it.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    listener.local_addr().expect("probe address")
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receives the next item or panics after `limit`.
pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, limit: Duration) -> T {
    tokio::time::timeout(limit, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}
