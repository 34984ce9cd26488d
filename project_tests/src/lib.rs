//! # Local Test Servers
//!
//! Scripted HTTP and WebSocket servers bound to `127.0.0.1:0`, used by the
//! integration suites in `tests/` to drive the real `reqwest` and
//! `tokio-tungstenite` transports of `lib_common`.
//!
//! - [`MockHttpServer`] is an `axum` router whose fallback answers each path
//!   from a queue of [`Reply`]s and records every request it receives.
//! - [`MockWsServer`] hands every accepted WebSocket connection to the test
//!   as a [`WsPeer`] the test can push frames through or close.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as WsResponse};
use tokio_tungstenite::tungstenite::protocol::Message;

/// One scripted HTTP answer.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: String,
    /// Delay before answering.
    pub delay: Duration,
}

impl Reply {
    /// A JSON answer.
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    /// A raw text answer.
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    /// Delays this answer.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A request as seen by [`MockHttpServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: String,
    /// Path and query.
    pub target: String,
    /// Headers, names lowercased.
    pub headers: HashMap<String, String>,
    /// Body decoded as UTF-8.
    pub body: String,
}

type Routes = Arc<Mutex<HashMap<String, VecDeque<Reply>>>>;

#[derive(Clone, Default)]
struct HttpState {
    routes: Routes,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

/// HTTP server answering every path from per-path reply queues.
///
/// The last reply of a queue repeats; unknown paths get a 404.
pub struct MockHttpServer {
    addr: SocketAddr,
    state: HttpState,
    task: JoinHandle<()>,
}

impl MockHttpServer {
    /// Binds an ephemeral port and starts serving.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = HttpState::default();

        let app = Router::new().fallback(scripted_reply).with_state(state.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("mock HTTP server stopped: {}", e);
            }
        });

        Ok(Self { addr, state, task })
    }

    /// Base URL, e.g. `http://127.0.0.1:41234`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Scripts the replies for `path`.
    pub fn route(&self, path: &str, replies: Vec<Reply>) {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert(path.to_string(), replies.into());
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn next_reply(routes: &Routes, path: &str) -> Reply {
    let mut routes = routes.lock().unwrap();
    match routes.get_mut(path) {
        Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
        Some(queue) if !queue.is_empty() => queue[0].clone(),
        _ => Reply::text(404, "not found"),
    }
}

async fn scripted_reply(
    State(state): State<HttpState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        target,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    let reply = next_reply(&state.routes, uri.path());
    tokio::time::sleep(reply.delay).await;

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(CONTENT_TYPE, "application/json")], reply.body).into_response()
}

/// Command sent to a live WebSocket connection.
#[derive(Debug)]
enum WsCommand {
    Text(String),
    Close,
}

/// One accepted WebSocket connection. Dropping it closes the connection.
pub struct WsPeer {
    /// Request target of the handshake, query included.
    pub uri: String,
    tx: mpsc::UnboundedSender<WsCommand>,
}

impl WsPeer {
    /// Sends a text frame.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(WsCommand::Text(text.into()));
    }

    /// Sends a JSON value as a text frame.
    pub fn send_json(&self, value: &serde_json::Value) {
        self.send_text(value.to_string());
    }

    /// Closes the connection from the server side.
    pub fn close(&self) {
        let _ = self.tx.send(WsCommand::Close);
    }
}

/// WebSocket server handing each connection to the test.
pub struct MockWsServer {
    addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<WsPeer>,
    attempts: Arc<Mutex<Vec<tokio::time::Instant>>>,
    task: JoinHandle<()>,
}

impl MockWsServer {
    /// Accepts WebSocket handshakes on an ephemeral port.
    pub async fn start() -> std::io::Result<Self> {
        Self::bind(false).await
    }

    /// Accepts TCP connections and drops them before the handshake, so every
    /// connection attempt fails.
    pub async fn refusing() -> std::io::Result<Self> {
        Self::bind(true).await
    }

    async fn bind(refuse: bool) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (peer_tx, peers) = mpsc::unbounded_channel();
        let attempts: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::default();

        let task = tokio::spawn({
            let attempts = Arc::clone(&attempts);
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    attempts.lock().unwrap().push(tokio::time::Instant::now());
                    if refuse {
                        drop(socket);
                        continue;
                    }
                    let peer_tx = peer_tx.clone();
                    tokio::spawn(serve_ws(socket, peer_tx));
                }
            }
        });

        Ok(Self {
            addr,
            peers,
            attempts,
            task,
        })
    }

    /// Base URL, e.g. `ws://127.0.0.1:41234`.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Waits for the next accepted connection.
    pub async fn next_peer(&mut self, within: Duration) -> Option<WsPeer> {
        tokio::time::timeout(within, self.peers.recv()).await.ok().flatten()
    }

    /// When each TCP connection was accepted.
    pub fn attempts(&self) -> Vec<tokio::time::Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_ws(socket: TcpStream, peer_tx: mpsc::UnboundedSender<WsPeer>) {
    let uri = Arc::new(Mutex::new(String::new()));
    let seen = Arc::clone(&uri);
    let callback = move |req: &Request, resp: WsResponse| -> Result<WsResponse, ErrorResponse> {
        *seen.lock().unwrap() = req.uri().to_string();
        Ok(resp)
    };

    let Ok(ws) = accept_hdr_async(socket, callback).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let uri = uri.lock().unwrap().clone();
    if peer_tx.send(WsPeer { uri, tx }).is_err() {
        return;
    }

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(WsCommand::Text(text)) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(WsCommand::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}
