//! [`DiagnosticsServer`] – HTTP server for the diagnostics backend.
//!
//! Listens on `0.0.0.0:8000` (configurable via [`DiagnosticsServer::with_port`]).
//!
//! | Route | Effect |
//! |---|---|
//! | `GET /diagnostics/stream` | SSE bridge from the [`EventBus`] |
//! | `POST /diagnostics/emit?message=…` | publishes a `step_message` event |
//! | `GET /diagnostics/schema` | JSON Schema of the event shape |
//! | `GET /health`, `GET /api/health` | [`HealthStatus`] |
//! | `OPTIONS *` | CORS preflight |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use diagstream_middleware::EventBus;
use diagstream_types::{event_schema, DiagError, Event, HealthStatus};
use serde_json::json;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::http::{self, Request, Response, REQUEST_ID_HEADER};

/// Default TCP port for the diagnostics server.
pub const DEFAULT_PORT: u16 = 8000;

/// Idle time after which a `: keep-alive` comment is written to streams.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

/// Origin allowed by CORS outside production (the local web front end).
pub const DEV_CORS_ORIGIN: &str = "http://localhost:3000";

/// Message used by `POST /diagnostics/emit` when none is given.
pub const DEFAULT_SERVER_EMIT_MESSAGE: &str = "hello from diagnostics";

// ---------------------------------------------------------------------------
// DiagnosticsServer
// ---------------------------------------------------------------------------

/// Diagnostics backend bridging an [`EventBus`] to SSE clients.
///
/// # Example
///
/// ```rust,no_run
/// use diagstream_cockpit::DiagnosticsServer;
/// use diagstream_middleware::EventBus;
///
/// #[tokio::main]
/// async fn main() {
///     DiagnosticsServer::new(EventBus::default())
///         .run()
///         .await
///         .expect("diagnostics server failed");
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DiagnosticsServer {
    bus: EventBus,
    host: [u8; 4],
    port: u16,
    env: String,
    keepalive: Duration,
}

impl DiagnosticsServer {
    /// Create a server backed by `bus` on the [`DEFAULT_PORT`].
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            host: [0, 0, 0, 0],
            port: DEFAULT_PORT,
            env: "development".to_string(),
            keepalive: DEFAULT_KEEPALIVE,
        }
    }

    /// Override the listening port (builder-style). `0` picks a free port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bind to loopback only instead of all interfaces.
    pub fn loopback_only(mut self) -> Self {
        self.host = [127, 0, 0, 1];
        self
    }

    /// Deployment environment; CORS is disabled in `"production"`.
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    /// Idle interval between stream keep-alive comments.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    /// Bind the listener without serving yet.
    ///
    /// # Errors
    ///
    /// Returns [`DiagError::Server`] if the TCP listener cannot bind.
    pub async fn bind(self) -> Result<BoundServer, DiagError> {
        let addr = SocketAddr::from((self.host, self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DiagError::Server(format!("bind error on {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DiagError::Server(format!("local_addr: {e}")))?;

        let cors_origin = (self.env != "production").then(|| DEV_CORS_ORIGIN.to_string());
        Ok(BoundServer {
            listener,
            local_addr,
            state: Arc::new(ServerState {
                bus: self.bus,
                env: self.env,
                started: Instant::now(),
                keepalive: self.keepalive,
                cors_origin,
            }),
        })
    }

    /// Bind and serve forever.
    pub async fn run(self) -> Result<(), DiagError> {
        self.bind().await?.serve().await
    }
}

struct ServerState {
    bus: EventBus,
    env: String,
    started: Instant,
    keepalive: Duration,
    cors_origin: Option<String>,
}

impl ServerState {
    fn cors_headers(&self) -> Vec<(String, String)> {
        match &self.cors_origin {
            Some(origin) => vec![
                ("Access-Control-Allow-Origin".into(), origin.clone()),
                ("Access-Control-Allow-Methods".into(), "*".into()),
                ("Access-Control-Allow-Headers".into(), "*".into()),
            ],
            None => Vec::new(),
        }
    }
}

/// A server whose listener is bound; call [`BoundServer::serve`] to accept.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
}

impl BoundServer {
    /// Actual bound address (useful with port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections forever, one task per connection.
    pub async fn serve(self) -> Result<(), DiagError> {
        info!(addr = %self.local_addr, env = %self.state.env, "diagnostics server listening");
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, state).await {
                            debug!(%peer, error = %e, "connection error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), DiagError> {
    let start = Instant::now();
    let mut stream = BufReader::new(stream);

    let request = match http::read_request(&mut stream).await {
        Ok(Some(req)) => req,
        Ok(None) => return Ok(()),
        Err(e) => {
            debug!(%peer, error = %e, "bad request");
            let resp = Response::json(400, &json!({"detail": "Bad Request"}))
                .with_header(REQUEST_ID_HEADER, http::generate_request_id());
            return write_response(stream.get_mut(), &resp).await;
        }
    };

    let request_id = request.request_id();

    if request.method == "GET" && request.path == "/diagnostics/stream" {
        info!(
            method = %request.method,
            path = %request.path,
            status_code = 200,
            request_id = %request_id,
            %peer,
            "stream opened"
        );
        let result = stream_events(stream.get_mut(), &state, &request_id).await;
        info!(request_id = %request_id, %peer, duration_ms = start.elapsed().as_millis() as u64, "stream closed");
        return result;
    }

    let mut response = route(&request, &state);
    if request.method == "HEAD" {
        response = response.without_body();
    }
    response = response.with_header(REQUEST_ID_HEADER, request_id.clone());
    for (name, value) in state.cors_headers() {
        response = response.with_header(name, value);
    }

    let result = write_response(stream.get_mut(), &response).await;
    info!(
        method = %request.method,
        path = %request.path,
        status_code = response.status,
        duration_ms = start.elapsed().as_millis() as u64,
        request_id = %request_id,
        "request"
    );
    result
}

async fn write_response(stream: &mut TcpStream, response: &Response) -> Result<(), DiagError> {
    stream
        .write_all(&response.to_bytes())
        .await
        .map_err(|e| DiagError::Server(format!("HTTP write error: {e}")))?;
    stream
        .shutdown()
        .await
        .map_err(|e| DiagError::Server(format!("HTTP shutdown error: {e}")))
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

fn route(request: &Request, state: &ServerState) -> Response {
    let method = request.method.as_str();
    match request.path.as_str() {
        _ if method == "OPTIONS" => Response::empty(204),
        "/health" | "/api/health" => match method {
            "GET" | "HEAD" => health(state),
            _ => method_not_allowed(),
        },
        "/diagnostics/emit" => match method {
            "POST" => emit(request, state),
            _ => method_not_allowed(),
        },
        "/diagnostics/schema" => match method {
            "GET" => Response::json(200, &event_schema()),
            _ => method_not_allowed(),
        },
        "/diagnostics/stream" => method_not_allowed(),
        _ => Response::json(404, &json!({"detail": "Not Found"})),
    }
}

fn method_not_allowed() -> Response {
    Response::json(405, &json!({"detail": "Method Not Allowed"}))
}

fn health(state: &ServerState) -> Response {
    let status = HealthStatus::healthy(
        state.env.clone(),
        Utc::now(),
        state.started.elapsed().as_secs_f64(),
    );
    match serde_json::to_value(&status) {
        Ok(body) => Response::json(200, &body),
        Err(e) => {
            warn!(error = %e, "health serialization failed");
            Response::json(500, &json!({"detail": "Internal Server Error"}))
        }
    }
}

fn emit(request: &Request, state: &ServerState) -> Response {
    let message = request
        .query_param("message")
        .unwrap_or(DEFAULT_SERVER_EMIT_MESSAGE);
    let event = Event::step_message(message);
    match state.bus.publish(event) {
        Ok(n) => debug!(subscribers = n, "emitted test event"),
        Err(_) => debug!("emitted test event with no stream connected"),
    }
    Response::json(200, &json!({"status": "queued"}))
}

// ---------------------------------------------------------------------------
// SSE: EventBus → client
// ---------------------------------------------------------------------------

async fn stream_events(
    stream: &mut TcpStream,
    state: &ServerState,
    request_id: &str,
) -> Result<(), DiagError> {
    let mut rx = state.bus.subscribe();

    let mut extra = state.cors_headers();
    extra.push((REQUEST_ID_HEADER.to_string(), request_id.to_string()));
    write_chunk(stream, &http::stream_head(&extra)).await?;

    loop {
        let frame = match tokio::time::timeout(state.keepalive, rx.recv()).await {
            Err(_) => ": keep-alive\n\n".to_string(),
            Ok(Ok(event)) => match event.stamped(Utc::now()).encode() {
                Ok(data) => format!("data: {data}\n\n"),
                Err(e) => {
                    warn!(error = %e, "dropping unserializable event");
                    continue;
                }
            },
            Ok(Err(RecvError::Lagged(n))) => {
                warn!(request_id, lagged_by = n, "stream client lagged; events skipped");
                continue;
            }
            Ok(Err(RecvError::Closed)) => return Ok(()),
        };
        if write_chunk(stream, frame.as_bytes()).await.is_err() {
            // Client went away.
            return Ok(());
        }
    }
}

async fn write_chunk(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), DiagError> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| DiagError::Server(format!("stream write error: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| DiagError::Server(format!("stream flush error: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
