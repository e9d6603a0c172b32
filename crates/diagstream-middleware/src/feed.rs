//! [`FeedClient`] – subscription to the diagnostics event stream.
//!
//! [`FeedClient::open`] spawns one Tokio task per subscription. The task
//! connects to the feed URL, decodes the SSE framing, parses each default
//! message as an [`Event`] and hands it to the caller's callback in arrival
//! order. Messages that do not decode are dropped without a callback.
//!
//! There is no transport-level auto-reconnect in `reqwest`, so the task runs
//! its own loop: on disconnect it reports a [`FeedError`], sleeps with
//! exponential backoff and reconnects. Events published while disconnected
//! are not replayed.
//!
//! The returned [`Subscription`] is the only way to stop the task.
//! [`Subscription::dispose`] takes the callback lock, so once it returns no
//! callback is running and none will run again.
//!
//! # Example
//!
//! ```rust,no_run
//! use diagstream_middleware::{Endpoints, FeedClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let endpoints = Endpoints::from_env();
//!     let sub = FeedClient::new().open(endpoints.stream_url(), |event| {
//!         println!("{} {:?}", event.kind, event.payload);
//!     });
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     sub.dispose();
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use diagstream_types::Event;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sse::SseDecoder;

/// First reconnect delay.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for the reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Floor for a server `retry:` hint.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Errors and state
// ─────────────────────────────────────────────────────────────────────────────

/// Transport-level failures reported to the optional error callback.
///
/// None of these end the subscription; the client reconnects after each.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Failed to connect to feed: {0}")]
    Connect(String),

    #[error("Feed responded with HTTP {0}")]
    Status(u16),

    #[error("Feed stream error: {0}")]
    Stream(String),

    #[error("Feed closed by server")]
    Ended,
}

/// Lifecycle of one [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

type EventHandler = Box<dyn FnMut(Event) + Send>;
type ErrorHandler = Box<dyn FnMut(&FeedError) + Send>;

struct Handlers {
    on_event: EventHandler,
    on_error: Option<ErrorHandler>,
}

struct Shared {
    url: String,
    handlers: Mutex<Option<Handlers>>,
    state: Mutex<SubscriptionState>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> SubscriptionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: SubscriptionState) {
        let mut state = lock(&self.state);
        if *state != SubscriptionState::Closed {
            *state = next;
        }
    }

    /// Hand `event` to the callback. Returns `false` once disposed.
    fn deliver(&self, event: Event) -> bool {
        let mut handlers = lock(&self.handlers);
        match handlers.as_mut() {
            Some(h) => {
                (h.on_event)(event);
                true
            }
            None => false,
        }
    }

    fn report(&self, err: &FeedError) {
        let mut handlers = lock(&self.handlers);
        if let Some(on_error) = handlers.as_mut().and_then(|h| h.on_error.as_mut()) {
            on_error(err);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Server `retry:` hint replaces the base delay, never below
    /// [`MIN_RETRY_DELAY`].
    fn set_base(&mut self, base: Duration) {
        let base = base.max(MIN_RETRY_DELAY);
        self.initial = base;
        self.max = self.max.max(base);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FeedClient
// ─────────────────────────────────────────────────────────────────────────────

/// Opens [`Subscription`]s to a diagnostics feed.
///
/// Cheap to clone; clones share the underlying HTTP connection pool.
#[derive(Debug, Clone)]
pub struct FeedClient {
    http: reqwest::Client,
    initial_delay: Duration,
    max_delay: Duration,
}

/// Builder for [`FeedClient`].
#[derive(Debug, Default)]
pub struct FeedClientBuilder {
    http: Option<reqwest::Client>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
}

impl FeedClientBuilder {
    /// Use a preconfigured HTTP client (proxies, TLS roots, …).
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Delay before the first reconnect attempt.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Cap for the exponential reconnect delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn build(self) -> FeedClient {
        FeedClient {
            http: self.http.unwrap_or_default(),
            initial_delay: self.initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY),
            max_delay: self.max_delay.unwrap_or(DEFAULT_MAX_DELAY),
        }
    }
}

impl Default for FeedClient {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl FeedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> FeedClientBuilder {
        FeedClientBuilder::default()
    }

    /// Subscribe to `url`, calling `on_event` once per decoded event.
    ///
    /// Must be called from within a Tokio runtime. The connection is
    /// initiated immediately and completes in the background.
    pub fn open<F>(&self, url: impl Into<String>, on_event: F) -> Subscription
    where
        F: FnMut(Event) + Send + 'static,
    {
        self.spawn(
            url.into(),
            Handlers {
                on_event: Box::new(on_event),
                on_error: None,
            },
        )
    }

    /// Like [`FeedClient::open`], additionally calling `on_transport_error`
    /// on every transport failure. The subscription keeps reconnecting.
    pub fn open_with_errors<F, E>(
        &self,
        url: impl Into<String>,
        on_event: F,
        on_transport_error: E,
    ) -> Subscription
    where
        F: FnMut(Event) + Send + 'static,
        E: FnMut(&FeedError) + Send + 'static,
    {
        self.spawn(
            url.into(),
            Handlers {
                on_event: Box::new(on_event),
                on_error: Some(Box::new(on_transport_error)),
            },
        )
    }

    fn spawn(&self, url: String, handlers: Handlers) -> Subscription {
        let shared = Arc::new(Shared {
            url,
            handlers: Mutex::new(Some(handlers)),
            state: Mutex::new(SubscriptionState::Connecting),
        });
        let backoff = Backoff::new(self.initial_delay, self.max_delay);
        let task = tokio::spawn(run(Arc::clone(&shared), self.http.clone(), backoff));
        Subscription {
            shared,
            task: Mutex::new(Some(task)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to one open feed connection; disposing it is the only way to stop
/// the feed.
///
/// Dropping the handle disposes it.
pub struct Subscription {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Feed URL this subscription is bound to.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    /// Close the connection and release both callbacks.
    ///
    /// Idempotent. After the first call returns, neither callback is invoked
    /// again. Must not be called from inside one of the callbacks.
    pub fn dispose(&self) {
        let released = lock(&self.shared.handlers).take();
        *lock(&self.shared.state) = SubscriptionState::Closed;
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        if released.is_some() {
            info!(url = %self.shared.url, "feed subscription closed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection task
// ─────────────────────────────────────────────────────────────────────────────

async fn run(shared: Arc<Shared>, http: reqwest::Client, mut backoff: Backoff) {
    loop {
        let err = match pump(&shared, &http, &mut backoff).await {
            Ok(()) => FeedError::Ended,
            Err(e) => e,
        };
        if shared.state() == SubscriptionState::Closed {
            return;
        }
        shared.set_state(SubscriptionState::Reconnecting);
        shared.report(&err);

        let delay = backoff.next_delay();
        warn!(url = %shared.url, error = %err, delay_ms = delay.as_millis() as u64, "feed disconnected, reconnecting");
        tokio::time::sleep(delay).await;
    }
}

/// Run one connection until it ends. `Ok(())` means the server closed the
/// stream cleanly (or the subscription was disposed mid-stream).
async fn pump(
    shared: &Shared,
    http: &reqwest::Client,
    backoff: &mut Backoff,
) -> Result<(), FeedError> {
    let response = http
        .get(&shared.url)
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .send()
        .await
        .map_err(|e| FeedError::Connect(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Status(status.as_u16()));
    }

    shared.set_state(SubscriptionState::Open);
    backoff.reset();
    info!(url = %shared.url, "feed connected");

    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| FeedError::Stream(e.to_string()))?;
        for msg in decoder.feed(&bytes) {
            if let Some(ms) = msg.retry {
                backoff.set_base(Duration::from_millis(ms));
            }
            if !msg.is_default_event() {
                debug!(event = %msg.event, "skipping non-message sse event");
                continue;
            }
            match Event::decode(&msg.data) {
                Ok(event) => {
                    if !shared.deliver(event) {
                        return Ok(());
                    }
                }
                Err(e) => debug!(error = %e, "dropping malformed feed message"),
            }
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const SSE_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
        Content-Type: text/event-stream\r\n\
        Cache-Control: no-cache\r\n\
        Connection: close\r\n\r\n";

    async fn read_head(sock: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            match sock.read(&mut byte).await {
                Ok(0) | Err(_) => return,
                Ok(_) => buf.push(byte[0]),
            }
        }
    }

    /// Serve each connection the next script in order; each script is a list
    /// of (delay, bytes) writes. The connection is held open afterwards
    /// unless `close_after` is set.
    async fn sse_server(
        scripts: Vec<Vec<(u64, &'static str)>>,
        close_after: bool,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for script in scripts {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                read_head(&mut sock).await;
                sock.write_all(SSE_HEAD).await.unwrap();
                for (delay, chunk) in script {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if sock.write_all(chunk.as_bytes()).await.is_err() {
                        break;
                    }
                }
                if close_after {
                    drop(sock);
                } else {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        drop(sock);
                    });
                }
            }
        });
        format!("http://{addr}/diagnostics/stream")
    }

    fn fast_client() -> FeedClient {
        FeedClient::builder()
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(50))
            .build()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Option<Event> {
        timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn events_arrive_in_transport_order() {
        let url = sse_server(
            vec![vec![(
                0,
                "data: {\"type\":\"x\",\"payload\":{}}\n\ndata: {\"type\":\"y\",\"payload\":{}}\n\n",
            )]],
            false,
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = fast_client().open(url, move |ev| {
            let _ = tx.send(ev);
        });

        assert_eq!(next(&mut rx).await.unwrap().kind, "x");
        assert_eq!(next(&mut rx).await.unwrap().kind, "y");
        assert_eq!(sub.state(), SubscriptionState::Open);
        sub.dispose();
    }

    #[tokio::test]
    async fn malformed_message_is_dropped_without_callback() {
        let url = sse_server(
            vec![vec![(
                0,
                "data: not json\n\ndata: {\"payload\":{}}\n\ndata: {\"type\":\"z\",\"payload\":{}}\n\n",
            )]],
            false,
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = fast_client().open(url, move |ev| {
            let _ = tx.send(ev);
        });

        assert_eq!(next(&mut rx).await.unwrap().kind, "z");
        assert!(
            timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "no further callbacks expected"
        );
        sub.dispose();
    }

    #[tokio::test]
    async fn named_events_and_keepalives_are_not_delivered() {
        let url = sse_server(
            vec![vec![(
                0,
                ": keep-alive\n\nevent: status\ndata: {\"type\":\"hidden\"}\n\ndata: {\"type\":\"shown\"}\n\n",
            )]],
            false,
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = fast_client().open(url, move |ev| {
            let _ = tx.send(ev);
        });
        assert_eq!(next(&mut rx).await.unwrap().kind, "shown");
    }

    #[tokio::test]
    async fn frame_split_over_writes_is_reassembled() {
        let url = sse_server(
            vec![vec![
                (0, "data: {\"type\":"),
                (30, "\"split\",\"payload\":{}}\n"),
                (30, "\n"),
            ]],
            false,
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = fast_client().open(url, move |ev| {
            let _ = tx.send(ev);
        });
        assert_eq!(next(&mut rx).await.unwrap().kind, "split");
    }

    #[tokio::test]
    async fn reconnects_after_server_drop() {
        let url = sse_server(
            vec![
                vec![(0, "data: {\"type\":\"a\"}\n\n")],
                vec![(0, "data: {\"type\":\"b\"}\n\n")],
            ],
            true,
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_cb = Arc::clone(&errors);
        let sub = fast_client().open_with_errors(
            url,
            move |ev| {
                let _ = tx.send(ev);
            },
            move |_err| {
                errors_cb.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert_eq!(next(&mut rx).await.unwrap().kind, "a");
        assert_eq!(next(&mut rx).await.unwrap().kind, "b");
        assert!(errors.load(Ordering::SeqCst) >= 1);
        assert!(!sub.is_closed());
        sub.dispose();
    }

    #[tokio::test]
    async fn error_status_is_reported_and_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                read_head(&mut sock).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let sub = fast_client().open_with_errors(
            format!("http://{addr}/diagnostics/stream"),
            |_ev| {},
            move |err| {
                let _ = err_tx.send(err.clone());
            },
        );

        let first = timeout(Duration::from_secs(5), err_rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, FeedError::Status(503));
        let second = timeout(Duration::from_secs(5), err_rx.recv()).await.unwrap().unwrap();
        assert_eq!(second, FeedError::Status(503));
        assert_ne!(sub.state(), SubscriptionState::Open);
        sub.dispose();
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_silences_callbacks() {
        let url = sse_server(
            vec![vec![
                (0, "data: {\"type\":\"before\"}\n\n"),
                (300, "data: {\"type\":\"after\"}\n\n"),
            ]],
            false,
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = fast_client().open(url, move |ev| {
            let _ = tx.send(ev);
        });

        assert_eq!(next(&mut rx).await.unwrap().kind, "before");
        sub.dispose();
        sub.dispose();
        assert!(sub.is_closed());

        // The callback (and its sender) were released: the channel just ends.
        let after = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(after.is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_disposes_it() {
        let url = sse_server(vec![vec![(0, "data: {\"type\":\"a\"}\n\n")]], false).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = fast_client().open(url, move |ev| {
            let _ = tx.send(ev);
        });
        assert!(next(&mut rx).await.is_some());
        drop(sub);
        let after = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(after.is_none());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_retry_hint_replaces_base() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        b.set_base(Duration::from_millis(2000));
        assert_eq!(b.next_delay(), Duration::from_millis(2000));
    }

    #[test]
    fn backoff_retry_hint_of_zero_is_floored() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        b.set_base(Duration::ZERO);
        assert_eq!(b.next_delay(), MIN_RETRY_DELAY);
        assert_eq!(b.next_delay(), MIN_RETRY_DELAY * 2);
        b.reset();
        assert_eq!(b.next_delay(), MIN_RETRY_DELAY);
    }

    #[tokio::test]
    async fn zero_retry_hint_does_not_flood_a_failing_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                read_head(&mut sock).await;
                let reply: &[u8] = if n == 0 {
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\nretry: 0\n\n"
                } else {
                    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                };
                let _ = sock.write_all(reply).await;
            }
        });

        let sub = FeedClient::new().open_with_errors(
            format!("http://{addr}/diagnostics/stream"),
            |_ev| {},
            |_err| {},
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        sub.dispose();

        let attempts = connections.load(Ordering::SeqCst);
        assert!(attempts >= 2, "expected at least one reconnect, got {attempts}");
        assert!(attempts <= 6, "reconnect loop spun: {attempts} connections in 1s");
    }
}
