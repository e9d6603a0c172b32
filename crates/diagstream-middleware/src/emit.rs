//! [`EmitTrigger`] – asks the backend to synthesize one test event.
//!
//! Used as the stimulus for end-to-end checks of the feed: trigger an emit,
//! watch the event come back over the stream.

use std::sync::atomic::{AtomicBool, Ordering};

use diagstream_types::DiagError;
use tracing::{debug, info, warn};

use crate::endpoints::Endpoints;

/// Message sent when the caller does not supply one.
pub const DEFAULT_EMIT_MESSAGE: &str = "hello";

/// Result of a [`EmitTrigger::trigger`] call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// The request was sent and the backend accepted it.
    Sent,
    /// Another trigger from this instance was still in flight; nothing sent.
    Busy,
}

/// Fire-and-forget client for `POST <base>/diagnostics/emit`.
///
/// At most one request per trigger is in flight at a time.
pub struct EmitTrigger {
    http: reqwest::Client,
    endpoints: Endpoints,
    busy: AtomicBool,
}

/// Clears the busy flag when the request settles, however it settles.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EmitTrigger {
    pub fn new(endpoints: Endpoints) -> Self {
        Self::with_client(endpoints, reqwest::Client::new())
    }

    pub fn with_client(endpoints: Endpoints, http: reqwest::Client) -> Self {
        Self {
            http,
            endpoints,
            busy: AtomicBool::new(false),
        }
    }

    /// `true` while a request is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Ask the backend to publish a `step_message` event carrying `message`.
    ///
    /// Returns [`EmitOutcome::Busy`] without sending anything when an earlier
    /// call is still pending. Transport failures and non-2xx statuses are
    /// logged and returned as errors; there is no retry. The response body is
    /// ignored.
    pub async fn trigger(&self, message: &str) -> Result<EmitOutcome, DiagError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("emit already in flight; ignoring trigger");
            return Ok(EmitOutcome::Busy);
        }
        let _guard = BusyGuard(&self.busy);

        let url = self.endpoints.emit_url(message);
        let response = self.http.post(&url).send().await.map_err(|e| {
            warn!(url = %url, error = %e, "emit request failed");
            DiagError::Http(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "emit rejected by backend");
            return Err(DiagError::Status {
                status: status.as_u16(),
                url,
            });
        }

        info!(text = message, "test event emitted");
        Ok(EmitOutcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Answers every request after `delay_ms`, reporting each request line.
    async fn slow_backend(delay_ms: u64, status_line: &'static str) -> (Endpoints, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut byte = [0u8; 1];
                    while !buf.ends_with(b"\r\n\r\n") {
                        match sock.read(&mut byte).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => buf.push(byte[0]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).into_owned();
                    let _ = tx.send(head.lines().next().unwrap_or_default().to_string());
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let body = r#"{"status":"queued"}"#;
                    let resp = format!(
                        "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                });
            }
        });
        (Endpoints::new(format!("http://{addr}/")), rx)
    }

    #[tokio::test]
    async fn trigger_posts_encoded_message() {
        let (endpoints, mut requests) = slow_backend(0, "HTTP/1.1 200 OK").await;
        let trigger = EmitTrigger::new(endpoints);

        let outcome = trigger.trigger("hello world").await.unwrap();
        assert_eq!(outcome, EmitOutcome::Sent);
        assert_eq!(
            requests.recv().await.unwrap(),
            "POST /diagnostics/emit?message=hello%20world HTTP/1.1"
        );
        assert!(!trigger.is_busy());
    }

    #[tokio::test]
    async fn overlapping_trigger_is_ignored_while_in_flight() {
        let (endpoints, mut requests) = slow_backend(200, "HTTP/1.1 200 OK").await;
        let trigger = EmitTrigger::new(endpoints);

        let (first, second) = tokio::join!(trigger.trigger("a"), trigger.trigger("b"));
        assert_eq!(first.unwrap(), EmitOutcome::Sent);
        assert_eq!(second.unwrap(), EmitOutcome::Busy);

        // Only one request reached the backend.
        assert!(requests.recv().await.unwrap().contains("message=a"));
        assert!(requests.try_recv().is_err());

        // Once settled, the next trigger goes through.
        assert_eq!(trigger.trigger("c").await.unwrap(), EmitOutcome::Sent);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error_and_releases_busy() {
        let (endpoints, _requests) = slow_backend(0, "HTTP/1.1 500 Internal Server Error").await;
        let trigger = EmitTrigger::new(endpoints);

        let err = trigger.trigger("x").await.unwrap_err();
        assert!(matches!(err, DiagError::Status { status: 500, .. }));
        assert!(!trigger.is_busy());
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_error_and_releases_busy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let trigger = EmitTrigger::new(Endpoints::new(format!("http://{addr}")));
        assert!(matches!(trigger.trigger("x").await, Err(DiagError::Http(_))));
        assert!(!trigger.is_busy());
    }
}
