//! Incremental Server-Sent Events decoder.
//!
//! Network reads split frames at arbitrary byte offsets, so the decoder keeps
//! the partial line and the half-built message between calls to
//! [`SseDecoder::feed`].
//!
//! Supported framing:
//!
//! | Input | Effect |
//! |---|---|
//! | `data: <text>` | appended to the data buffer (multiple lines joined by `\n`) |
//! | `event: <name>` | sets the event name of the pending message |
//! | `id: <text>` | sets the last event id |
//! | `retry: <ms>` | reconnection delay hint (digits only) |
//! | `: <comment>` | ignored (keep-alives) |
//! | blank line | dispatches the pending message |

use tracing::trace;

/// Event name used when a frame carries no `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// One dispatched SSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    /// Event name (`"message"` unless the server set one).
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Last event id seen on this stream, if any.
    pub id: Option<String>,
    /// Reconnection delay hint in milliseconds carried by this frame.
    pub retry: Option<u64>,
}

impl SseMessage {
    /// `true` for messages a default `onmessage` listener would receive.
    pub fn is_default_event(&self) -> bool {
        self.event == DEFAULT_EVENT_NAME
    }
}

/// Stateful line decoder for one SSE connection.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    skip_lf: bool,
    first_line_seen: bool,
    data: String,
    event: String,
    last_id: Option<String>,
    retry: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `chunk` and return every message completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        let mut out = Vec::new();
        for &byte in chunk {
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut out),
                b'\r' => {
                    self.skip_lf = true;
                    self.end_line(&mut out);
                }
                _ => self.line.push(byte),
            }
        }
        out
    }

    /// Last event id seen so far.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    fn end_line(&mut self, out: &mut Vec<SseMessage>) {
        let raw = std::mem::take(&mut self.line);
        let mut line = String::from_utf8_lossy(&raw).into_owned();

        if !self.first_line_seen {
            self.first_line_seen = true;
            if let Some(rest) = line.strip_prefix('\u{feff}') {
                line = rest.to_string();
            }
        }

        if line.is_empty() {
            if let Some(msg) = self.dispatch() {
                out.push(msg);
            }
            return;
        }
        if line.starts_with(':') {
            trace!(comment = %line, "sse comment");
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };
        self.process_field(field, value);
    }

    fn process_field(&mut self, field: &str, value: &str) {
        match field {
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "event" => self.event = value.to_string(),
            "id" => {
                if !value.contains('\0') {
                    self.last_id = Some(value.to_string());
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    self.retry = value.parse().ok();
                }
            }
            other => trace!(field = other, "ignoring unknown sse field"),
        }
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = std::mem::take(&mut self.event);
        let retry = self.retry.take();
        if self.data.is_empty() {
            // A retry-only frame still has to reach the reconnect loop.
            return retry.map(|retry| SseMessage {
                event: String::new(),
                data: String::new(),
                id: self.last_id.clone(),
                retry: Some(retry),
            });
        }
        let mut data = std::mem::take(&mut self.data);
        data.pop();
        Some(SseMessage {
            event: if event.is_empty() {
                DEFAULT_EVENT_NAME.to_string()
            } else {
                event
            },
            data,
            id: self.last_id.clone(),
            retry,
        })
    }
}
