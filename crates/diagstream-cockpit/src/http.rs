//! Minimal HTTP/1.1 request head parsing and response framing.
//!
//! The server only needs the request line, the query string and a couple of
//! headers; bodies are drained and ignored.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use diagstream_types::DiagError;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use uuid::Uuid;

/// Largest request head accepted, in bytes.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Largest request body drained before responding, in bytes.
const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// The caller's request id, or a freshly generated one.
    pub fn request_id(&self) -> String {
        self.header(REQUEST_ID_HEADER)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_request_id)
    }
}

/// Read one request head (and drain any declared body) from `reader`.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, DiagError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut total = 0usize;
    loop {
        let mut line = String::new();
        // One byte past the budget, so an overlong line is detected without
        // buffering it whole.
        let budget = (MAX_HEAD_BYTES - total + 1) as u64;
        let n = (&mut *reader)
            .take(budget)
            .read_line(&mut line)
            .await
            .map_err(|e| DiagError::Server(format!("read error: {e}")))?;
        if n == 0 {
            if lines.is_empty() {
                return Ok(None);
            }
            return Err(DiagError::Server("connection closed mid-request".into()));
        }
        total += n;
        if total > MAX_HEAD_BYTES {
            return Err(DiagError::Server("request head too large".into()));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            if lines.is_empty() {
                // Tolerate stray blank lines before the request line.
                continue;
            }
            break;
        }
        lines.push(line);
    }

    let request = parse_head(&lines)?;

    if let Some(len) = request
        .header("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        let mut sink = Vec::new();
        reader
            .take(len.min(MAX_BODY_BYTES))
            .read_to_end(&mut sink)
            .await
            .map_err(|e| DiagError::Server(format!("body read error: {e}")))?;
    }

    Ok(Some(request))
}

fn parse_head(lines: &[String]) -> Result<Request, DiagError> {
    let (request_line, header_lines) = lines
        .split_first()
        .ok_or_else(|| DiagError::Server("empty request".into()))?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(DiagError::Server(format!("malformed request line: {request_line}")));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(DiagError::Server(format!("unsupported version: {version}")));
    }

    let (path, raw_query) = target.split_once('?').unwrap_or((target, ""));

    let mut headers = HashMap::new();
    for line in header_lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(DiagError::Server(format!("malformed header: {line}")));
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok(Request {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        query: parse_query(raw_query),
        headers,
    })
}

/// Decode an `application/x-www-form-urlencoded` query string.
///
/// Later duplicates win; undecodable pairs are skipped.
pub fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = urlencoding::decode(&k.replace('+', " ")).ok()?.into_owned();
            let v = urlencoding::decode(&v.replace('+', " ")).ok()?.into_owned();
            Some((k, v))
        })
        .collect()
}

/// Base-36 millisecond clock plus a random suffix.
pub fn generate_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", to_base36(millis), &random[..12])
}

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// A complete (non-streaming) response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Answering a `HEAD`: headers describe `body`, which is not sent.
    pub head_only: bool,
}

impl Response {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.to_string().into_bytes(),
            head_only: false,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            head_only: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Keep the headers (including `Content-Length`) but send no body.
    pub fn without_body(mut self) -> Self {
        self.head_only = true;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialise status line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str("Connection: close\r\n\r\n");
        let mut out = head.into_bytes();
        if !self.head_only {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

/// Status line and headers that open an event stream. The body is written
/// incrementally and ends when the connection closes.
pub fn stream_head(extra: &[(String, String)]) -> Vec<u8> {
    let mut head = String::from(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream\r\n\
         Cache-Control: no-cache\r\n\
         Connection: keep-alive\r\n\
         X-Accel-Buffering: no\r\n",
    );
    for (name, value) in extra {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    head.into_bytes()
}

pub fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "",
    }
}
