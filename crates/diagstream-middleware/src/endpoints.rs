//! Backend URL resolution.
//!
//! A single base URL decides the origin for the feed, emit and health
//! endpoints. Trailing slashes are stripped before paths are appended.

/// Environment variable holding the backend origin.
pub const API_BASE_URL_ENV: &str = "DIAGSTREAM_API_BASE_URL";

/// Backend origin used when nothing is configured.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";

/// Fully-qualified URLs of the diagnostics backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    /// Resolve endpoints against `base` (e.g. `"http://localhost:8000/"`).
    pub fn new(base: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().trim().trim_end_matches('/').to_string(),
        }
    }

    /// Read [`API_BASE_URL_ENV`], falling back to [`DEFAULT_API_BASE_URL`].
    pub fn from_env() -> Self {
        match std::env::var(API_BASE_URL_ENV) {
            Ok(v) if !v.trim().is_empty() => Self::new(v),
            _ => Self::new(DEFAULT_API_BASE_URL),
        }
    }

    /// The normalised origin, without trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// `GET <base>/diagnostics/stream`
    pub fn stream_url(&self) -> String {
        format!("{}/diagnostics/stream", self.base)
    }

    /// `POST <base>/diagnostics/emit?message=<urlencoded>`
    pub fn emit_url(&self, message: &str) -> String {
        format!(
            "{}/diagnostics/emit?message={}",
            self.base,
            urlencoding::encode(message)
        )
    }

    /// `GET <base>/health`
    pub fn health_url(&self) -> String {
        format!("{}/health", self.base)
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_stripped() {
        let ep = Endpoints::new("http://api.local:8000/");
        assert_eq!(ep.base(), "http://api.local:8000");
        assert_eq!(ep.stream_url(), "http://api.local:8000/diagnostics/stream");
    }

    #[test]
    fn repeated_trailing_slashes_are_stripped() {
        let ep = Endpoints::new("http://api.local//");
        assert_eq!(ep.health_url(), "http://api.local/health");
    }

    #[test]
    fn base_with_path_prefix_is_kept() {
        let ep = Endpoints::new("https://example.com/backend/");
        assert_eq!(ep.stream_url(), "https://example.com/backend/diagnostics/stream");
    }

    #[test]
    fn emit_message_is_url_encoded() {
        let ep = Endpoints::default();
        assert_eq!(
            ep.emit_url("hello world & more"),
            "http://localhost:8000/diagnostics/emit?message=hello%20world%20%26%20more"
        );
    }

    #[test]
    fn from_env_prefers_variable() {
        // SAFETY: single-threaded test; no other test reads this env-var.
        unsafe { std::env::set_var(API_BASE_URL_ENV, "http://diag-host:9000/") };
        assert_eq!(Endpoints::from_env().base(), "http://diag-host:9000");
        unsafe { std::env::set_var(API_BASE_URL_ENV, "   ") };
        assert_eq!(Endpoints::from_env().base(), DEFAULT_API_BASE_URL);
        unsafe { std::env::remove_var(API_BASE_URL_ENV) };
    }
}
