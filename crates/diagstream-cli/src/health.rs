//! Backend liveness probe against `GET /health`.

use diagstream_middleware::Endpoints;
use diagstream_types::{DiagError, HealthStatus};
use std::time::Duration;

/// Probe timeout; the feed itself has none.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Fetch and decode the backend's health report.
pub async fn fetch(endpoints: &Endpoints) -> Result<HealthStatus, DiagError> {
    let url = endpoints.health_url();
    let http = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| DiagError::Http(e.to_string()))?;

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| DiagError::Http(format!("backend unreachable at {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DiagError::Status {
            status: status.as_u16(),
            url,
        });
    }

    response
        .json::<HealthStatus>()
        .await
        .map_err(|e| DiagError::Decode(format!("malformed health report: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagstream_cockpit::DiagnosticsServer;
    use diagstream_middleware::EventBus;

    #[tokio::test]
    async fn fetches_health_from_a_live_server() {
        let bound = DiagnosticsServer::new(EventBus::default())
            .with_port(0)
            .loopback_only()
            .with_env("staging")
            .bind()
            .await
            .unwrap();
        let endpoints = Endpoints::new(format!("http://{}/", bound.local_addr()));
        tokio::spawn(bound.serve());

        let health = fetch(&endpoints).await.unwrap();
        assert!(health.ok);
        assert_eq!(health.env, "staging");
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_http_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = fetch(&Endpoints::new(format!("http://{addr}"))).await;
        assert!(matches!(result, Err(DiagError::Http(_))));
    }
}
