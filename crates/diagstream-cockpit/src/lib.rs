//! `diagstream-cockpit` – The diagnostics backend.
//!
//! Boots a lightweight HTTP server (default port `8000`) that:
//!
//! 1. **Streams** every event published on the in-process [`EventBus`] to
//!    each connected `GET /diagnostics/stream` client as Server-Sent Events,
//!    stamping `ts` at write time and sending `: keep-alive` comments while
//!    idle.
//!
//! 2. **Accepts** `POST /diagnostics/emit?message=…` and publishes a
//!    `step_message` event, so the whole pipeline can be exercised without
//!    an agent run.
//!
//! 3. **Reports** liveness on `GET /health` and `GET /api/health`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use diagstream_cockpit::DiagnosticsServer;
//! use diagstream_middleware::EventBus;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::default();
//!     DiagnosticsServer::new(bus.clone())
//!         .with_port(8000)
//!         .run()
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! [`EventBus`]: diagstream_middleware::EventBus

pub mod http;
pub mod server;

pub use server::{
    BoundServer, DiagnosticsServer, DEFAULT_KEEPALIVE, DEFAULT_PORT, DEFAULT_SERVER_EMIT_MESSAGE,
    DEV_CORS_ORIGIN,
};
