//! `diagstream-middleware` – Feed plumbing between the backend and viewers.
//!
//! Moves diagnostic events across process boundaries without caring about
//! their meaning.
//!
//! # Modules
//!
//! - [`sse`] – incremental Server-Sent Events frame decoder.
//! - [`feed`] – [`FeedClient`]: long-lived subscription to
//!   `GET <base>/diagnostics/stream` with an explicit reconnect loop; hands
//!   every decoded [`Event`][diagstream_types::Event] to a callback.
//! - [`emit`] – [`EmitTrigger`]: fire-and-forget `POST /diagnostics/emit`
//!   guarded by a busy flag.
//! - [`endpoints`] – [`Endpoints`]: base URL resolution shared by the feed,
//!   emit and health calls.
//! - [`bus`] – [`EventBus`]: in-process broadcast channel the diagnostics
//!   server fans events out on.

pub mod bus;
pub mod emit;
pub mod endpoints;
pub mod feed;
pub mod sse;

pub use bus::EventBus;
pub use emit::{EmitOutcome, EmitTrigger, DEFAULT_EMIT_MESSAGE};
pub use endpoints::{Endpoints, API_BASE_URL_ENV, DEFAULT_API_BASE_URL};
pub use feed::{FeedClient, FeedClientBuilder, FeedError, Subscription, SubscriptionState};
pub use sse::{SseDecoder, SseMessage};
