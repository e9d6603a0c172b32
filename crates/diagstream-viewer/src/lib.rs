//! `diagstream-viewer` – What the operator sees.
//!
//! # Modules
//!
//! - [`event_log`] – [`EventLog`][event_log::EventLog]: fixed-capacity,
//!   newest-first retention buffer handing out immutable
//!   [`Snapshot`][event_log::Snapshot]s.
//! - [`viewer`] – [`Viewer`][viewer::Viewer]: one mounted view. Owns exactly
//!   one feed [`Subscription`][diagstream_middleware::Subscription] and one
//!   log; unmounting disposes the former and clears the latter.

pub mod event_log;
pub mod viewer;

pub use event_log::{EventLog, Snapshot, DEFAULT_LOG_CAPACITY};
pub use viewer::{render_events, Viewer, EMPTY_PLACEHOLDER};
