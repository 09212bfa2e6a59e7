//! Offline-resilience runtime for a web application.
//!
//! Intercepts the host's requests and resolves them against a versioned, tiered response
//! cache; queues mutations that cannot be delivered and replays them in order once the
//! network returns; manages the push subscription and renders incoming notifications.
//! All state lives in one SQLite database so the runtime can be stopped at any point.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod event;
pub mod http;
pub mod logging;
pub mod manifest;
pub mod network;
pub mod precache;
pub mod push;
pub mod registration;
pub mod runtime;
pub mod sync;

#[cfg(test)]
mod testing;

pub use runtime::{Platform, Runtime, RuntimeState, StartReport};
