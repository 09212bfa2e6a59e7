//! Durable sync queue for mutations that could not reach the server.
//!
//! Tasks are persisted before the caller is told "accepted", replayed strictly in id order,
//! and never skipped: a task that exhausts its attempts stays `failed` and holds back later
//! tasks for the same resource until the host retries or discards it.

mod queue;
mod replay;
mod task;

pub use queue::{QueueCounts, SyncQueue};
pub use replay::{Backoff, InFlight, PassReport, Replayer};
pub use task::{new_idempotency_key, SyncTask, TaskStatus};
