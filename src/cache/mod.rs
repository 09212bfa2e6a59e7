//! Versioned response cache and the strategies that read and write it.
//!
//! Every cache this runtime owns is a namespace named `{prefix}-{tier}-{version}`:
//! - `static` assets are served cache-first
//! - `page-shell` documents are served stale-while-revalidate
//! - `api` reads are served network-first with a bounded wait
//!
//! Mutations never touch the cache; they go to the sync queue when delivery fails.

mod layer;
mod routes;
mod storage;
mod traits;

pub use layer::{Dispatcher, Resolution};
pub use routes::{Route, RouteTable};
pub use storage::{CacheStore, SqliteCacheStore};
pub use traits::{CacheEntry, CacheKey, CacheResult, CacheSource, CacheTier, Namespace};
