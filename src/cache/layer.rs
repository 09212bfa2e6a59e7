//! Strategy dispatcher that resolves intercepted requests against cache and network.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::routes::{Route, RouteTable};
use super::storage::CacheStore;
use super::traits::{CacheEntry, CacheKey, CacheResult, CacheTier, Namespace};
use crate::config::Config;
use crate::http::{FetchError, Request, Response};
use crate::network::{fetch_with_timeout, Network};
use crate::sync::{new_idempotency_key, SyncQueue};

/// How an intercepted request was resolved.
#[derive(Debug, Clone)]
pub enum Resolution {
  /// A response for the page, with where it came from
  Served(CacheResult<Response>),
  /// An api read failed and nothing was cached for it
  NoData,
  /// A mutation could not be delivered now and was queued
  Accepted { task_id: i64 },
}

impl Resolution {
  pub fn response(&self) -> Option<&Response> {
    match self {
      Self::Served(result) => Some(&result.data),
      Self::NoData | Self::Accepted { .. } => None,
    }
  }
}

/// Resolves requests by route, writing through to the cache store.
///
/// Cache write failures never fail a request; they are logged and dropped.
pub struct Dispatcher<S: CacheStore> {
  store: Arc<S>,
  network: Arc<dyn Network>,
  queue: SyncQueue,
  routes: RouteTable,
  prefix: String,
  version: String,
  offline_fallback: Url,
  network_timeout: Duration,
  max_api_entries: usize,
}

impl<S: CacheStore> Dispatcher<S> {
  pub fn new(
    store: Arc<S>,
    network: Arc<dyn Network>,
    queue: SyncQueue,
    config: &Config,
  ) -> Result<Self> {
    Ok(Self {
      store,
      network,
      queue,
      routes: RouteTable::new(config.origin.clone(), &config.scope, &config.routes),
      prefix: config.cache.prefix.clone(),
      version: config.cache.version.clone(),
      offline_fallback: config.offline_fallback_url()?,
      network_timeout: config.timeouts.network(),
      max_api_entries: config.cache.max_api_entries,
    })
  }

  fn namespace(&self, tier: CacheTier) -> Namespace {
    Namespace::new(&self.prefix, tier, &self.version)
  }

  /// Resolve one request.
  ///
  /// Errors are returned only for passthrough and cache-first misses, where there is
  /// nothing local to fall back to.
  pub async fn dispatch(&self, request: Request) -> Result<Resolution, FetchError> {
    let route = self.routes.classify(&request);
    debug!(method = %request.method, url = %request.url, ?route, "dispatching");

    match route {
      Route::CacheFirst => self.cache_first(request).await,
      Route::StaleWhileRevalidate => Ok(self.stale_while_revalidate(request).await),
      Route::NetworkFirst => Ok(self.network_first(request).await),
      Route::QueueOnFailure => self.queue_on_failure(request).await,
      Route::Passthrough => {
        let response = self.network.fetch(request).await?;
        Ok(Resolution::Served(CacheResult::from_network(response)))
      }
    }
  }

  /// Static tier: serve from cache, fetch and store only on a miss.
  async fn cache_first(&self, request: Request) -> Result<Resolution, FetchError> {
    let key = CacheKey::get(&request.url);
    if let Some(entry) = self.lookup(CacheTier::Static, &key) {
      return Ok(Resolution::Served(CacheResult::from_cache(
        entry.response,
        entry.stored_at,
        false,
      )));
    }

    let response = self.network.fetch(request).await?;
    if response.is_success() {
      self.remember(CacheTier::Static, key, &response);
    }
    Ok(Resolution::Served(CacheResult::from_network(response)))
  }

  /// Page-shell tier: answer from cache without waiting, refresh in the background.
  async fn stale_while_revalidate(&self, request: Request) -> Resolution {
    let key = CacheKey::get(&request.url);
    if let Some(entry) = self.lookup(CacheTier::PageShell, &key) {
      let this = self.clone();
      let revision = entry.revision;
      tokio::spawn(async move { this.revalidate(request, revision).await });
      return Resolution::Served(CacheResult::from_cache(
        entry.response,
        entry.stored_at,
        true,
      ));
    }

    let navigation = request.is_navigation();
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.remember(CacheTier::PageShell, key, &response);
        }
        Resolution::Served(CacheResult::from_network(response))
      }
      Err(e) if navigation => {
        debug!(error = %e, "navigation failed with nothing cached; serving offline fallback");
        Resolution::Served(self.offline_fallback())
      }
      Err(e) => {
        debug!(error = %e, "page-shell fetch failed with nothing cached");
        Resolution::Served(CacheResult::fallback(offline_response(), None))
      }
    }
  }

  /// Store a fresher copy unless something newer landed since `revision` was served.
  async fn revalidate(&self, request: Request, revision: i64) {
    let url = request.url.clone();
    let response = match self.network.fetch(request).await {
      Ok(response) if response.is_success() => response,
      Ok(response) => {
        debug!(%url, status = response.status, "revalidation got non-success; keeping cache");
        return;
      }
      Err(e) => {
        debug!(%url, error = %e, "revalidation failed; keeping cache");
        return;
      }
    };

    let entry = CacheEntry::new(CacheKey::get(&url), response, CacheTier::PageShell);
    match self
      .store
      .compare_and_put(&self.namespace(CacheTier::PageShell), &entry, Some(revision))
    {
      Ok(true) => debug!(%url, "revalidated"),
      Ok(false) => debug!(%url, "newer entry already stored; dropping refresh"),
      Err(e) => warn!(%url, error = %e, "failed to store revalidated response"),
    }
  }

  /// Api tier: network with a bounded wait, last cached copy as fallback.
  async fn network_first(&self, request: Request) -> Resolution {
    let key = CacheKey::get(&request.url);
    match fetch_with_timeout(self.network.as_ref(), request, self.network_timeout).await {
      Ok(response) if response.is_success() => {
        self.remember(CacheTier::Api, key, &response);
        Resolution::Served(CacheResult::from_network(response))
      }
      Ok(response) if response.is_server_error() => match self.lookup(CacheTier::Api, &key) {
        Some(entry) => {
          debug!(url = %key.url, status = response.status, "server error; serving cached copy");
          Resolution::Served(CacheResult::offline(entry.response, entry.stored_at))
        }
        None => Resolution::Served(CacheResult::from_network(response)),
      },
      // Client errors and redirects reach the page untouched and are never cached
      Ok(response) => Resolution::Served(CacheResult::from_network(response)),
      Err(e) => match self.lookup(CacheTier::Api, &key) {
        Some(entry) => {
          debug!(url = %key.url, error = %e, "network failed; serving cached copy");
          Resolution::Served(CacheResult::offline(entry.response, entry.stored_at))
        }
        None => {
          debug!(url = %key.url, error = %e, "network failed; nothing cached");
          Resolution::NoData
        }
      },
    }
  }

  /// Mutations: deliver now if possible, otherwise queue for replay.
  async fn queue_on_failure(&self, mut request: Request) -> Result<Resolution, FetchError> {
    // The first attempt and every replay carry the same key
    if request.idempotency_key.is_none() {
      request.idempotency_key = Some(new_idempotency_key(&request));
    }

    // Jumping ahead of queued writes to the same resource would reorder them
    let resource = request.resource_key();
    let outstanding = self.queue.has_outstanding(&resource).unwrap_or_else(|e| {
      warn!(%resource, error = %e, "failed to inspect sync queue");
      false
    });
    if outstanding {
      debug!(%resource, "resource has queued writes; queueing behind them");
      return self.enqueue(&request, None);
    }

    match fetch_with_timeout(self.network.as_ref(), request.clone(), self.network_timeout).await {
      Ok(response) if response.is_server_error() => {
        self.enqueue(&request, Some(FetchError::ServerError(response.status)))
      }
      Ok(response) => Ok(Resolution::Served(CacheResult::from_network(response))),
      Err(e) if e.is_transient() => self.enqueue(&request, Some(e)),
      Err(e) => Err(e),
    }
  }

  fn enqueue(
    &self,
    request: &Request,
    cause: Option<FetchError>,
  ) -> Result<Resolution, FetchError> {
    match self.queue.enqueue(request) {
      Ok(task) => Ok(Resolution::Accepted { task_id: task.id }),
      Err(e) => {
        warn!(url = %request.url, error = %e, "failed to queue mutation");
        Err(cause.unwrap_or_else(|| FetchError::Transport(format!("could not queue: {}", e))))
      }
    }
  }

  fn offline_fallback(&self) -> CacheResult<Response> {
    let key = CacheKey::get(&self.offline_fallback);
    for tier in [CacheTier::PageShell, CacheTier::Static] {
      if let Some(entry) = self.lookup(tier, &key) {
        return CacheResult::fallback(entry.response, Some(entry.stored_at));
      }
    }
    warn!(url = %self.offline_fallback, "offline fallback is not cached");
    CacheResult::fallback(offline_response(), None)
  }

  fn lookup(&self, tier: CacheTier, key: &CacheKey) -> Option<CacheEntry> {
    self
      .store
      .get(&self.namespace(tier), key)
      .unwrap_or_else(|e| {
        warn!(url = %key.url, error = %e, "cache read failed; treating as miss");
        None
      })
  }

  fn remember(&self, tier: CacheTier, key: CacheKey, response: &Response) {
    let namespace = self.namespace(tier);
    let entry = CacheEntry::new(key, response.clone(), tier);
    if let Err(e) = self.store.put(&namespace, &entry) {
      warn!(url = %entry.key.url, error = %e, "cache write failed");
      return;
    }
    if tier == CacheTier::Api {
      if let Err(e) = self.store.trim(&namespace, self.max_api_entries) {
        warn!(namespace = %namespace, error = %e, "failed to trim api cache");
      }
    }
  }
}

/// Stand-in served when a navigation fails and the fallback document is missing too.
fn offline_response() -> Response {
  Response::new(503, "You are offline.").with_header("content-type", "text/plain; charset=utf-8")
}

impl<S: CacheStore> Clone for Dispatcher<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      network: Arc::clone(&self.network),
      queue: self.queue.clone(),
      routes: self.routes.clone(),
      prefix: self.prefix.clone(),
      version: self.version.clone(),
      offline_fallback: self.offline_fallback.clone(),
      network_timeout: self.network_timeout,
      max_api_entries: self.max_api_entries,
    }
  }
}
