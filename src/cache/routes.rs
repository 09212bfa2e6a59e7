//! Request classification: which strategy handles which request.

use url::Url;

use crate::config::RoutesConfig;
use crate::http::Request;

/// Caching strategy selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Static tier: serve from cache, fetch only on a miss
  CacheFirst,
  /// Page-shell tier: serve cache immediately, refresh in the background
  StaleWhileRevalidate,
  /// Api tier: network with a bounded wait, cache as fallback
  NetworkFirst,
  /// Mutations: network only, queued for replay when delivery fails
  QueueOnFailure,
  /// Not intercepted
  Passthrough,
}

/// Routing rules for one origin and scope.
#[derive(Debug, Clone)]
pub struct RouteTable {
  origin: Url,
  scope: String,
  api_prefixes: Vec<String>,
  static_prefixes: Vec<String>,
  static_extensions: Vec<String>,
}

impl RouteTable {
  pub fn new(origin: Url, scope: &str, routes: &RoutesConfig) -> Self {
    Self {
      origin,
      scope: scope.to_string(),
      api_prefixes: routes.api_prefixes.clone(),
      static_prefixes: routes.static_prefixes.clone(),
      static_extensions: routes
        .static_extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
        .collect(),
    }
  }

  /// Whether the URL is same-origin and under the registered scope.
  pub fn in_scope(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin() && url.path().starts_with(&self.scope)
  }

  pub fn classify(&self, request: &Request) -> Route {
    if !self.in_scope(&request.url) {
      return Route::Passthrough;
    }
    if request.method.is_mutating() {
      return Route::QueueOnFailure;
    }
    if request.method != crate::http::Method::Get {
      return Route::Passthrough;
    }

    let path = request.url.path();
    if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return Route::NetworkFirst;
    }
    if request.is_navigation() {
      return Route::StaleWhileRevalidate;
    }
    if self.is_static(path) {
      return Route::CacheFirst;
    }
    Route::Passthrough
  }

  fn is_static(&self, path: &str) -> bool {
    if self.static_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return true;
    }
    let file = path.rsplit('/').next().unwrap_or_default();
    file
      .rsplit_once('.')
      .map(|(_, ext)| ext.to_ascii_lowercase())
      .is_some_and(|ext| self.static_extensions.contains(&ext))
  }
}
