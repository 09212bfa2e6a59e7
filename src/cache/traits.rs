//! Core types for the tiered response cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::http::{Method, Response};

/// Category of cached content; each tier has its own strategy and namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheTier {
  /// Build artifacts, fonts, icons
  Static,
  /// HTML navigations
  PageShell,
  /// Data responses
  Api,
}

impl CacheTier {
  pub const ALL: [CacheTier; 3] = [Self::Static, Self::PageShell, Self::Api];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::PageShell => "page-shell",
      Self::Api => "api",
    }
  }
}

impl fmt::Display for CacheTier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CacheTier {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "static" => Ok(Self::Static),
      "page-shell" => Ok(Self::PageShell),
      "api" => Ok(Self::Api),
      other => Err(format!("unknown cache tier: {}", other)),
    }
  }
}

/// A versioned cache namespace: `{prefix}-{tier}-{version}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
  pub prefix: String,
  pub tier: CacheTier,
  pub version: String,
}

impl Namespace {
  pub fn new(prefix: &str, tier: CacheTier, version: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
      tier,
      version: version.to_string(),
    }
  }

  /// Parse a stored namespace name back. Tier names contain dashes, so match them explicitly.
  pub fn parse(name: &str) -> Option<Self> {
    CacheTier::ALL.iter().find_map(|tier| {
      let marker = format!("-{}-", tier.as_str());
      let idx = name.find(&marker)?;
      let prefix = &name[..idx];
      let version = &name[idx + marker.len()..];
      if prefix.is_empty() || version.is_empty() {
        return None;
      }
      Some(Self::new(prefix, *tier, version))
    })
  }
}

impl fmt::Display for Namespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}-{}", self.prefix, self.tier, self.version)
  }
}

/// Request identity of a cache entry. Only GET requests are ever cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub method: Method,
  pub url: String,
}

impl CacheKey {
  pub fn get(url: &url::Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: Method::Get,
      url: url.to_string(),
    }
  }
}

/// A stored response. Entries are replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub response: Response,
  pub stored_at: DateTime<Utc>,
  pub tier: CacheTier,
  /// Bumped on every replacement; used for compare-and-store.
  pub revision: i64,
}

impl CacheEntry {
  pub fn new(key: CacheKey, response: Response, tier: CacheTier) -> Self {
    Self {
      key,
      response,
      stored_at: Utc::now(),
      tier,
      revision: 0,
    }
  }
}

/// Result of resolving a request, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, revalidating: bool) -> Self {
    Self {
      data,
      source: if revalidating {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// The offline fallback document stood in for a failed navigation.
  pub fn fallback(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::OfflineFallback,
      cached_at,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, served without touching the network
  CacheFresh,
  /// Data from cache while a background refresh runs
  CacheStale,
  /// Network unavailable, serving the last cached copy
  Offline,
  /// Navigation could not be resolved; the offline document was served
  OfflineFallback,
}
