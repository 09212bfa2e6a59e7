//! Install-time precaching and activation-time eviction of superseded cache versions.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheKey, CacheStore, CacheTier, Namespace};
use crate::http::Request;
use crate::network::{fetch_with_timeout, Network};

/// One asset of the precache manifest, resolved to an absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestAsset {
  pub url: Url,
  pub tier: CacheTier,
  pub mandatory: bool,
}

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("mandatory assets could not be precached: {}", describe(.0))]
  MandatoryAssets(Vec<(Url, String)>),
}

fn describe(failures: &[(Url, String)]) -> String {
  failures
    .iter()
    .map(|(url, reason)| format!("{} ({})", url, reason))
    .collect::<Vec<_>>()
    .join(", ")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub stored: Vec<Url>,
  /// Optional assets that failed; install still succeeded
  pub skipped: Vec<Url>,
}

/// Owns the versioned precache namespaces.
pub struct PrecacheManager<S: CacheStore> {
  store: Arc<S>,
  network: Arc<dyn Network>,
  prefix: String,
  version: String,
  assets: Vec<ManifestAsset>,
  timeout: Duration,
}

impl<S: CacheStore> PrecacheManager<S> {
  pub fn new(
    store: Arc<S>,
    network: Arc<dyn Network>,
    prefix: &str,
    version: &str,
    assets: Vec<ManifestAsset>,
    timeout: Duration,
  ) -> Self {
    Self {
      store,
      network,
      prefix: prefix.to_string(),
      version: version.to_string(),
      assets,
      timeout,
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  fn namespace(&self, tier: CacheTier) -> Namespace {
    Namespace::new(&self.prefix, tier, &self.version)
  }

  /// Fetch and store the manifest into the current version's namespaces.
  ///
  /// Any mandatory failure fails the whole install, and namespaces this attempt created
  /// are removed so a retried install starts clean.
  pub async fn install(&self) -> Result<InstallReport, InstallError> {
    let existing: HashSet<String> = self
      .store
      .namespaces()
      .unwrap_or_default()
      .into_iter()
      .collect();

    let fetches = self.assets.iter().map(|asset| async move {
      let request = Request::get(asset.url.clone());
      let result = fetch_with_timeout(self.network.as_ref(), request, self.timeout).await;
      (asset, result)
    });

    let mut report = InstallReport::default();
    let mut mandatory_failures = Vec::new();

    for (asset, result) in join_all(fetches).await {
      let outcome = match result {
        Ok(response) if response.is_success() => {
          let entry = CacheEntry::new(CacheKey::get(&asset.url), response, asset.tier);
          self
            .store
            .put(&self.namespace(asset.tier), &entry)
            .map(|_| ())
            .map_err(|e| e.to_string())
        }
        Ok(response) => Err(format!("HTTP {}", response.status)),
        Err(e) => Err(e.to_string()),
      };

      match outcome {
        Ok(()) => {
          debug!(url = %asset.url, tier = %asset.tier, "precached");
          report.stored.push(asset.url.clone());
        }
        Err(reason) if asset.mandatory => {
          warn!(url = %asset.url, %reason, "mandatory asset failed to precache");
          mandatory_failures.push((asset.url.clone(), reason));
        }
        Err(reason) => {
          warn!(url = %asset.url, %reason, "optional asset skipped");
          report.skipped.push(asset.url.clone());
        }
      }
    }

    if !mandatory_failures.is_empty() {
      for tier in CacheTier::ALL {
        let name = self.namespace(tier).to_string();
        if !existing.contains(&name) {
          if let Err(e) = self.store.delete_namespace(&name) {
            warn!(namespace = %name, error = %e, "failed to clean up aborted install");
          }
        }
      }
      return Err(InstallError::MandatoryAssets(mandatory_failures));
    }

    info!(
      version = %self.version,
      stored = report.stored.len(),
      skipped = report.skipped.len(),
      "precache installed"
    );
    Ok(report)
  }

  /// Delete every namespace of this prefix whose version is not current.
  ///
  /// Eviction is per namespace, never per key. Returns the removed namespace names.
  pub fn activate(&self) -> color_eyre::Result<Vec<String>> {
    let mut removed = Vec::new();
    for name in self.store.namespaces()? {
      let Some(namespace) = Namespace::parse(&name) else {
        continue;
      };
      if namespace.prefix != self.prefix || namespace.version == self.version {
        continue;
      }
      let entries = self.store.delete_namespace(&name)?;
      info!(namespace = %name, entries, "evicted superseded cache");
      removed.push(name);
    }
    info!(version = %self.version, "cache version active");
    Ok(removed)
  }
}
