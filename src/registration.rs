//! Runtime registration and the install/activate lifecycle it persists.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::db::Database;

const REGISTRATION_KEY: &str = "registration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
  Installing,
  Installed,
  Activated,
}

/// What the host registered, and how far the runtime got with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
  pub scope: String,
  pub script_hash: String,
  pub lifecycle: Lifecycle,
  /// Cache version whose precache was last stored in full
  #[serde(default)]
  pub installed_version: Option<String>,
  /// Cache version that was last activated
  pub active_version: Option<String>,
  pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterOutcome {
  /// First registration for this scope
  Installed,
  /// The script changed; a new install is due
  Updated,
  /// Same script as before; nothing to do
  Unchanged,
}

/// Persists the single registration this runtime serves.
#[derive(Clone)]
pub struct Registrar {
  db: Database,
}

impl Registrar {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  pub fn current(&self) -> Result<Option<Registration>> {
    self.db.load_state(REGISTRATION_KEY)
  }

  /// Register the runtime script at `scope`.
  ///
  /// A changed script moves the lifecycle back to `installing`. An unchanged one leaves
  /// it alone, so an interrupted install is still visible to the caller.
  pub fn register(&self, scope: &str, script: &[u8]) -> Result<RegisterOutcome> {
    let script_hash = hex::encode(Sha256::digest(script));

    let outcome = match self.current()? {
      Some(existing) if existing.scope != scope => {
        return Err(eyre!(
          "Runtime is already registered at scope {}; cannot register at {}",
          existing.scope,
          scope
        ));
      }
      Some(existing) if existing.script_hash == script_hash => {
        return Ok(RegisterOutcome::Unchanged);
      }
      Some(existing) => {
        self.db.store_state(
          REGISTRATION_KEY,
          &Registration {
            script_hash,
            lifecycle: Lifecycle::Installing,
            registered_at: Utc::now(),
            ..existing
          },
        )?;
        RegisterOutcome::Updated
      }
      None => {
        self.db.store_state(
          REGISTRATION_KEY,
          &Registration {
            scope: scope.to_string(),
            script_hash,
            lifecycle: Lifecycle::Installing,
            installed_version: None,
            active_version: None,
            registered_at: Utc::now(),
          },
        )?;
        RegisterOutcome::Installed
      }
    };

    info!(scope, ?outcome, "runtime registered");
    Ok(outcome)
  }

  pub fn mark_installed(&self, version: &str) -> Result<()> {
    self.update(|registration| {
      registration.lifecycle = Lifecycle::Installed;
      registration.installed_version = Some(version.to_string());
    })
  }

  pub fn mark_activated(&self, version: &str) -> Result<()> {
    self.update(|registration| {
      registration.lifecycle = Lifecycle::Activated;
      registration.active_version = Some(version.to_string());
    })
  }

  /// Whether `version` still has to be installed or activated.
  pub fn needs_install(&self, version: &str) -> Result<bool> {
    Ok(match self.current()? {
      Some(registration) => {
        registration.lifecycle != Lifecycle::Activated
          || registration.active_version.as_deref() != Some(version)
      }
      None => true,
    })
  }

  /// Whether the precache for `version` is already stored and only activation is left.
  pub fn is_installed(&self, version: &str) -> Result<bool> {
    Ok(self.current()?.is_some_and(|registration| {
      registration.lifecycle == Lifecycle::Installed
        && registration.installed_version.as_deref() == Some(version)
    }))
  }

  fn update(&self, f: impl FnOnce(&mut Registration)) -> Result<()> {
    let mut registration = self
      .current()?
      .ok_or_else(|| eyre!("Runtime is not registered"))?;
    f(&mut registration);
    self.db.store_state(REGISTRATION_KEY, &registration)?;
    info!(lifecycle = ?registration.lifecycle, "lifecycle advanced");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_register_is_idempotent_for_same_script() {
    let registrar = Registrar::new(Database::open_in_memory().unwrap());
    assert_eq!(registrar.register("/", b"v1 script").unwrap(), RegisterOutcome::Installed);
    assert_eq!(registrar.register("/", b"v1 script").unwrap(), RegisterOutcome::Unchanged);
    assert_eq!(registrar.register("/", b"v2 script").unwrap(), RegisterOutcome::Updated);
  }

  #[test]
  fn test_second_scope_is_rejected() {
    let registrar = Registrar::new(Database::open_in_memory().unwrap());
    registrar.register("/", b"script").unwrap();
    assert!(registrar.register("/admin/", b"script").is_err());
  }

  #[test]
  fn test_lifecycle_drives_install_decision() {
    let registrar = Registrar::new(Database::open_in_memory().unwrap());
    assert!(registrar.needs_install("v1").unwrap());

    registrar.register("/", b"script").unwrap();
    registrar.mark_installed("v1").unwrap();
    // Installed but never activated: an interrupted start resumes here.
    assert!(registrar.needs_install("v1").unwrap());
    assert!(registrar.is_installed("v1").unwrap());
    assert!(!registrar.is_installed("v2").unwrap());

    registrar.mark_activated("v1").unwrap();
    assert!(!registrar.needs_install("v1").unwrap());
    assert!(registrar.needs_install("v2").unwrap());

    registrar.register("/", b"new script").unwrap();
    let current = registrar.current().unwrap().unwrap();
    assert_eq!(current.lifecycle, Lifecycle::Installing);
    assert_eq!(current.active_version.as_deref(), Some("v1"));
  }

  #[test]
  fn test_lifecycle_requires_registration() {
    let registrar = Registrar::new(Database::open_in_memory().unwrap());
    assert!(registrar.mark_installed("v1").is_err());
  }
}
