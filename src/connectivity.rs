//! Online/offline state machine and the replay gate it drives.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;

/// Process-wide connectivity; recomputed at each start, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
  #[default]
  Online,
  Offline,
}

/// A state change worth acting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  WentOnline,
  WentOffline,
}

/// Tracks connectivity from platform signals and publishes it to watchers.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityMonitor {
  /// Start from the platform's report; unknown means online.
  pub fn new(reported: Option<ConnectivityState>) -> Self {
    let (tx, _rx) = watch::channel(reported.unwrap_or_default());
    Self { tx: Arc::new(tx) }
  }

  pub fn state(&self) -> ConnectivityState {
    *self.tx.borrow()
  }

  /// Apply a platform signal. Only an actual change yields a transition.
  pub fn apply(&self, signal: ConnectivityState) -> Option<Transition> {
    let changed = self.tx.send_if_modified(|state| {
      if *state == signal {
        false
      } else {
        *state = signal;
        true
      }
    });

    if !changed {
      return None;
    }
    info!(state = ?signal, "connectivity changed");
    Some(match signal {
      ConnectivityState::Online => Transition::WentOnline,
      ConnectivityState::Offline => Transition::WentOffline,
    })
  }
}

#[derive(Debug, Default)]
struct GateState {
  running: bool,
  follow_up: bool,
}

/// Keeps queue replay non-reentrant: a trigger during a pass queues exactly one follow-up.
#[derive(Clone, Default)]
pub struct ReplayGate {
  state: Arc<Mutex<GateState>>,
}

impl ReplayGate {
  pub fn new() -> Self {
    Self::default()
  }

  /// True if the caller should start a pass now. Otherwise a follow-up is recorded.
  pub fn try_begin(&self) -> bool {
    let Ok(mut state) = self.state.lock() else {
      return false;
    };
    if state.running {
      state.follow_up = true;
      false
    } else {
      state.running = true;
      true
    }
  }

  /// Called when a pass ends. True means a follow-up was requested and must run now;
  /// the gate stays closed for it.
  pub fn finish(&self) -> bool {
    let Ok(mut state) = self.state.lock() else {
      return false;
    };
    if state.follow_up {
      state.follow_up = false;
      true
    } else {
      state.running = false;
      false
    }
  }

  pub fn is_running(&self) -> bool {
    self.state.lock().map(|s| s.running).unwrap_or(false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unknown_initial_state_is_online() {
    assert_eq!(ConnectivityMonitor::new(None).state(), ConnectivityState::Online);
    assert_eq!(
      ConnectivityMonitor::new(Some(ConnectivityState::Offline)).state(),
      ConnectivityState::Offline
    );
  }

  #[test]
  fn test_transitions_only_on_change() {
    let monitor = ConnectivityMonitor::new(Some(ConnectivityState::Offline));

    assert_eq!(monitor.apply(ConnectivityState::Offline), None);
    assert_eq!(monitor.apply(ConnectivityState::Online), Some(Transition::WentOnline));
    assert_eq!(monitor.apply(ConnectivityState::Online), None);
    assert_eq!(monitor.apply(ConnectivityState::Offline), Some(Transition::WentOffline));
    assert_eq!(monitor.state(), ConnectivityState::Offline);
  }

  #[test]
  fn test_gate_queues_single_follow_up() {
    let gate = ReplayGate::new();
    assert!(gate.try_begin());
    // Two triggers during the pass collapse into one follow-up.
    assert!(!gate.try_begin());
    assert!(!gate.try_begin());

    assert!(gate.finish());
    assert!(gate.is_running());
    assert!(!gate.finish());
    assert!(!gate.is_running());
    assert!(gate.try_begin());
  }
}
