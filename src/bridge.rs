//! Typed message channel between the runtime and open host pages.
//!
//! Nothing is shared with the page: the page posts `HostMessage`s, the runtime broadcasts
//! `RuntimeMessage`s to every connected page. Messages sent while no page is open are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::connectivity::ConnectivityState;
use crate::push::PushSubscription;
use crate::sync::{SyncTask, TaskStatus};

/// Page → runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
  tag = "type",
  rename_all = "SCREAMING_SNAKE_CASE",
  rename_all_fields = "camelCase"
)]
pub enum HostMessage {
  GetState,
  ForceSync,
  ListSyncTasks,
  DiscardSyncTask { task_id: i64 },
  RetrySyncTask { task_id: i64 },
  SubscribePush,
  UnsubscribePush,
}

/// Runtime → page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
  tag = "type",
  rename_all = "SCREAMING_SNAKE_CASE",
  rename_all_fields = "camelCase"
)]
pub enum RuntimeMessage {
  State {
    connectivity: ConnectivityState,
    pending_sync_count: usize,
    failed_sync_count: usize,
  },
  SyncResult {
    task_id: i64,
    status: TaskStatus,
  },
  SyncTasks {
    tasks: Vec<SyncTask>,
  },
  PushSubscriptionChanged {
    subscription: Option<PushSubscription>,
  },
  Error {
    message: String,
  },
}

const OUTBOUND_CAPACITY: usize = 64;

/// Runtime side of the bridge.
#[derive(Clone)]
pub struct HostBridge {
  outbound: broadcast::Sender<RuntimeMessage>,
  inbound: mpsc::UnboundedSender<HostMessage>,
}

/// Where the runtime reads page messages from.
pub struct HostInbox {
  rx: mpsc::UnboundedReceiver<HostMessage>,
}

impl HostInbox {
  pub async fn recv(&mut self) -> Option<HostMessage> {
    self.rx.recv().await
  }
}

impl HostBridge {
  pub fn channel() -> (Self, HostInbox) {
    let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
    let (inbound, rx) = mpsc::unbounded_channel();
    (Self { outbound, inbound }, HostInbox { rx })
  }

  /// Post to every open page.
  pub fn emit(&self, message: RuntimeMessage) {
    if self.outbound.send(message).is_err() {
      debug!("no page connected; runtime message dropped");
    }
  }

  /// Attach a page.
  pub fn connect(&self) -> PageHandle {
    PageHandle {
      tx: self.inbound.clone(),
      rx: self.outbound.subscribe(),
    }
  }
}

/// Page side of the bridge.
pub struct PageHandle {
  tx: mpsc::UnboundedSender<HostMessage>,
  rx: broadcast::Receiver<RuntimeMessage>,
}

impl PageHandle {
  /// Returns false once the runtime has shut down.
  pub fn post(&self, message: HostMessage) -> bool {
    self.tx.send(message).is_ok()
  }

  /// Next runtime message. Skips over messages lost to a slow reader.
  pub async fn recv(&mut self) -> Option<RuntimeMessage> {
    loop {
      match self.rx.recv().await {
        Ok(message) => return Some(message),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          debug!(skipped, "page lagged behind runtime messages");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Non-blocking variant for draining.
  pub fn try_recv(&mut self) -> Option<RuntimeMessage> {
    loop {
      match self.rx.try_recv() {
        Ok(message) => return Some(message),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }
}
