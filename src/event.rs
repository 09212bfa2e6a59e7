use std::time::Duration;
use tokio::sync::mpsc;

use crate::bridge::{HostInbox, HostMessage};
use crate::connectivity::ConnectivityState;
use crate::push::{Notification, PushSubscription};
use crate::sync::PassReport;

/// Everything the runtime reacts to
#[derive(Debug)]
pub enum RuntimeEvent {
  /// Message posted by a host page
  Host(HostMessage),
  /// Platform network-change signal
  Connectivity(ConnectivityState),
  /// Push message delivered by the platform; `None` when it carried no payload
  Push(Option<Vec<u8>>),
  /// The user clicked a notification, optionally on one of its actions
  NotificationClick {
    notification: Notification,
    action: Option<String>,
  },
  /// The platform replaced or expired the push subscription
  SubscriptionChanged(Option<PushSubscription>),
  /// Periodic background trigger
  Tick,
  /// A replay pass completed
  ReplayFinished(PassReport),
  Shutdown,
}

/// Cloneable handle for feeding platform events into the runtime
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<RuntimeEvent>,
}

impl EventSender {
  /// Returns false once the runtime has stopped listening
  pub fn send(&self, event: RuntimeEvent) -> bool {
    self.tx.send(event).is_ok()
  }

  pub fn connectivity(&self, state: ConnectivityState) -> bool {
    self.send(RuntimeEvent::Connectivity(state))
  }

  pub fn push(&self, payload: Option<Vec<u8>>) -> bool {
    self.send(RuntimeEvent::Push(payload))
  }

  pub fn shutdown(&self) -> bool {
    self.send(RuntimeEvent::Shutdown)
  }
}

/// Event queue that merges host messages, platform signals and timers
pub struct EventHandler {
  tx: mpsc::UnboundedSender<RuntimeEvent>,
  rx: mpsc::UnboundedReceiver<RuntimeEvent>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  pub fn sender(&self) -> EventSender {
    EventSender {
      tx: self.tx.clone(),
    }
  }

  /// Spawn a forwarder from the host bridge inbox
  pub fn forward_host(&self, mut inbox: HostInbox) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      while let Some(message) = inbox.recv().await {
        if tx.send(RuntimeEvent::Host(message)).is_err() {
          break;
        }
      }
    });
  }

  /// Spawn a periodic tick producer. The first tick fires one period from now.
  pub fn start_ticker(&self, period: Duration) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let start = tokio::time::Instant::now() + period;
      let mut interval = tokio::time::interval_at(start, period);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        if tx.send(RuntimeEvent::Tick).is_err() {
          break;
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<RuntimeEvent> {
    self.rx.recv().await
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}
