//! In-memory platform doubles shared by the unit tests.

use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::eyre::eyre;

use crate::cache::{CacheEntry, CacheKey, CacheStore, Namespace};
use crate::http::{FetchError, Request, Response};
use crate::network::Network;
use crate::push::{
  Notification, NotificationSurface, Permission, PushService, PushSubscription, SubscriptionKeys,
};

type Outcome = Result<Response, FetchError>;

#[derive(Default)]
struct Script {
  queued: HashMap<String, VecDeque<Outcome>>,
  sticky: HashMap<String, Outcome>,
  calls: Vec<Request>,
  offline: bool,
  delay: Duration,
}

/// Network double answering per URL: queued outcomes first, then the sticky one.
#[derive(Clone, Default)]
pub struct ScriptedNetwork {
  script: Arc<Mutex<Script>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_delay(self, delay: Duration) -> Self {
    self.script.lock().unwrap().delay = delay;
    self
  }

  pub fn set_delay(&self, delay: Duration) {
    self.script.lock().unwrap().delay = delay;
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .script
      .lock()
      .unwrap()
      .sticky
      .insert(url.to_string(), Ok(response));
  }

  pub fn fail(&self, url: &str, error: FetchError) {
    self
      .script
      .lock()
      .unwrap()
      .sticky
      .insert(url.to_string(), Err(error));
  }

  pub fn enqueue(&self, url: &str, outcome: Outcome) {
    self
      .script
      .lock()
      .unwrap()
      .queued
      .entry(url.to_string())
      .or_default()
      .push_back(outcome);
  }

  pub fn set_offline(&self, offline: bool) {
    self.script.lock().unwrap().offline = offline;
  }

  pub fn calls(&self) -> Vec<Request> {
    self.script.lock().unwrap().calls.clone()
  }

  pub fn call_count(&self, url: &str) -> usize {
    self
      .script
      .lock()
      .unwrap()
      .calls
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }
}

impl Network for ScriptedNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'_, Outcome> {
    Box::pin(async move {
      let delay = self.script.lock().unwrap().delay;
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }

      let mut script = self.script.lock().unwrap();
      let key = request.url.to_string();
      script.calls.push(request);
      if script.offline {
        return Err(FetchError::Offline("scripted offline".into()));
      }
      if let Some(outcome) = script.queued.get_mut(&key).and_then(VecDeque::pop_front) {
        return outcome;
      }
      script
        .sticky
        .get(&key)
        .cloned()
        .unwrap_or_else(|| Ok(Response::new(404, "not scripted")))
    })
  }
}

#[derive(Default)]
struct PushState {
  permission: Option<Permission>,
  grant_on_request: bool,
  subscribe_calls: usize,
  unsubscribed: Vec<String>,
}

/// Push platform double that hands out deterministic subscriptions.
#[derive(Clone, Default)]
pub struct FakePushService {
  state: Arc<Mutex<PushState>>,
}

impl FakePushService {
  pub fn granting() -> Self {
    let service = Self::default();
    service.state.lock().unwrap().grant_on_request = true;
    service
  }

  pub fn denying() -> Self {
    Self::default()
  }

  pub fn subscribe_calls(&self) -> usize {
    self.state.lock().unwrap().subscribe_calls
  }

  pub fn unsubscribed(&self) -> Vec<String> {
    self.state.lock().unwrap().unsubscribed.clone()
  }
}

impl PushService for FakePushService {
  fn permission(&self) -> BoxFuture<'_, Permission> {
    Box::pin(async move {
      self
        .state
        .lock()
        .unwrap()
        .permission
        .unwrap_or(Permission::Prompt)
    })
  }

  fn request_permission(&self) -> BoxFuture<'_, Permission> {
    Box::pin(async move {
      let mut state = self.state.lock().unwrap();
      let permission = if state.grant_on_request {
        Permission::Granted
      } else {
        Permission::Denied
      };
      state.permission = Some(permission);
      permission
    })
  }

  fn subscribe(
    &self,
    application_server_key: &[u8],
  ) -> BoxFuture<'_, Result<PushSubscription, String>> {
    let key_len = application_server_key.len();
    Box::pin(async move {
      let mut state = self.state.lock().unwrap();
      state.subscribe_calls += 1;
      Ok(PushSubscription {
        endpoint: format!(
          "https://push.test/send/{}-{}",
          state.subscribe_calls, key_len
        ),
        expiration_time: None,
        keys: SubscriptionKeys {
          p256dh: "BPubKey".into(),
          auth: "authsecret".into(),
        },
      })
    })
  }

  fn unsubscribe(
    &self,
    subscription: &PushSubscription,
  ) -> BoxFuture<'_, Result<(), String>> {
    let endpoint = subscription.endpoint.clone();
    Box::pin(async move {
      self.state.lock().unwrap().unsubscribed.push(endpoint);
      Ok(())
    })
  }
}

/// Notification surface that records what it was asked to do.
#[derive(Clone, Default)]
pub struct RecordingSurface {
  shown: Arc<Mutex<Vec<Notification>>>,
  opened: Arc<Mutex<Vec<String>>>,
}

impl RecordingSurface {
  pub fn shown(&self) -> Vec<Notification> {
    self.shown.lock().unwrap().clone()
  }

  pub fn opened(&self) -> Vec<String> {
    self.opened.lock().unwrap().clone()
  }
}

impl NotificationSurface for RecordingSurface {
  fn show(&self, notification: Notification) -> BoxFuture<'_, Result<(), String>> {
    Box::pin(async move {
      self.shown.lock().unwrap().push(notification);
      Ok(())
    })
  }

  fn focus_or_open(&self, url: String) -> BoxFuture<'_, Result<(), String>> {
    Box::pin(async move {
      self.opened.lock().unwrap().push(url);
      Ok(())
    })
  }
}

/// Cache store whose every operation fails, like a full or corrupted disk.
#[derive(Default)]
pub struct FailingStore {
  writes: Mutex<usize>,
}

impl FailingStore {
  /// Attempted `put`/`compare_and_put` calls.
  pub fn writes(&self) -> usize {
    *self.writes.lock().unwrap()
  }

  fn attempt_write(&self) -> color_eyre::Result<()> {
    *self.writes.lock().unwrap() += 1;
    Err(eyre!("disk I/O error"))
  }
}

impl CacheStore for FailingStore {
  fn get(
    &self,
    _namespace: &Namespace,
    _key: &CacheKey,
  ) -> color_eyre::Result<Option<CacheEntry>> {
    Err(eyre!("disk I/O error"))
  }

  fn put(&self, _namespace: &Namespace, _entry: &CacheEntry) -> color_eyre::Result<i64> {
    self.attempt_write().map(|_| 0)
  }

  fn compare_and_put(
    &self,
    _namespace: &Namespace,
    _entry: &CacheEntry,
    _expected: Option<i64>,
  ) -> color_eyre::Result<bool> {
    self.attempt_write().map(|_| false)
  }

  fn namespaces(&self) -> color_eyre::Result<Vec<String>> {
    Err(eyre!("disk I/O error"))
  }

  fn delete_namespace(&self, _name: &str) -> color_eyre::Result<usize> {
    Err(eyre!("disk I/O error"))
  }

  fn keys(&self, _namespace: &Namespace) -> color_eyre::Result<Vec<String>> {
    Err(eyre!("disk I/O error"))
  }

  fn trim(&self, _namespace: &Namespace, _max_entries: usize) -> color_eyre::Result<usize> {
    Err(eyre!("disk I/O error"))
  }
}
