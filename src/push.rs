//! Push subscription lifecycle and notification rendering.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::{HostBridge, RuntimeMessage};
use crate::db::Database;

const SUBSCRIPTION_STATE_KEY: &str = "push_subscription";

/// Platform notification permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
  Granted,
  Denied,
  Prompt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
  pub p256dh: String,
  pub auth: String,
}

/// The `{endpoint, keys}` shape the server collaborator registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
  pub endpoint: String,
  #[serde(default)]
  pub expiration_time: Option<i64>,
  pub keys: SubscriptionKeys,
}

/// Persisted alongside the subscription so a key rotation forces a re-subscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSubscription {
  subscription: PushSubscription,
  application_server_key: String,
}

/// Platform push messaging service.
pub trait PushService: Send + Sync {
  fn permission(&self) -> BoxFuture<'_, Permission>;

  fn request_permission(&self) -> BoxFuture<'_, Permission>;

  fn subscribe(&self, application_server_key: &[u8])
    -> BoxFuture<'_, Result<PushSubscription, String>>;

  fn unsubscribe(&self, subscription: &PushSubscription) -> BoxFuture<'_, Result<(), String>>;
}

/// Where notifications are displayed and clicks are routed.
pub trait NotificationSurface: Send + Sync {
  fn show(&self, notification: Notification) -> BoxFuture<'_, Result<(), String>>;

  /// Focus an open page at `url`, or open one.
  fn focus_or_open(&self, url: String) -> BoxFuture<'_, Result<(), String>>;
}

#[derive(Debug, Error)]
pub enum PushError {
  #[error("notification permission was denied")]
  PermissionDenied,

  #[error("no push application key is configured")]
  MissingApplicationKey,

  #[error("push service error: {0}")]
  Platform(String),

  #[error("push state storage failed: {0}")]
  Storage(String),
}

impl From<color_eyre::Report> for PushError {
  fn from(e: color_eyre::Report) -> Self {
    Self::Storage(format!("{:#}", e))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default)]
  pub url: Option<String>,
}

/// Push payload as sent by the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct PushPayload {
  title: String,
  #[serde(default)]
  body: Option<String>,
  #[serde(default)]
  icon: Option<String>,
  #[serde(default)]
  badge: Option<String>,
  #[serde(default)]
  tag: Option<String>,
  #[serde(default)]
  url: Option<String>,
  #[serde(default)]
  actions: Vec<NotificationAction>,
  #[serde(default)]
  data: Option<serde_json::Value>,
}

/// Routing data kept with a shown notification, used when it is clicked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
  pub url: Option<String>,
  pub actions: Vec<NotificationAction>,
  #[serde(default)]
  pub extra: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: Option<String>,
  pub icon: Option<String>,
  pub badge: Option<String>,
  pub tag: Option<String>,
  pub data: NotificationData,
}

impl Notification {
  /// Parse a push payload. `None` if it is missing or malformed.
  pub fn from_payload(payload: &[u8]) -> Option<Self> {
    let payload: PushPayload = serde_json::from_slice(payload).ok()?;
    if payload.title.trim().is_empty() {
      return None;
    }
    Some(Self {
      title: payload.title,
      body: payload.body,
      icon: payload.icon,
      badge: payload.badge,
      tag: payload.tag,
      data: NotificationData {
        url: payload.url,
        actions: payload.actions,
        extra: payload.data,
      },
    })
  }

  /// Shown when a message arrived but could not be read.
  pub fn fallback(app_name: &str, icon: Option<String>) -> Self {
    Self {
      title: app_name.to_string(),
      body: Some("You have a new notification.".to_string()),
      icon,
      badge: None,
      tag: Some("fallback".to_string()),
      data: NotificationData {
        url: None,
        actions: Vec::new(),
        extra: None,
      },
    }
  }

  /// URL a click should route to: the action's, else the notification's.
  pub fn click_target(&self, action: Option<&str>) -> Option<&str> {
    action
      .and_then(|name| self.data.actions.iter().find(|a| a.action == name))
      .and_then(|a| a.url.as_deref())
      .or(self.data.url.as_deref())
  }
}

/// Opt-in/opt-out lifecycle and delivery of push messages.
#[derive(Clone)]
pub struct PushManager {
  db: Database,
  service: Arc<dyn PushService>,
  surface: Arc<dyn NotificationSurface>,
  bridge: HostBridge,
  application_server_key: Option<Vec<u8>>,
  app_name: String,
  default_icon: Option<String>,
  start_url: String,
}

impl PushManager {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    db: Database,
    service: Arc<dyn PushService>,
    surface: Arc<dyn NotificationSurface>,
    bridge: HostBridge,
    application_server_key: Option<Vec<u8>>,
    app_name: &str,
    default_icon: Option<String>,
    start_url: &str,
  ) -> Self {
    Self {
      db,
      service,
      surface,
      bridge,
      application_server_key,
      app_name: app_name.to_string(),
      default_icon,
      start_url: start_url.to_string(),
    }
  }

  /// The active subscription, if any.
  pub fn current(&self) -> Result<Option<PushSubscription>, PushError> {
    Ok(self.stored()?.map(|s| s.subscription))
  }

  fn stored(&self) -> Result<Option<StoredSubscription>, PushError> {
    Ok(self.db.load_state(SUBSCRIPTION_STATE_KEY)?)
  }

  /// Subscribe on explicit user action. Idempotent: an existing subscription made with the
  /// same application key is returned as-is.
  pub async fn subscribe(&self) -> Result<PushSubscription, PushError> {
    let key = self
      .application_server_key
      .as_deref()
      .ok_or(PushError::MissingApplicationKey)?;
    let encoded_key = hex::encode(key);

    if let Some(existing) = self.stored()? {
      if existing.application_server_key == encoded_key {
        debug!(endpoint = %existing.subscription.endpoint, "already subscribed");
        return Ok(existing.subscription);
      }
      info!("application key changed; replacing push subscription");
      self.teardown(&existing.subscription).await?;
      // The old endpoint is gone even if the new subscribe below fails.
      self.announce(None);
    }

    let permission = match self.service.permission().await {
      Permission::Granted => Permission::Granted,
      _ => self.service.request_permission().await,
    };
    if permission != Permission::Granted {
      return Err(PushError::PermissionDenied);
    }

    let subscription = self
      .service
      .subscribe(key)
      .await
      .map_err(PushError::Platform)?;
    self.db.store_state(
      SUBSCRIPTION_STATE_KEY,
      &StoredSubscription {
        subscription: subscription.clone(),
        application_server_key: encoded_key,
      },
    )?;

    info!(endpoint = %subscription.endpoint, "push subscription created");
    self.announce(Some(subscription.clone()));
    Ok(subscription)
  }

  /// Tear down the subscription. Returns false if there was none.
  pub async fn unsubscribe(&self) -> Result<bool, PushError> {
    let Some(existing) = self.stored()? else {
      return Ok(false);
    };
    self.teardown(&existing.subscription).await?;
    info!(endpoint = %existing.subscription.endpoint, "push subscription removed");
    self.announce(None);
    Ok(true)
  }

  async fn teardown(&self, subscription: &PushSubscription) -> Result<(), PushError> {
    if let Err(e) = self.service.unsubscribe(subscription).await {
      // The endpoint is dead to us either way; the server is told below.
      warn!(error = %e, "platform unsubscribe failed");
    }
    self.db.delete_state(SUBSCRIPTION_STATE_KEY)?;
    Ok(())
  }

  /// The platform rotated or expired the subscription on its own.
  pub fn subscription_changed(
    &self,
    subscription: Option<PushSubscription>,
  ) -> Result<(), PushError> {
    match (&subscription, &self.application_server_key) {
      (Some(sub), Some(key)) => self.db.store_state(
        SUBSCRIPTION_STATE_KEY,
        &StoredSubscription {
          subscription: sub.clone(),
          application_server_key: hex::encode(key),
        },
      )?,
      _ => {
        self.db.delete_state(SUBSCRIPTION_STATE_KEY)?;
      }
    }
    self.announce(subscription);
    Ok(())
  }

  fn announce(&self, subscription: Option<PushSubscription>) {
    self
      .bridge
      .emit(RuntimeMessage::PushSubscriptionChanged { subscription });
  }

  /// Handle a push event. Unreadable payloads still produce a notification.
  pub async fn receive(&self, payload: Option<&[u8]>) -> Notification {
    let notification = match payload.and_then(Notification::from_payload) {
      Some(notification) => notification,
      None => {
        warn!(
          bytes = payload.map_or(0, <[u8]>::len),
          "push payload missing or malformed; showing fallback notification"
        );
        Notification::fallback(&self.app_name, self.default_icon.clone())
      }
    };

    if let Err(e) = self.surface.show(notification.clone()).await {
      warn!(error = %e, title = %notification.title, "failed to display notification");
    }
    notification
  }

  /// Route a click to the page named by the payload.
  pub async fn click(&self, notification: &Notification, action: Option<&str>) -> String {
    let url = notification
      .click_target(action)
      .unwrap_or(&self.start_url)
      .to_string();
    if let Err(e) = self.surface.focus_or_open(url.clone()).await {
      warn!(error = %e, %url, "failed to focus or open page");
    }
    url
  }
}

/// Surface that only records notifications in the log.
pub struct LogSurface;

impl NotificationSurface for LogSurface {
  fn show(&self, notification: Notification) -> BoxFuture<'_, Result<(), String>> {
    Box::pin(async move {
      info!(
        title = %notification.title,
        body = notification.body.as_deref().unwrap_or_default(),
        url = notification.data.url.as_deref().unwrap_or_default(),
        "notification"
      );
      Ok(())
    })
  }

  fn focus_or_open(&self, url: String) -> BoxFuture<'_, Result<(), String>> {
    Box::pin(async move {
      info!(%url, "open page");
      Ok(())
    })
  }
}

/// Push service for hosts without push support: permission is always denied.
pub struct UnsupportedPush;

impl PushService for UnsupportedPush {
  fn permission(&self) -> BoxFuture<'_, Permission> {
    Box::pin(async { Permission::Denied })
  }

  fn request_permission(&self) -> BoxFuture<'_, Permission> {
    Box::pin(async { Permission::Denied })
  }

  fn subscribe(&self, _key: &[u8]) -> BoxFuture<'_, Result<PushSubscription, String>> {
    Box::pin(async { Err("push messaging is not supported on this host".to_string()) })
  }

  fn unsubscribe(&self, _subscription: &PushSubscription) -> BoxFuture<'_, Result<(), String>> {
    Box::pin(async { Ok(()) })
  }
}
