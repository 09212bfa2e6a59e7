//! The runtime: lifecycle at start, request interception, and the event loop.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bridge::{HostBridge, HostInbox, HostMessage, RuntimeMessage};
use crate::cache::{CacheResult, CacheTier, Dispatcher, Resolution, SqliteCacheStore};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState, ReplayGate, Transition};
use crate::db::Database;
use crate::event::{EventHandler, EventSender, RuntimeEvent};
use crate::http::{FetchError, Request};
use crate::network::Network;
use crate::precache::{InstallReport, ManifestAsset, PrecacheManager};
use crate::push::{NotificationSurface, PushManager, PushService};
use crate::registration::{RegisterOutcome, Registrar};
use crate::sync::{PassReport, Replayer, SyncQueue};

/// Host capabilities the runtime is built on.
pub struct Platform {
  pub network: Arc<dyn Network>,
  pub push: Arc<dyn PushService>,
  pub surface: Arc<dyn NotificationSurface>,
  /// Connectivity as reported at start; `None` when the platform cannot tell
  pub connectivity: Option<ConnectivityState>,
}

/// What `Runtime::start` did.
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
  pub registration: RegisterOutcome,
  pub installed: Option<Vec<String>>,
  pub skipped: Vec<String>,
  pub evicted: Vec<String>,
  pub recovered_tasks: usize,
}

/// Snapshot reported to pages and the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
  pub connectivity: ConnectivityState,
  pub pending_sync_count: usize,
  pub failed_sync_count: usize,
  pub activated: bool,
}

pub struct Runtime {
  config: Config,
  network: Arc<dyn Network>,
  dispatcher: Dispatcher<SqliteCacheStore>,
  store: Arc<SqliteCacheStore>,
  precache: PrecacheManager<SqliteCacheStore>,
  registrar: Registrar,
  queue: SyncQueue,
  replayer: Replayer,
  push: PushManager,
  connectivity: ConnectivityMonitor,
  gate: ReplayGate,
  bridge: HostBridge,
  sender: EventSender,
  /// Taken by `run`
  events: Mutex<Option<(EventHandler, HostInbox)>>,
  activated: AtomicBool,
}

impl Runtime {
  pub fn new(config: Config, db: Database, platform: Platform) -> Result<Self> {
    let store = Arc::new(SqliteCacheStore::new(db.clone()));
    let queue = SyncQueue::new(db.clone());
    let (bridge, inbox) = HostBridge::channel();
    let events = EventHandler::new();
    let sender = events.sender();

    let dispatcher = Dispatcher::new(
      Arc::clone(&store),
      Arc::clone(&platform.network),
      queue.clone(),
      &config,
    )?;

    let mut assets = config
      .precache
      .iter()
      .map(|asset| {
        Ok(ManifestAsset {
          url: config.resolve(&asset.url)?,
          tier: asset.tier,
          mandatory: asset.mandatory,
        })
      })
      .collect::<Result<Vec<_>>>()?;
    // Navigations must always have something to fall back to
    let fallback = config.offline_fallback_url()?;
    if !assets.iter().any(|asset| asset.url == fallback) {
      assets.push(ManifestAsset {
        url: fallback,
        tier: CacheTier::PageShell,
        mandatory: true,
      });
    }
    let precache = PrecacheManager::new(
      Arc::clone(&store),
      Arc::clone(&platform.network),
      &config.cache.prefix,
      &config.cache.version,
      assets,
      config.timeouts.precache(),
    );

    let replayer = Replayer::new(
      queue.clone(),
      Arc::clone(&platform.network),
      bridge.clone(),
      config.timeouts.network(),
      &config.sync,
    );

    let manifest = &config.app_manifest;
    let push = PushManager::new(
      db.clone(),
      platform.push,
      platform.surface,
      bridge.clone(),
      config.push.decoded_key()?,
      &manifest.name,
      manifest.icon_urls().next().map(str::to_string),
      &manifest.start_url,
    );

    let registrar = Registrar::new(db);
    let activated =
      registrar.current()?.is_some() && !registrar.needs_install(&config.cache.version)?;

    Ok(Self {
      network: platform.network,
      connectivity: ConnectivityMonitor::new(platform.connectivity),
      dispatcher,
      store,
      precache,
      registrar,
      queue,
      replayer,
      push,
      gate: ReplayGate::new(),
      bridge,
      sender,
      events: Mutex::new(Some((events, inbox))),
      activated: AtomicBool::new(activated),
      config,
    })
  }

  pub fn bridge(&self) -> &HostBridge {
    &self.bridge
  }

  /// Handle for platform signals, push deliveries and shutdown.
  pub fn events(&self) -> EventSender {
    self.sender.clone()
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn store(&self) -> &SqliteCacheStore {
    &self.store
  }

  pub fn push(&self) -> &PushManager {
    &self.push
  }

  pub fn registrar(&self) -> &Registrar {
    &self.registrar
  }

  pub fn is_activated(&self) -> bool {
    self.activated.load(Ordering::Acquire)
  }

  /// Register, then install and activate whatever is outstanding.
  ///
  /// An install that fails on a mandatory asset leaves the lifecycle at `installing`;
  /// calling `start` again retries it.
  pub async fn start(&self, script: &[u8]) -> Result<StartReport> {
    let registration = self.registrar.register(&self.config.scope, script)?;
    let mut report = StartReport {
      registration,
      installed: None,
      skipped: Vec::new(),
      evicted: Vec::new(),
      recovered_tasks: 0,
    };

    let version = self.precache.version().to_string();
    if registration != RegisterOutcome::Unchanged || self.registrar.needs_install(&version)? {
      if !self.registrar.is_installed(&version)? {
        self.activated.store(false, Ordering::Release);
        let InstallReport { stored, skipped } = self.precache.install().await?;
        self.registrar.mark_installed(&version)?;
        report.installed = Some(stored.iter().map(ToString::to_string).collect());
        report.skipped = skipped.iter().map(ToString::to_string).collect();
      }
      report.evicted = self.precache.activate()?;
      self.registrar.mark_activated(&version)?;
    }

    report.recovered_tasks = self.queue.recover_in_flight()?;
    self.activated.store(true, Ordering::Release);
    info!(scope = %self.config.scope, %version, "runtime active");

    if self.connectivity.state() == ConnectivityState::Online && self.queue.counts()?.pending > 0 {
      self.trigger_replay();
    }
    Ok(report)
  }

  /// Interception entry point for every request the host issues.
  ///
  /// Before activation nothing is intercepted and requests go straight to the network.
  pub async fn fetch(&self, request: Request) -> Result<Resolution, FetchError> {
    if !self.is_activated() {
      let response = self.network.fetch(request).await?;
      return Ok(Resolution::Served(CacheResult::from_network(response)));
    }
    self.dispatcher.dispatch(request).await
  }

  pub fn state(&self) -> Result<RuntimeState> {
    let counts = self.queue.counts()?;
    Ok(RuntimeState {
      connectivity: self.connectivity.state(),
      pending_sync_count: counts.pending,
      failed_sync_count: counts.failed,
      activated: self.is_activated(),
    })
  }

  /// Run replay passes to completion on the caller's task.
  pub async fn sync_now(&self) -> Result<PassReport> {
    if !self.gate.try_begin() {
      return Err(eyre!("A replay pass is already running"));
    }
    let mut combined = PassReport::default();
    loop {
      let result = self.replayer.run_pass().await;
      let follow_up = self.gate.finish();
      let report = result?;
      combined.delivered.extend(report.delivered);
      combined.failed.extend(report.failed);
      combined.deferred = report.deferred;
      combined.next_retry_at = report.next_retry_at;
      if !follow_up {
        return Ok(combined);
      }
    }
  }

  /// Process events until shutdown.
  pub async fn run(&self) -> Result<()> {
    let (mut events, inbox) = self
      .events
      .lock()
      .map_err(|_| eyre!("Runtime event state is poisoned"))?
      .take()
      .ok_or_else(|| eyre!("Runtime is already running"))?;

    events.forward_host(inbox);
    if let Some(secs) = self.config.sync.periodic_interval_secs {
      events.start_ticker(Duration::from_secs(secs));
    }

    let mut retry_at: Option<Instant> = None;
    loop {
      let event = match retry_at {
        Some(deadline) => tokio::select! {
          event = events.next() => event,
          _ = tokio::time::sleep_until(deadline) => {
            retry_at = None;
            Some(RuntimeEvent::Tick)
          }
        },
        None => events.next().await,
      };

      match event {
        None | Some(RuntimeEvent::Shutdown) => break,
        Some(RuntimeEvent::ReplayFinished(report)) => {
          retry_at = report.next_retry_at.map(|at| {
            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            Instant::now() + wait
          });
          self.emit_state();
        }
        Some(event) => self.handle(event).await,
      }
    }

    info!("runtime stopped");
    Ok(())
  }

  async fn handle(&self, event: RuntimeEvent) {
    match event {
      RuntimeEvent::Host(message) => self.handle_host(message).await,
      RuntimeEvent::Connectivity(signal) => {
        if let Some(transition) = self.connectivity.apply(signal) {
          if transition == Transition::WentOnline {
            self.trigger_replay();
          }
          self.emit_state();
        }
      }
      RuntimeEvent::Push(payload) => {
        self.push.receive(payload.as_deref()).await;
      }
      RuntimeEvent::NotificationClick {
        notification,
        action,
      } => {
        self.push.click(&notification, action.as_deref()).await;
      }
      RuntimeEvent::SubscriptionChanged(subscription) => {
        if let Err(e) = self.push.subscription_changed(subscription) {
          self.report_error(e);
        }
      }
      RuntimeEvent::Tick => {
        if self.connectivity.state() == ConnectivityState::Online {
          self.trigger_replay();
        }
      }
      RuntimeEvent::ReplayFinished(_) | RuntimeEvent::Shutdown => {}
    }
  }

  async fn handle_host(&self, message: HostMessage) {
    debug!(?message, "host message");
    match message {
      HostMessage::GetState => self.emit_state(),
      HostMessage::ForceSync => self.trigger_replay(),
      HostMessage::ListSyncTasks => match self.queue.list() {
        Ok(tasks) => self.bridge.emit(RuntimeMessage::SyncTasks { tasks }),
        Err(e) => self.report_error(e),
      },
      HostMessage::DiscardSyncTask { task_id } => match self.queue.discard(task_id) {
        Ok(true) => self.emit_state(),
        Ok(false) => self.report_error(format!("No sync task {}", task_id)),
        Err(e) => self.report_error(e),
      },
      HostMessage::RetrySyncTask { task_id } => match self.queue.retry(task_id) {
        Ok(true) => {
          self.emit_state();
          if self.connectivity.state() == ConnectivityState::Online {
            self.trigger_replay();
          }
        }
        Ok(false) => self.report_error(format!("Sync task {} is not failed", task_id)),
        Err(e) => self.report_error(e),
      },
      HostMessage::SubscribePush => {
        if let Err(e) = self.push.subscribe().await {
          self.report_error(e);
        }
      }
      HostMessage::UnsubscribePush => {
        if let Err(e) = self.push.unsubscribe().await {
          self.report_error(e);
        }
      }
    }
  }

  /// Start a replay pass on its own task unless one is running, in which case a single
  /// follow-up pass is queued behind it.
  fn trigger_replay(&self) {
    if !self.gate.try_begin() {
      debug!("replay already running; follow-up queued");
      return;
    }

    let replayer = self.replayer.clone();
    let gate = self.gate.clone();
    let bridge = self.bridge.clone();
    let sender = self.sender.clone();
    tokio::spawn(async move {
      loop {
        let report = match replayer.run_pass().await {
          Ok(report) => report,
          Err(e) => {
            warn!(error = %e, "replay pass failed");
            bridge.emit(RuntimeMessage::Error {
              message: format!("Replay failed: {}", e),
            });
            PassReport::default()
          }
        };
        sender.send(RuntimeEvent::ReplayFinished(report));
        if !gate.finish() {
          break;
        }
      }
    });
  }

  fn emit_state(&self) {
    match self.state() {
      Ok(state) => self.bridge.emit(RuntimeMessage::State {
        connectivity: state.connectivity,
        pending_sync_count: state.pending_sync_count,
        failed_sync_count: state.failed_sync_count,
      }),
      Err(e) => self.report_error(e),
    }
  }

  fn report_error(&self, error: impl std::fmt::Display) {
    warn!(error = %error, "host request failed");
    self.bridge.emit(RuntimeMessage::Error {
      message: error.to_string(),
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bridge::PageHandle;
  use crate::cache::{CacheSource, CacheStore};
  use crate::config::PrecacheAsset;
  use crate::http::{Method, Response};
  use crate::sync::TaskStatus;
  use crate::testing::{FakePushService, RecordingSurface, ScriptedNetwork};
  use url::Url;

  const ORIGIN: &str = "https://app.test";

  fn href(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn config() -> Config {
    let mut config = Config::new(Url::parse(ORIGIN).unwrap());
    config.cache.prefix = "app".into();
    config.sync.base_backoff_ms = 0;
    config.precache = vec![
      PrecacheAsset {
        url: "/".into(),
        tier: CacheTier::PageShell,
        mandatory: true,
      },
      PrecacheAsset {
        url: "/offline.html".into(),
        tier: CacheTier::PageShell,
        mandatory: true,
      },
    ];
    config
  }

  fn runtime(
    config: Config,
    db: Database,
    network: &ScriptedNetwork,
    connectivity: ConnectivityState,
  ) -> Arc<Runtime> {
    let platform = Platform {
      network: Arc::new(network.clone()),
      push: Arc::new(FakePushService::granting()),
      surface: Arc::new(RecordingSurface::default()),
      connectivity: Some(connectivity),
    };
    Arc::new(Runtime::new(config, db, platform).unwrap())
  }

  fn in_memory(network: &ScriptedNetwork, connectivity: ConnectivityState) -> Arc<Runtime> {
    runtime(config(), Database::open_in_memory().unwrap(), network, connectivity)
  }

  fn serve_shell(network: &ScriptedNetwork) {
    network.respond(&href("/"), Response::ok("<html>shell</html>"));
    network.respond(&href("/offline.html"), Response::ok("<html>offline</html>"));
  }

  fn contact_form(name: &str) -> Request {
    Request::new(Method::Post, Url::parse(&href("/api/contact")).unwrap())
      .with_header("content-type", "application/json")
      .with_body(format!("{{\"name\":\"{}\"}}", name))
  }

  async fn next_message(
    page: &mut PageHandle,
    wanted: impl Fn(&RuntimeMessage) -> bool,
  ) -> RuntimeMessage {
    loop {
      let message = tokio::time::timeout(Duration::from_secs(5), page.recv())
        .await
        .expect("timed out waiting for runtime message")
        .expect("bridge closed");
      if wanted(&message) {
        return message;
      }
    }
  }

  async fn sync_result(page: &mut PageHandle) -> (i64, TaskStatus) {
    match next_message(page, |m| matches!(m, RuntimeMessage::SyncResult { .. })).await {
      RuntimeMessage::SyncResult { task_id, status } => (task_id, status),
      _ => unreachable!(),
    }
  }

  #[tokio::test]
  async fn test_offline_submissions_replay_in_order_when_back_online() {
    let network = ScriptedNetwork::new();
    serve_shell(&network);
    let rt = in_memory(&network, ConnectivityState::Offline);
    rt.start(b"runtime v1").await.unwrap();
    let mut page = rt.bridge().connect();
    let runner = tokio::spawn({
      let rt = Arc::clone(&rt);
      async move { rt.run().await }
    });

    network.set_offline(true);
    let first = rt.fetch(contact_form("Ada")).await.unwrap();
    let second = rt.fetch(contact_form("Grace")).await.unwrap();
    assert!(matches!(first, Resolution::Accepted { task_id: 1 }));
    assert!(matches!(second, Resolution::Accepted { task_id: 2 }));

    network.set_offline(false);
    network.respond(&href("/api/contact"), Response::new(201, "created"));
    rt.events().connectivity(ConnectivityState::Online);

    assert_eq!(sync_result(&mut page).await, (1, TaskStatus::Done));
    assert_eq!(sync_result(&mut page).await, (2, TaskStatus::Done));

    let bodies: Vec<_> = network
      .calls()
      .into_iter()
      .filter(|r| r.url.path() == "/api/contact")
      .filter_map(|r| r.body)
      .collect();
    // One failed attempt for the first submission, then exactly one delivery each.
    assert_eq!(
      bodies,
      vec![
        b"{\"name\":\"Ada\"}".to_vec(),
        b"{\"name\":\"Ada\"}".to_vec(),
        b"{\"name\":\"Grace\"}".to_vec()
      ]
    );
    assert_eq!(rt.queue().counts().unwrap().pending, 0);

    rt.events().shutdown();
    runner.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_queued_tasks_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime.db");
    let network = ScriptedNetwork::new();
    serve_shell(&network);

    {
      let db = Database::open(&path).unwrap();
      let rt = runtime(config(), db, &network, ConnectivityState::Offline);
      rt.start(b"runtime v1").await.unwrap();
      network.set_offline(true);
      rt.fetch(contact_form("Ada")).await.unwrap();
    }

    network.set_offline(false);
    network.respond(&href("/api/contact"), Response::new(200, "ok"));
    let db = Database::open(&path).unwrap();
    let rt = runtime(config(), db, &network, ConnectivityState::Offline);
    assert!(rt.is_activated());
    let report = rt.start(b"runtime v1").await.unwrap();
    assert_eq!(report.registration, RegisterOutcome::Unchanged);
    assert!(report.installed.is_none());

    let report = rt.sync_now().await.unwrap();
    assert_eq!(report.delivered, vec![1]);
  }

  #[tokio::test]
  async fn test_nothing_is_intercepted_before_activation() {
    let network = ScriptedNetwork::new();
    network.respond(&href("/app.js"), Response::ok("js"));
    let rt = in_memory(&network, ConnectivityState::Online);

    rt.fetch(Request::get(Url::parse(&href("/app.js")).unwrap())).await.unwrap();
    rt.fetch(Request::get(Url::parse(&href("/app.js")).unwrap())).await.unwrap();
    assert_eq!(network.call_count(&href("/app.js")), 2);
    assert!(rt.store().namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_fallback_is_always_precached() {
    let network = ScriptedNetwork::new();
    serve_shell(&network);
    let mut bare = config();
    bare.precache.clear();
    let db = Database::open_in_memory().unwrap();
    let rt = runtime(bare, db, &network, ConnectivityState::Online);

    let report = rt.start(b"runtime v1").await.unwrap();
    assert_eq!(report.installed, Some(vec![href("/offline.html")]));
    assert_eq!(rt.store().namespaces().unwrap(), vec!["app-page-shell-v1".to_string()]);
  }

  #[tokio::test]
  async fn test_failed_install_is_retried_on_next_start() {
    let network = ScriptedNetwork::new();
    network.respond(&href("/"), Response::ok("shell"));
    network.fail(&href("/offline.html"), FetchError::Offline("down".into()));
    let rt = in_memory(&network, ConnectivityState::Online);

    assert!(rt.start(b"runtime v1").await.is_err());
    assert!(!rt.is_activated());

    serve_shell(&network);
    let report = rt.start(b"runtime v1").await.unwrap();
    assert_eq!(report.installed.map(|urls| urls.len()), Some(2));
    assert!(rt.is_activated());

    network.set_offline(true);
    let resolution = rt
      .fetch(Request::navigate(Url::parse(&href("/missing")).unwrap()))
      .await
      .unwrap();
    let Resolution::Served(result) = resolution else {
      panic!("navigation must always be served");
    };
    assert_eq!(result.source, CacheSource::OfflineFallback);
    assert_eq!(result.data.body, b"<html>offline</html>");
  }

  #[tokio::test]
  async fn test_version_bump_evicts_previous_caches() {
    let db = Database::open_in_memory().unwrap();
    let network = ScriptedNetwork::new();
    serve_shell(&network);
    runtime(config(), db.clone(), &network, ConnectivityState::Online)
      .start(b"runtime v1")
      .await
      .unwrap();

    let mut next = config();
    next.cache.version = "v2".into();
    let report = runtime(next, db, &network, ConnectivityState::Online)
      .start(b"runtime v2")
      .await
      .unwrap();
    assert_eq!(report.registration, RegisterOutcome::Updated);
    assert_eq!(report.evicted, vec!["app-page-shell-v1".to_string()]);
  }

  #[tokio::test]
  async fn test_interrupted_install_of_old_version_is_not_activated() {
    let db = Database::open_in_memory().unwrap();
    let network = ScriptedNetwork::new();
    serve_shell(&network);
    // Killed after storing v1 but before activating it.
    let registrar = Registrar::new(db.clone());
    registrar.register(&config().scope, b"runtime").unwrap();
    registrar.mark_installed("v1").unwrap();

    let mut next = config();
    next.cache.version = "v2".into();
    let rt = runtime(next, db, &network, ConnectivityState::Online);
    let report = rt.start(b"runtime").await.unwrap();

    assert_eq!(report.registration, RegisterOutcome::Unchanged);
    assert_eq!(report.installed.map(|urls| urls.len()), Some(2));
    assert_eq!(rt.store().namespaces().unwrap(), vec!["app-page-shell-v2".to_string()]);
    assert!(rt.is_activated());
  }

  #[tokio::test]
  async fn test_host_messages_round_trip() {
    let network = ScriptedNetwork::new();
    serve_shell(&network);
    let rt = in_memory(&network, ConnectivityState::Offline);
    rt.start(b"runtime v1").await.unwrap();
    network.set_offline(true);
    rt.fetch(contact_form("Ada")).await.unwrap();

    let mut page = rt.bridge().connect();
    let runner = tokio::spawn({
      let rt = Arc::clone(&rt);
      async move { rt.run().await }
    });

    page.post(HostMessage::GetState);
    let state = next_message(&mut page, |m| matches!(m, RuntimeMessage::State { .. })).await;
    assert_eq!(
      state,
      RuntimeMessage::State {
        connectivity: ConnectivityState::Offline,
        pending_sync_count: 1,
        failed_sync_count: 0,
      }
    );

    page.post(HostMessage::ListSyncTasks);
    let RuntimeMessage::SyncTasks { tasks } =
      next_message(&mut page, |m| matches!(m, RuntimeMessage::SyncTasks { .. })).await
    else {
      unreachable!()
    };
    assert_eq!(tasks.len(), 1);

    page.post(HostMessage::DiscardSyncTask { task_id: tasks[0].id });
    let state = next_message(&mut page, |m| matches!(m, RuntimeMessage::State { .. })).await;
    assert!(matches!(state, RuntimeMessage::State { pending_sync_count: 0, .. }));

    page.post(HostMessage::DiscardSyncTask { task_id: 99 });
    let error = next_message(&mut page, |m| matches!(m, RuntimeMessage::Error { .. })).await;
    assert!(matches!(error, RuntimeMessage::Error { .. }));

    rt.events().shutdown();
    runner.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_force_sync_replays_out_of_cycle() {
    let network = ScriptedNetwork::new();
    serve_shell(&network);
    let rt = in_memory(&network, ConnectivityState::Offline);
    rt.start(b"runtime v1").await.unwrap();
    network.set_offline(true);
    rt.fetch(contact_form("Ada")).await.unwrap();
    network.set_offline(false);
    network.respond(&href("/api/contact"), Response::new(204, ""));

    let mut page = rt.bridge().connect();
    let runner = tokio::spawn({
      let rt = Arc::clone(&rt);
      async move { rt.run().await }
    });

    page.post(HostMessage::ForceSync);
    assert_eq!(sync_result(&mut page).await, (1, TaskStatus::Done));

    rt.events().shutdown();
    runner.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_push_events_render_notifications() {
    let network = ScriptedNetwork::new();
    let surface = RecordingSurface::default();
    let platform = Platform {
      network: Arc::new(network),
      push: Arc::new(FakePushService::granting()),
      surface: Arc::new(surface.clone()),
      connectivity: None,
    };
    let db = Database::open_in_memory().unwrap();
    let rt = Arc::new(Runtime::new(config(), db, platform).unwrap());
    let runner = tokio::spawn({
      let rt = Arc::clone(&rt);
      async move { rt.run().await }
    });

    let events = rt.events();
    events.push(Some(br#"{"title":"New reply","url":"/threads/7"}"#.to_vec()));
    events.push(Some(b"not json".to_vec()));
    events.shutdown();
    runner.await.unwrap().unwrap();

    let shown = surface.shown();
    assert_eq!(shown.len(), 2);
    assert_eq!(shown[0].title, "New reply");
    assert_eq!(shown[1].title, "Offline App");
  }

  #[tokio::test]
  async fn test_run_is_single_use() {
    let network = ScriptedNetwork::new();
    let rt = in_memory(&network, ConnectivityState::Online);
    rt.events().shutdown();
    rt.run().await.unwrap();
    assert!(rt.run().await.is_err());
  }
}
