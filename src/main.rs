use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use offline_runtime::cache::{CacheStore, Namespace, Resolution};
use offline_runtime::config::Config;
use offline_runtime::db::Database;
use offline_runtime::http::{Method, Request};
use offline_runtime::network::HttpNetwork;
use offline_runtime::push::{LogSurface, UnsupportedPush};
use offline_runtime::{logging, Platform, Runtime};

#[derive(Parser, Debug)]
#[command(name = "offline-runtime")]
#[command(about = "Offline-resilience runtime: tiered caching, a sync queue and push delivery")]
#[command(version)]
struct Args {
  /// Path to config file
  /// (default: ./offline-runtime.yaml, then $XDG_CONFIG_HOME/offline-runtime/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Register the runtime script, installing and activating the current cache version
  Register {
    #[arg(long)]
    script: PathBuf,
  },
  /// Resolve a GET through the caching strategies
  Fetch {
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Send a mutation, queueing it if it cannot be delivered
  Send {
    method: Method,
    url: String,
    #[arg(long)]
    body: Option<PathBuf>,
    /// Logical resource for replay ordering (default: the URL without query)
    #[arg(long)]
    resource: Option<String>,
    #[arg(long)]
    idempotency_key: Option<String>,
  },
  /// Replay the sync queue now
  Sync,
  /// Inspect or edit the sync queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Inspect the response cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// Print connectivity, queue counts and registration
  State,
  /// Push notification tools
  Push {
    #[command(subcommand)]
    action: PushAction,
  },
  /// Print the application manifest as JSON
  Manifest,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  List,
  Discard { id: i64 },
  Retry { id: i64 },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  Namespaces,
}

#[derive(Subcommand, Debug)]
enum PushAction {
  /// Render a push payload file as a notification
  Render { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  if let Command::Manifest = args.command {
    println!("{}", config.app_manifest.to_json()?);
    return Ok(());
  }

  let db = Database::open(&config.database_path()?)?;
  let platform = Platform {
    network: Arc::new(HttpNetwork::new()?),
    push: Arc::new(UnsupportedPush),
    surface: Arc::new(LogSurface),
    connectivity: None,
  };
  let origin = config.origin.clone();
  let runtime = Runtime::new(config, db, platform)?;

  match args.command {
    Command::Register { script } => {
      let script = std::fs::read(&script)
        .map_err(|e| eyre!("Failed to read script {}: {}", script.display(), e))?;
      let report = runtime.start(&script).await?;
      print_json(&report)?;
    }
    Command::Fetch { url, navigate } => {
      let url = resolve(&origin, &url)?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      print_resolution(runtime.fetch(request).await?);
    }
    Command::Send {
      method,
      url,
      body,
      resource,
      idempotency_key,
    } => {
      if !method.is_mutating() {
        return Err(eyre!("{} is not a mutating method; use `fetch`", method));
      }
      let mut request = Request::new(method, resolve(&origin, &url)?);
      if let Some(path) = body {
        let bytes = std::fs::read(&path)
          .map_err(|e| eyre!("Failed to read body {}: {}", path.display(), e))?;
        request = request.with_body(bytes);
      }
      if let Some(resource) = resource {
        request = request.with_resource(resource);
      }
      if let Some(key) = idempotency_key {
        request = request.with_idempotency_key(key);
      }
      print_resolution(runtime.fetch(request).await?);
    }
    Command::Sync => {
      let report = runtime.sync_now().await?;
      print_json(&report)?;
    }
    Command::Queue { action } => match action {
      QueueAction::List => {
        for task in runtime.queue().list()? {
          println!(
            "{:>5}  {:<9}  {:<6} {}  attempts={}{}",
            task.id,
            task.status,
            task.method,
            task.endpoint,
            task.attempts,
            task
              .last_error
              .map(|e| format!("  last_error={}", e))
              .unwrap_or_default()
          );
        }
      }
      QueueAction::Discard { id } => {
        if !runtime.queue().discard(id)? {
          return Err(eyre!("No discardable sync task {}", id));
        }
        println!("Discarded task {}", id);
      }
      QueueAction::Retry { id } => {
        if !runtime.queue().retry(id)? {
          return Err(eyre!("Sync task {} is not failed", id));
        }
        println!("Task {} will be retried on the next sync", id);
      }
    },
    Command::Cache { action } => match action {
      CacheAction::Namespaces => {
        let store = runtime.store();
        for name in store.namespaces()? {
          let entries = match Namespace::parse(&name) {
            Some(namespace) => store.keys(&namespace)?.len(),
            None => 0,
          };
          println!("{}  ({} entries)", name, entries);
        }
      }
    },
    Command::State => {
      print_json(&runtime.state()?)?;
      if let Some(registration) = runtime.registrar().current()? {
        print_json(&registration)?;
      }
    }
    Command::Push { action } => match action {
      PushAction::Render { file } => {
        let payload = std::fs::read(&file)
          .map_err(|e| eyre!("Failed to read payload {}: {}", file.display(), e))?;
        let notification = runtime.push().receive(Some(&payload)).await;
        print_json(&notification)?;
      }
    },
    Command::Manifest => {}
  }

  Ok(())
}

fn resolve(origin: &Url, url: &str) -> Result<Url> {
  origin
    .join(url)
    .map_err(|e| eyre!("Invalid URL {:?}: {}", url, e))
}

fn print_resolution(resolution: Resolution) {
  match resolution {
    Resolution::Served(result) => {
      println!("HTTP {} ({:?})", result.data.status, result.source);
      if let Some(cached_at) = result.cached_at {
        println!("cached at {}", cached_at.to_rfc3339());
      }
      println!("{}", String::from_utf8_lossy(&result.data.body));
    }
    Resolution::NoData => println!("No data: network unavailable and nothing cached"),
    Resolution::Accepted { task_id } => println!("Accepted: queued as sync task {}", task_id),
  }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", json);
  Ok(())
}
