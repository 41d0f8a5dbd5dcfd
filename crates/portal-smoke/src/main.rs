//! Portal offline smoke harness
//!
//! Registers the offline worker against a live origin, replays a list of
//! fetches (optionally with the network cut after install) and prints a JSON
//! report of how each request was answered.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use portal_common::{init_logging, LogConfig};
use portal_net::{Fetch, LoaderConfig, NetError, Request, ResourceLoader, Response};
use portal_sw::{
    is_offline_fallback, FetchOutcome, OfflineWorker, ServiceWorkerContainer,
    ServiceWorkerEvent, StorageConfig, WorkerConfig,
};
use serde_json::json;
use tracing::{error, info, warn};

struct Args {
    config: Option<PathBuf>,
    fetches: Vec<String>,
    offline: bool,
    memory: bool,
    verbose: bool,
    report: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1).peekable();
        let mut config = None;
        let mut fetches = Vec::new();
        let mut offline = false;
        let mut memory = false;
        let mut verbose = false;
        let mut report = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config = args.next().map(PathBuf::from);
                }
                "--fetch" => {
                    if let Some(val) = args.next() {
                        fetches.push(val);
                    }
                }
                "--offline" => {
                    offline = true;
                }
                "--memory" => {
                    memory = true;
                }
                "--verbose" | "-v" => {
                    verbose = true;
                }
                "--report" => {
                    report = args.next().map(PathBuf::from);
                }
                _ => {}
            }
        }

        if fetches.is_empty() {
            fetches.push("/".to_string());
        }

        Self {
            config,
            fetches,
            offline,
            memory,
            verbose,
            report,
        }
    }
}

/// Real network with a kill switch, so a run can install online and then
/// replay offline.
struct SwitchableNetwork {
    inner: ResourceLoader,
    offline: AtomicBool,
}

impl SwitchableNetwork {
    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetch for SwitchableNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }
        self.inner.fetch(request).await
    }
}

fn describe(outcome: &FetchOutcome) -> serde_json::Value {
    match outcome {
        FetchOutcome::Passthrough => json!({ "outcome": "passthrough" }),
        FetchOutcome::Unavailable => json!({ "outcome": "unavailable" }),
        FetchOutcome::Responded { response, source } => json!({
            "outcome": "responded",
            "source": format!("{source:?}"),
            "status": response.status.as_u16(),
            "bytes": response.body_len(),
            "offline_fallback": is_offline_fallback(response),
        }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_config = if args.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config)?;

    let mut config = match &args.config {
        Some(path) => WorkerConfig::load(path)
            .inspect_err(|e| error!(category = e.category(), error = %e, "Config load failed"))
            .with_context(|| format!("loading config {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    if args.memory {
        config.storage = StorageConfig::Memory;
    }

    info!(
        version = %config.cache_version,
        origin = %config.origin,
        fetches = args.fetches.len(),
        offline = args.offline,
        "Starting portal smoke harness"
    );

    let caches = config.storage.open().context("opening cache store")?;
    let network = Arc::new(SwitchableNetwork {
        inner: ResourceLoader::new(LoaderConfig::default())?,
        offline: AtomicBool::new(false),
    });
    let worker = Arc::new(OfflineWorker::new(config.clone(), caches, network.clone())?);
    let root = worker.root_url().clone();

    let (container, mut events) = ServiceWorkerContainer::new();
    let start = Instant::now();
    let install = container.register(worker).await;
    let install_ms = start.elapsed().as_millis();
    if let Err(e) = &install {
        warn!(error = %e, "Registration failed");
    }

    if args.offline {
        network.go_offline();
    }

    let mut results = Vec::with_capacity(args.fetches.len());
    for target in &args.fetches {
        let url = root
            .join(target)
            .with_context(|| format!("invalid fetch target {target}"))?;
        let start = Instant::now();
        let outcome = container.handle_fetch(Request::get(url.clone())).await;
        let mut entry = describe(&outcome);
        entry["url"] = json!(url.as_str());
        entry["elapsed_ms"] = json!(start.elapsed().as_millis());
        results.push(entry);
    }

    let mut lifecycle = Vec::new();
    while let Ok(event) = events.try_recv() {
        let entry = match event {
            ServiceWorkerEvent::StateChange { worker_id, new_state, .. } => {
                json!({ "event": "state_change", "worker": worker_id.to_string(), "state": new_state })
            }
            ServiceWorkerEvent::InstallFailed { version, reason, .. } => {
                json!({ "event": "install_failed", "version": version, "reason": reason })
            }
            ServiceWorkerEvent::CachesEvicted { names, .. } => {
                json!({ "event": "caches_evicted", "names": names })
            }
            other => json!({ "event": format!("{other:?}") }),
        };
        lifecycle.push(entry);
    }

    let report = json!({
        "version": config.cache_version,
        "origin": config.origin.as_str(),
        "installed": install.is_ok(),
        "install_error": install.as_ref().err().map(|e| e.to_string()),
        "install_ms": install_ms,
        "offline": args.offline,
        "registration": container.get_registration(&root).await,
        "lifecycle": lifecycle,
        "fetches": results,
    });

    let rendered = serde_json::to_string_pretty(&report)?;
    println!("{rendered}");
    if let Some(path) = &args.report {
        std::fs::write(path, &rendered)
            .with_context(|| format!("writing report {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    Ok(())
}
