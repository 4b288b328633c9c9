//! Carnicería Smoke Harness
//!
//! Registers the offline worker against a live storefront, replays a list of
//! requests through it (optionally after cutting the network) and prints a
//! JSON report of where every answer came from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use carniceria_common::{init_logging, LogConfig, LogFormat};
use carniceria_core::WorkerConfig;
use carniceria_net::{Fetcher, HttpFetcher, LoaderConfig, NetError, Request, Response};
use carniceria_sw::ServiceWorkerContainer;
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

/// Exercise the offline worker against a running storefront
#[derive(Parser, Debug)]
#[command(name = "carniceria-smoke")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Worker configuration file (JSON); defaults apply when missing
    #[arg(long, env = "CARNICERIA_CONFIG", default_value = "carniceria.json")]
    config: PathBuf,

    /// Override the storefront origin
    #[arg(long, env = "CARNICERIA_ORIGIN")]
    origin: Option<Url>,

    /// Paths or URLs to request through the worker after install
    #[arg(value_name = "PATH")]
    paths: Vec<String>,

    /// Request paths as document navigations (Accept: text/html)
    #[arg(long)]
    navigate: bool,

    /// Cut the network after install so every request is answered offline
    #[arg(long)]
    offline: bool,

    /// Push payload (JSON) to deliver, then click the resulting notification
    #[arg(long, value_name = "JSON")]
    push: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long, env = "CARNICERIA_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Wraps the real network with an off switch.
struct Switchable {
    inner: HttpFetcher,
    online: AtomicBool,
}

impl Switchable {
    fn cut(&self) {
        self.online.store(false, Ordering::SeqCst);
        warn!("Network cut");
    }
}

#[async_trait]
impl Fetcher for Switchable {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }
        self.inner.fetch(request).await
    }
}

/// Per-phase timing collector.
#[derive(Default)]
struct PerfTiming {
    timings: HashMap<&'static str, Vec<Duration>>,
}

impl PerfTiming {
    fn record(&mut self, phase: &'static str, duration: Duration) {
        self.timings.entry(phase).or_default().push(duration);
    }

    fn to_json(&self) -> serde_json::Value {
        let phases: serde_json::Map<String, serde_json::Value> = self
            .timings
            .iter()
            .map(|(phase, durations)| {
                let total: Duration = durations.iter().sum();
                let max = durations.iter().max().copied().unwrap_or_default();
                (
                    phase.to_string(),
                    json!({
                        "count": durations.len(),
                        "total_ms": total.as_secs_f64() * 1000.0,
                        "max_ms": max.as_secs_f64() * 1000.0,
                    }),
                )
            })
            .collect();
        serde_json::Value::Object(phases)
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format));

    let mut config = WorkerConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(origin) = cli.origin {
        config.origin = origin;
    }
    config.validate()?;

    let network = Arc::new(Switchable {
        inner: HttpFetcher::new(config.origin.clone(), LoaderConfig::default())?,
        online: AtomicBool::new(true),
    });
    let (container, _events) = ServiceWorkerContainer::restore(network.clone(), &config).await?;
    let mut perf = PerfTiming::default();

    let started = Instant::now();
    let installed = container.register(&config).await;
    perf.record("install", started.elapsed());
    let worker = match (installed, container.controller().await) {
        (Ok(worker), _) => worker,
        (Err(e), Some(restored)) => {
            warn!(error = %e, cache = %restored.cache_name(), "Install failed, serving restored version");
            restored
        }
        (Err(e), None) => return Err(e.into()),
    };
    info!(cache = %worker.cache_name(), "Worker ready");

    if cli.offline {
        network.cut();
    }

    let mut results = Vec::with_capacity(cli.paths.len());
    for path in &cli.paths {
        let url = config.resolve(path)?;
        let request = if cli.navigate {
            Request::navigate(url.clone())
        } else {
            Request::get(url.clone())
        };

        let started = Instant::now();
        let outcome = container.handle_fetch(&request).await;
        perf.record("fetch", started.elapsed());

        results.push(match outcome {
            Ok(Some(response)) => json!({
                "url": url.as_str(),
                "status": response.status.as_u16(),
                "source": format!("{:?}", response.source),
                "bytes": response.body_len(),
            }),
            Ok(None) => json!({ "url": url.as_str(), "source": "Passthrough" }),
            Err(e) => json!({ "url": url.as_str(), "error": e.to_string() }),
        });
    }

    let push = match cli.push {
        Some(payload) => match container.deliver_push(Some(payload.as_bytes())).await {
            Some(notification) => {
                let outcome = container.notification_click(notification.id).await?;
                json!({
                    "title": notification.title,
                    "target": notification.target.as_str(),
                    "click": format!("{:?}", outcome),
                })
            }
            None => json!({ "dropped": true }),
        },
        None => serde_json::Value::Null,
    };

    if let Some(path) = &config.snapshot_path {
        container.persist(path).await?;
    } else {
        container.flush().await;
    }

    let usage = container.caches().read().await.usage_bytes();
    let report = json!({
        "cache": worker.cache_name(),
        "generations": container.cache_names().await,
        "usage_bytes": usage,
        "offline": cli.offline,
        "requests": results,
        "push": push,
        "timings": perf.to_json(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
