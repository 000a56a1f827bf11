// ABOUTME: toolgated - runs one dispatch node over a JSON-lines file of requests.
// ABOUTME: Each request's payload is piped to a shell command; a summary is printed at the end.

mod requests;
mod shell;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

use toolgate::prelude::*;

use crate::shell::ShellExecutor;

#[derive(Parser, Debug)]
#[command(name = "toolgated", version, about = "Dispatch requests to a rate-limited shared tool")]
struct Args {
    /// TOML config file; defaults apply when omitted
    #[arg(short, long, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// JSON-lines file with one enqueue request per line
    #[arg(short, long)]
    requests: PathBuf,

    /// Shell command run for each request, payload JSON on stdin
    #[arg(long, env = "TOOLGATE_COMMAND", default_value = "cat")]
    command: String,

    /// Working directory for the command
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Coordination store URL; overrides coordination.redis_url
    #[arg(long, env = "TOOLGATE_REDIS_URL")]
    redis_url: Option<String>,

    /// How often to check whether all work has drained
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn connect_store(url: Option<&str>) -> Result<SharedStore> {
    match url {
        None => {
            info!("using in-process coordination store");
            Ok(Arc::new(MemoryStore::new(system_clock())))
        }
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .with_context(|| format!("connecting to {}", url))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => bail!("a store URL was given but toolgated was built without the redis feature"),
    }
}

#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    failed: usize,
    requeued: usize,
}

impl Tally {
    fn terminal(&self) -> usize {
        self.completed + self.failed
    }

    fn record(&mut self, outcome: &DispatchOutcome) {
        match &outcome.status {
            DispatchStatus::Completed { .. } => self.completed += 1,
            DispatchStatus::Failed { kind, .. } => {
                self.failed += 1;
                // error text may contain command output
                warn!(request_id = %outcome.request_id, kind = %kind, "request failed");
            }
            DispatchStatus::Requeued { retry_after_ms } => {
                self.requeued += 1;
                info!(
                    request_id = %outcome.request_id,
                    attempt = outcome.attempt,
                    retry_after_ms,
                    "request requeued"
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ToolgateConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ToolgateConfig::default(),
    };
    if args.redis_url.is_some() {
        config.coordination.redis_url = args.redis_url.clone();
    }

    let pending = requests::load(&args.requests)?;
    if pending.is_empty() {
        bail!("no requests in {}", args.requests.display());
    }

    let store = connect_store(config.coordination.redis_url.as_deref()).await?;
    let mut executor = ShellExecutor::new(&args.command);
    if let Some(dir) = &args.workdir {
        executor = executor.with_working_dir(dir);
    }

    let (tx, mut outcomes) = mpsc::unbounded_channel();
    let node = DispatchNode::builder(config, store, Arc::new(executor))
        .with_outcomes(tx)
        .start()
        .await?;

    let mut submitted = 0usize;
    for request in pending {
        let request_id = request.request_id.clone();
        match node.submit(request) {
            Ok(_) => submitted += 1,
            Err(e) => warn!(request_id = %request_id, error = %e, "request rejected"),
        }
    }
    info!(instance_id = %node.instance_id(), submitted, "requests queued");

    let mut tally = Tally::default();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.poll_ms.max(1)));
    // requests lost to another instance's claim never report here, so an
    // idle node seen on two consecutive ticks also ends the run
    let mut idle_ticks = 0;
    while tally.terminal() < submitted {
        tokio::select! {
            Some(outcome) = outcomes.recv() => tally.record(&outcome),
            _ = ticker.tick() => {
                let dispatcher = node.dispatcher();
                if dispatcher.queue().is_empty() && dispatcher.active_requests() == 0 {
                    idle_ticks += 1;
                    if idle_ticks >= 2 {
                        break;
                    }
                } else {
                    idle_ticks = 0;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted; draining in-flight requests");
                break;
            }
        }
    }

    let snapshot = node.snapshot().await;
    node.shutdown().await?;
    while let Ok(outcome) = outcomes.try_recv() {
        tally.record(&outcome);
    }

    info!(
        submitted,
        completed = tally.completed,
        failed = tally.failed,
        requeued = tally.requeued,
        "done"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
