//! teidmap CLI
//!
//! `serve` runs the capture loops and the query API against one in-memory
//! store, `ingest` replays recorded feeds and prints what they resolve to,
//! and `config` prints the effective configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use teidmap_core::capture::{LoopSummary, run_control_plane_loop, run_tunnel_loop};
use teidmap_core::config::{Config, LogFormat};
use teidmap_core::logging::init_logging;
use teidmap_core::resolver::{FieldMap, SubscriberResolution};
use teidmap_core::store::epoch_secs;
use teidmap_core::{ControlPlaneAssembler, MemoryStore, RecordStore, Resolver, TunnelAssembler};

#[derive(Parser, Debug)]
#[command(
    name = "teidmap",
    author,
    version,
    about = "Correlate 5G NGAP and PFCP signaling into subscriber/TEID records"
)]
struct Cli {
    /// Config file (defaults to ./teidmap.toml when present)
    #[arg(long, global = true, env = "TEIDMAP_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter, e.g. `info` or `teidmap_core=debug`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the capture loops and the query API
    Serve(ServeArgs),
    /// Replay recorded feeds and print the resulting records as JSON
    Ingest(IngestArgs),
    /// Print the effective configuration as TOML
    Config,
}

/// Decoded-message feeds; `-` reads standard input.
#[derive(Args, Debug, Default)]
struct FeedArgs {
    /// NGAP JSON-lines feed
    #[arg(long)]
    ngap: Option<PathBuf>,

    /// PFCP JSON-lines feed
    #[arg(long)]
    pfcp: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    feeds: FeedArgs,

    /// API bind host
    #[arg(long)]
    host: Option<String>,

    /// API bind port
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct IngestArgs {
    #[command(flatten)]
    feeds: FeedArgs,

    /// Only resolve these identities (default: every identity seen)
    #[arg(long = "imsi")]
    identities: Vec<String>,
}

#[derive(Serialize)]
struct IngestReport {
    feeds: Vec<LoopSummary>,
    teids: BTreeMap<String, FieldMap>,
    subscribers: BTreeMap<String, SubscriberResolution>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        let remediation = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<teidmap_core::Error>())
            .and_then(teidmap_core::Error::remediation)
            .or_else(|| {
                err.chain()
                    .find_map(|cause| cause.downcast_ref::<teidmap_core::error::ConfigError>())
                    .map(teidmap_core::error::ConfigError::remediation)
            });
        if let Some(remediation) = remediation {
            eprintln!("\n{}", remediation.render_plain());
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }

    match cli.command {
        Command::Config => {
            config.validate()?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Serve(args) => {
            if let Some(host) = args.host {
                config.api.host = host;
            }
            if let Some(port) = args.port {
                config.api.port = port;
            }
            config.validate()?;
            init_logging(&config.general.log_config())?;
            serve(&config, args.feeds)
        }
        Command::Ingest(args) => {
            config.validate()?;
            init_logging(&config.general.log_config())?;
            ingest(&config, &args)
        }
    }
}

fn open_feed(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    if path == Path::new("-") {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path).with_context(|| format!("opening feed {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn new_store(config: &Config) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(
        config.store.shards,
        config.store.retention(),
    ))
}

fn serve(config: &Config, feeds: FeedArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let result = runtime.block_on(serve_async(config, feeds));
    // A feed blocked on stdin must not hold the process open.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn serve_async(config: &Config, feeds: FeedArgs) -> Result<()> {
    let store = new_store(config);
    let shared: Arc<dyn RecordStore> = store.clone();

    let mut loops = Vec::new();
    if let Some(path) = feeds.ngap {
        let reader = open_feed(&path)?;
        let mut assembler =
            ControlPlaneAssembler::new(shared.clone(), config.control_plane.expiry_policy());
        let interval = config.control_plane.sweep_interval;
        loops.push(tokio::task::spawn_blocking(move || {
            run_control_plane_loop(reader, &mut assembler, interval)
        }));
    }
    if let Some(path) = feeds.pfcp {
        let reader = open_feed(&path)?;
        let mut assembler = TunnelAssembler::new(shared.clone(), config.tunnel.expiry_policy());
        let interval = config.tunnel.sweep_interval;
        loops.push(tokio::task::spawn_blocking(move || {
            run_tunnel_loop(reader, &mut assembler, interval)
        }));
    }
    if loops.is_empty() {
        warn!("no capture feed given; serving queries only");
    }

    if config.store.retention().is_enabled() {
        let store = store.clone();
        let period = Duration::from_secs(config.store.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match store.sweep_stale(epoch_secs()) {
                    Ok(report) if report.total() > 0 => info!(
                        teid_records = report.teid_records,
                        subscriber_records = report.subscriber_records,
                        reverse_entries = report.reverse_entries,
                        "retention sweep"
                    ),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "retention sweep failed"),
                }
            }
        });
    }

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };
    teidmap_core::api::serve(&config.api, Resolver::new(shared), shutdown).await?;

    for handle in loops {
        if handle.is_finished() {
            let summary = handle.await.context("capture loop panicked")??;
            info!(feed = %summary.feed, messages = summary.messages, "capture loop finished");
        }
    }
    Ok(())
}

fn ingest(config: &Config, args: &IngestArgs) -> Result<()> {
    let store = new_store(config);
    let shared: Arc<dyn RecordStore> = store.clone();
    let mut summaries = Vec::new();

    // Tunnel bindings first so completed calls can pick up known IPs.
    if let Some(path) = &args.feeds.pfcp {
        let mut assembler = TunnelAssembler::new(shared.clone(), config.tunnel.expiry_policy());
        summaries.push(run_tunnel_loop(
            open_feed(path)?,
            &mut assembler,
            config.tunnel.sweep_interval,
        )?);
    }
    if let Some(path) = &args.feeds.ngap {
        let mut assembler =
            ControlPlaneAssembler::new(shared.clone(), config.control_plane.expiry_policy());
        summaries.push(run_control_plane_loop(
            open_feed(path)?,
            &mut assembler,
            config.control_plane.sweep_interval,
        )?);
    }

    let resolver = Resolver::new(shared.clone());
    let identities: BTreeSet<String> = if args.identities.is_empty() {
        shared
            .all_teid_records()?
            .into_iter()
            .filter_map(|(_, record)| record.identity)
            .collect()
    } else {
        args.identities.iter().cloned().collect()
    };
    let mut subscribers = BTreeMap::new();
    for identity in identities {
        match resolver.resolve_by_identity(&identity) {
            Ok(resolution) => {
                subscribers.insert(identity, resolution);
            }
            Err(err) => warn!(imsi = %identity, error = %err, "identity did not resolve"),
        }
    }

    let report = IngestReport {
        feeds: summaries,
        teids: resolver.all_teids()?,
        subscribers,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
