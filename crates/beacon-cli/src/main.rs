use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use beacon_agent::sim::{
    RecordingSink, Scenario, SimulatedProvider, SimulatedSensor, StaticContext, ToggleConnectivity,
};
use beacon_agent::{
    Agent, Collaborators, Credentials, DrainOutcome, HttpSink, RemoteSink, RetentionSweeper,
    SyncEngine, TokioClock, Transport,
};
use beacon_core::{BeaconConfig, Clock, DrainTrigger, SystemClock, format_timestamp};
use beacon_store::{Store, config_path, database_path, ensure_base_dir, load_config, render_config, resolve_base_dir};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "beacon", about = "Adaptive battery-aware telemetry agent")]
struct Cli {
    /// Override the data directory (default: $BEACON_DATA_DIR or ~/.beacon)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent against simulated sensors
    Run {
        /// Seconds to run before shutting down
        #[arg(long, default_value_t = 60)]
        duration: u64,

        /// Motion scenario: walk, still or mixed
        #[arg(long, default_value = "mixed")]
        scenario: String,

        /// Start offline and reconnect after this many seconds
        #[arg(long, default_value_t = 0)]
        offline_for: u64,

        /// Deliver to this HTTP endpoint instead of an in-memory sink
        #[arg(long)]
        endpoint: Option<String>,

        /// Bearer token for the endpoint
        #[arg(long)]
        token: Option<String>,

        /// Seed for the simulated hardware
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show queue statistics and recent sync runs
    Stats {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Drain the queue once to an HTTP endpoint
    Drain {
        /// Endpoint to POST queued items to
        #[arg(long)]
        endpoint: String,

        /// Bearer token for the endpoint
        #[arg(long)]
        token: Option<String>,
    },

    /// Delete synced items and sync runs past the retention window
    Purge,

    /// List items that exhausted their retries
    Abandoned {
        /// Delete them instead of listing
        #[arg(long)]
        clear: bool,
    },

    /// Print the effective configuration
    Config,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let base = resolve_base_dir(cli.data_dir.as_deref());
    let config = load_config(&config_path(&base)).context("failed to load config")?;

    match cli.command {
        Commands::Run {
            duration,
            scenario,
            offline_for,
            endpoint,
            token,
            seed,
        } => {
            let scenario = Scenario::parse(&scenario)
                .with_context(|| format!("unknown scenario '{scenario}' (walk, still, mixed)"))?;
            let opts = RunOptions {
                duration: Duration::from_secs(duration),
                scenario,
                offline_for: Duration::from_secs(offline_for),
                endpoint,
                credentials: Credentials { token },
                seed: seed.unwrap_or_else(rand::random),
            };
            cmd_run(&base, &config, opts).await
        }
        Commands::Stats { json } => cmd_stats(&base, json),
        Commands::Drain { endpoint, token } => {
            cmd_drain(&base, &config, endpoint, Credentials { token }).await
        }
        Commands::Purge => cmd_purge(&base, &config).await,
        Commands::Abandoned { clear } => cmd_abandoned(&base, clear),
        Commands::Config => cmd_config(&config),
    }
}

fn open_store(base: &Path, clock: Arc<dyn Clock>) -> Result<Store> {
    ensure_base_dir(base).context("failed to create data directory")?;
    let path = database_path(base);
    Store::open_with_clock(&path, clock)
        .with_context(|| format!("failed to open queue at {}", path.display()))
}

struct RunOptions {
    duration: Duration,
    scenario: Scenario,
    offline_for: Duration,
    endpoint: Option<String>,
    credentials: Credentials,
    seed: u64,
}

async fn cmd_run(base: &Path, config: &BeaconConfig, opts: RunOptions) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let store = open_store(base, Arc::clone(&clock))?;

    let recorder = Arc::new(RecordingSink::new());
    let sink: Arc<dyn RemoteSink> = match &opts.endpoint {
        Some(url) => Arc::new(HttpSink::new(url.clone())),
        None => recorder.clone(),
    };
    let connectivity = Arc::new(ToggleConnectivity::new(opts.offline_for.is_zero()));

    let agent = Agent::start(
        config,
        store,
        Collaborators {
            sensor: Box::new(SimulatedSensor::new(
                opts.scenario,
                Arc::clone(&clock),
                opts.seed,
            )),
            provider: Arc::new(SimulatedProvider::new(Arc::clone(&clock), opts.seed)),
            sink,
            connectivity: connectivity.clone(),
            device: Arc::new(StaticContext::default()),
            credentials: opts.credentials,
        },
        clock,
    );
    eprintln!(
        "running {:?} scenario for {}s (seed {})",
        opts.scenario,
        opts.duration.as_secs(),
        opts.seed
    );

    let reconnect = tokio::time::sleep(opts.offline_for);
    let deadline = tokio::time::sleep(opts.duration);
    tokio::pin!(reconnect, deadline);
    let mut reconnected = opts.offline_for.is_zero();

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted");
                break;
            }
            _ = &mut reconnect, if !reconnected => {
                reconnected = true;
                eprintln!("connectivity restored");
                connectivity.set_online(true);
            }
        }
    }

    let stats = agent.sampler().stats();
    let motion = agent.monitor().snapshot();
    agent.shutdown().await.context("failed to shut down agent")?;

    let store = open_store(base, Arc::new(SystemClock))?;
    let queue = store.stats()?;
    println!("Run summary:");
    println!("  motion:       {}", motion.state.as_str());
    println!("  acquired:     {}", stats.acquired);
    println!("  failed:       {}", stats.failed);
    println!("  skipped:      {}", stats.skipped);
    println!("  reschedules:  {}", stats.reschedules);
    if opts.endpoint.is_none() {
        println!("  delivered:    {}", recorder.len());
    }
    println!("  pending:      {}", queue.pending());
    Ok(())
}

fn cmd_stats(base: &Path, json: bool) -> Result<()> {
    let store = open_store(base, Arc::new(SystemClock))?;
    let stats = store.stats()?;
    let runs = store.recent_sync_runs(5)?;

    if json {
        let doc = serde_json::json!({ "queue": stats, "recent_runs": runs });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Queue: {}", database_path(base).display());
    println!(
        "  pending:      {} ({} readings, {} events)",
        stats.pending(),
        stats.pending_readings,
        stats.pending_events
    );
    println!(
        "  synced:       {} ({} readings, {} events)",
        stats.synced(),
        stats.synced_readings,
        stats.synced_events
    );
    println!(
        "  abandoned:    {} ({} readings, {} events)",
        stats.abandoned_readings + stats.abandoned_events,
        stats.abandoned_readings,
        stats.abandoned_events
    );
    if let Some(oldest) = stats.oldest_pending_ms {
        println!("  oldest:       {}", format_timestamp(oldest));
    }

    if runs.is_empty() {
        println!("No sync runs yet.");
    } else {
        println!("Recent sync runs:");
        for run in &runs {
            print!(
                "  {}  {:<9} {} items, {} ok, {} failed, {} abandoned",
                format_timestamp(run.started_at_ms),
                run.trigger.as_str(),
                run.item_count,
                run.success_count,
                run.failure_count,
                run.abandoned_count
            );
            match &run.first_error {
                Some(err) => println!("  ({err})"),
                None => println!(),
            }
        }
    }
    Ok(())
}

async fn cmd_drain(
    base: &Path,
    config: &BeaconConfig,
    endpoint: String,
    credentials: Credentials,
) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(base, Arc::clone(&clock))?;
    let engine = SyncEngine::new(
        Arc::new(Mutex::new(store)),
        Transport::new(
            Arc::new(HttpSink::new(endpoint)),
            credentials,
            config.delivery.send_timeout(),
        ),
        Arc::new(ToggleConnectivity::new(true)),
        config.delivery.retry_policy(),
        Duration::ZERO,
        clock,
    );

    match engine.drain(DrainTrigger::Manual).await {
        DrainOutcome::Completed(run) => {
            println!(
                "Drained {} items: {} ok, {} failed, {} abandoned",
                run.item_count, run.success_count, run.failure_count, run.abandoned_count
            );
            if let Some(err) = run.first_error {
                println!("  first error: {err}");
            }
            Ok(())
        }
        DrainOutcome::AlreadyRunning | DrainOutcome::Offline => {
            bail!("drain did not run")
        }
        DrainOutcome::Failed(e) => bail!("drain failed: {e}"),
    }
}

async fn cmd_purge(base: &Path, config: &BeaconConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(base, Arc::clone(&clock))?;
    let sweeper = RetentionSweeper::new(
        Arc::new(Mutex::new(store)),
        clock,
        config.delivery.retention(),
    );
    let report = sweeper.sweep_once().await?;
    println!(
        "Purged {} synced items and {} sync runs",
        report.purged_items, report.pruned_runs
    );
    Ok(())
}

fn cmd_abandoned(base: &Path, clear: bool) -> Result<()> {
    let store = open_store(base, Arc::new(SystemClock))?;
    if clear {
        let removed = store.clear_abandoned()?;
        println!("Cleared {removed} abandoned items");
        return Ok(());
    }

    let items = store.list_abandoned()?;
    if items.is_empty() {
        println!("No abandoned items.");
        return Ok(());
    }
    for item in &items {
        println!(
            "  {}  {}  retries={}  {}",
            item.key,
            format_timestamp(item.created_at_ms),
            item.retry_count,
            item.last_error.as_deref().unwrap_or("-")
        );
    }
    println!("{} abandoned items", items.len());
    Ok(())
}

fn cmd_config(config: &BeaconConfig) -> Result<()> {
    print!("{}", render_config(config)?);
    Ok(())
}
