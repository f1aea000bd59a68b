//! fanout-send - Background daemon that works through the posting queue
//!
//! Takes queued submissions one at a time and posts each one to its
//! destinations, spacing attempts per destination.

use clap::Parser;
use libfanout::destinations::DestinationRegistry;
use libfanout::engine::{EngineContext, QueueOrchestrator};
use libfanout::logging::LoggingConfig;
use libfanout::store::SubmissionStore;
use libfanout::{Config, Database, FanoutError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fanout-send")]
#[command(version)]
#[command(about = "Background daemon that posts queued submissions")]
#[command(long_about = "\
fanout-send - Background daemon that posts queued submissions

DESCRIPTION:
    fanout-send works through the Fanout queue one submission at a time.
    Each submission is posted to its destinations in name order, waiting
    between attempts so that no destination is hit more often than its
    minimum interval allows.

    When a destination fails and the halt-queue-on-failure setting is on
    (the default), the rest of the queue is cleared. Change it with:

        fanout-queue settings set halt-queue-on-failure false

USAGE:
    # Run in foreground (logs to stderr)
    fanout-send

    # Pick up queue changes from other processes every 2 seconds
    fanout-send --poll-interval 2

    # Post everything currently queued, then exit
    fanout-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown. An attempt in progress is allowed
                      to finish; the submission stays queued.

CONFIGURATION:
    Configuration file: ~/.config/fanout/config.toml
    Database location: ~/.local/share/fanout/fanout.db

    [scheduling]
    poll_interval_secs = 5

    [scheduling.intervals]
    weasyl = 3000

    [destinations.weasyl]
    command = \"weasyl-upload\"
    args = [\"--rating\", \"general\"]

    Override with environment variables:
        FANOUT_CONFIG       - Path to config file
        FANOUT_DB_PATH      - Path to database file
        FANOUT_LOG_FORMAT   - text, json or pretty
        FANOUT_LOG_LEVEL    - error, warn, info, debug or trace

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Post everything queued, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env().verbose(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Arc::new(Database::new(&config.database_path()).await?);

    info!("fanout-send daemon starting");

    let registry = DestinationRegistry::from_config(&config);
    if registry.is_empty() {
        warn!("No destinations configured; every attempt will fail");
    } else {
        info!("Destinations: {}", registry.names().join(", "));
    }

    let recovered = db.recover_interrupted().await?;
    if recovered > 0 {
        info!("Recovered {} interrupted submission(s)", recovered);
    }

    let poll_secs = cli
        .poll_interval
        .unwrap_or(config.scheduling.poll_interval_secs);
    if poll_secs == 0 {
        return Err(FanoutError::InvalidInput(
            "--poll-interval must be greater than zero".to_string(),
        ));
    }
    info!("Poll interval: {}s", poll_secs);

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone())?;

    let ctx = EngineContext::builder(db.clone(), db.clone(), db.clone())
        .intervals(config.interval_table())
        .registry(registry)
        .build();
    let mut orchestrator = QueueOrchestrator::new(ctx);
    let poll = Duration::from_secs(poll_secs);

    if cli.once {
        orchestrator.run_until_idle(shutdown, poll).await?;
        info!("Queue drained, exiting");
    } else {
        orchestrator.run(shutdown, poll).await?;
    }

    info!("fanout-send daemon stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
#[cfg(unix)]
fn setup_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| FanoutError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received shutdown signal, stopping gracefully...");
            shutdown.cancel();
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.cancel();
        }
    });
    Ok(())
}
