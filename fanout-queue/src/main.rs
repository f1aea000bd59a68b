//! fanout-queue - Manage the posting queue
//!
//! Unix-style tool for adding submissions to the Fanout queue, removing
//! them, and inspecting what the daemon has done.

use clap::{Parser, Subcommand, ValueEnum};
use libfanout::ledger::{
    now_millis, IntervalTable, GENERATE_LOG_ON_FAILURE, HALT_QUEUE_ON_FAILURE, LEDGER_PREFIX,
};
use libfanout::store::{FailureLogEntry, SubmissionStore};
use libfanout::{
    AttemptRecord, Config, Database, FanoutError, Result, Settings, Submission,
    SubmissionStatus,
};
use std::io::Read;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[command(name = "fanout-queue")]
#[command(version)]
#[command(about = "Manage the Fanout posting queue")]
#[command(long_about = "\
fanout-queue - Manage the Fanout posting queue

DESCRIPTION:
    fanout-queue adds submissions to the queue that fanout-send works
    through, and lets you inspect or change it while the daemon runs.
    Removing a submission that is being posted stops it after the
    attempt in progress; destinations not yet attempted stay pending.

COMMANDS:
    add         Queue content for one or more destinations
    list        List queued submissions
    show        Show a submission and its attempt history
    remove      Remove a submission from the queue
    requeue     Queue a submission again for its pending destinations
    clear       Remove every submission from the queue
    settings    Read or change queue settings
    ledger      Show when each destination was last attempted
    logs        Show persisted failure reports

USAGE EXAMPLES:
    # Queue a post for two destinations
    fanout-queue add \"New painting!\" -d weasyl -d furaffinity -a ~/art/painting.png

    # Content from stdin
    echo \"Hello\" | fanout-queue add -d weasyl

    # List the queue as JSON
    fanout-queue list --format json

    # Retry the destinations a failed or stopped submission did not reach
    fanout-queue requeue 550e8400-e29b-41d4-a716-446655440000

    # Keep going after a failed destination instead of clearing the queue
    fanout-queue settings set halt-queue-on-failure false

CONFIGURATION:
    Configuration file: ~/.config/fanout/config.toml
    Database location: ~/.local/share/fanout/fanout.db

    Override with environment variables:
        FANOUT_CONFIG    - Path to config file
        FANOUT_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (unknown submission, bad format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue content for posting
    Add {
        /// Content to post (read from stdin if omitted)
        content: Option<String>,

        /// Destination to post to (repeatable)
        #[arg(short, long = "destination", value_name = "NAME", required = true)]
        destinations: Vec<String>,

        /// File to attach (repeatable)
        #[arg(short, long = "asset", value_name = "PATH")]
        assets: Vec<String>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued submissions
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Include submissions that are no longer queued
        #[arg(long)]
        all: bool,

        /// Maximum number of submissions with --all
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show a submission and its attempt history
    Show {
        /// Submission ID
        id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove a submission from the queue
    Remove {
        /// Submission ID
        id: String,
    },

    /// Queue a failed or stopped submission again for its pending destinations
    Requeue {
        /// Submission ID
        id: String,
    },

    /// Remove every submission from the queue
    Clear,

    /// Read or change queue settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Show when each destination was last attempted
    Ledger {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show persisted failure reports
    Logs {
        /// Number of most recent entries
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Print one setting, or all of them
    Get { key: Option<SettingKey> },

    /// Change a setting
    Set {
        key: SettingKey,
        #[arg(action = clap::ArgAction::Set)]
        value: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SettingKey {
    /// Clear the whole queue when a submission fails
    HaltQueueOnFailure,
    /// Persist a failure report for each failed attempt
    GenerateLogOnFailure,
}

impl SettingKey {
    const ALL: [SettingKey; 2] = [SettingKey::HaltQueueOnFailure, SettingKey::GenerateLogOnFailure];

    fn store_key(self) -> &'static str {
        match self {
            SettingKey::HaltQueueOnFailure => HALT_QUEUE_ON_FAILURE,
            SettingKey::GenerateLogOnFailure => GENERATE_LOG_ON_FAILURE,
        }
    }

    fn name(self) -> &'static str {
        match self {
            SettingKey::HaltQueueOnFailure => "halt-queue-on-failure",
            SettingKey::GenerateLogOnFailure => "generate-log-on-failure",
        }
    }

    fn read(self, settings: &Settings) -> bool {
        match self {
            SettingKey::HaltQueueOnFailure => settings.halt_queue_on_failure,
            SettingKey::GenerateLogOnFailure => settings.generate_log_on_failure,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "error" };
    libfanout::logging::LoggingConfig::new(libfanout::logging::LogFormat::Text, level).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database_path()).await?;

    match cli.command {
        Commands::Add {
            content,
            destinations,
            assets,
            format,
        } => cmd_add(&db, content, destinations, assets, &format).await,
        Commands::List { format, all, limit } => cmd_list(&db, &format, all, limit).await,
        Commands::Show { id, format } => cmd_show(&db, &id, &format).await,
        Commands::Remove { id } => cmd_remove(&db, &id).await,
        Commands::Requeue { id } => cmd_requeue(&db, &id).await,
        Commands::Clear => cmd_clear(&db).await,
        Commands::Settings { action } => cmd_settings(&db, action).await,
        Commands::Ledger { format } => cmd_ledger(&db, &config.interval_table(), &format).await,
        Commands::Logs { limit, format } => cmd_logs(&db, limit, &format).await,
    }
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(FanoutError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

fn validate_id(id: &str) -> Result<()> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| FanoutError::InvalidInput(format!("Invalid submission ID: {}", id)))
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Queue a new submission
async fn cmd_add(
    db: &Database,
    content: Option<String>,
    destinations: Vec<String>,
    assets: Vec<String>,
    format: &str,
) -> Result<()> {
    validate_format(format)?;

    let content = match content {
        Some(content) => content,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| FanoutError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
            buffer
        }
    };
    let content = content.trim().to_string();
    if content.is_empty() {
        return Err(FanoutError::InvalidInput("Content cannot be empty".to_string()));
    }

    let assets = assets
        .iter()
        .map(|asset| resolve_asset(asset))
        .collect::<Result<Vec<_>>>()?;

    let submission = Submission::new(content, destinations).with_assets(assets);
    if submission.pending_destinations.is_empty() {
        return Err(FanoutError::InvalidInput(
            "At least one destination is required".to_string(),
        ));
    }

    db.enqueue(&submission).await?;
    tracing::debug!(id = %submission.id, "Queued submission");

    if format == "json" {
        print_json(&submission_json(&submission));
    } else {
        println!("{}", submission.id);
    }
    Ok(())
}

/// Absolute path of an existing asset, so the daemon can find it from anywhere
fn resolve_asset(asset: &str) -> Result<String> {
    let expanded = shellexpand::tilde(asset).to_string();
    let path = Path::new(&expanded);
    if !path.is_file() {
        return Err(FanoutError::InvalidInput(format!(
            "Asset not found or not a file: {}",
            asset
        )));
    }
    let absolute = path
        .canonicalize()
        .map_err(|e| FanoutError::InvalidInput(format!("{}: {}", asset, e)))?;
    Ok(absolute.to_string_lossy().to_string())
}

/// List queued (or all) submissions
async fn cmd_list(db: &Database, format: &str, all: bool, limit: usize) -> Result<()> {
    validate_format(format)?;

    let submissions = if all {
        db.list_submissions(limit).await?
    } else {
        db.current_queue().await?
    };

    if format == "json" {
        let json: Vec<_> = submissions.iter().map(submission_json).collect();
        print_json(&serde_json::Value::Array(json));
    } else {
        for submission in &submissions {
            println!(
                "{} | {} | {} | {}",
                submission.id,
                submission.status,
                destinations_label(&submission.pending_destinations),
                truncate_content(&submission.content, 50)
            );
        }
    }
    Ok(())
}

/// Show one submission and its attempts
async fn cmd_show(db: &Database, id: &str, format: &str) -> Result<()> {
    validate_format(format)?;
    validate_id(id)?;

    let submission = SubmissionStore::get(db, id)
        .await?
        .ok_or_else(|| FanoutError::NotFound(id.to_string()))?;
    let attempts = db.attempts(id).await?;
    let queued = db.current_queue().await?.iter().any(|s| s.id == id);

    if format == "json" {
        let mut json = submission_json(&submission);
        json["queued"] = serde_json::json!(queued);
        json["attempts"] = serde_json::json!(attempts);
        print_json(&json);
        return Ok(());
    }

    println!("ID:           {}", submission.id);
    println!("Status:       {}", submission.status);
    println!("Queued:       {}", if queued { "yes" } else { "no" });
    println!("Created:      {}", format_seconds(submission.created_at));
    println!("Pending:      {}", destinations_label(&submission.pending_destinations));
    for asset in &submission.assets {
        println!("Asset:        {}", asset);
    }
    println!("Content:      {}", truncate_content(&submission.content, 70));

    if !attempts.is_empty() {
        println!();
        for attempt in &attempts {
            println!("{}", attempt_line(attempt));
        }
    }
    Ok(())
}

fn attempt_line(attempt: &AttemptRecord) -> String {
    let when = format_millis(attempt.attempted_at);
    match (&attempt.error, &attempt.remote_id) {
        (Some(error), _) => format!(
            "{} | {} | failed | {}",
            when, attempt.destination, error.user_message
        ),
        (None, Some(remote_id)) => format!("{} | {} | posted | {}", when, attempt.destination, remote_id),
        (None, None) => format!("{} | {} | posted", when, attempt.destination),
    }
}

/// Take a submission out of the queue
async fn cmd_remove(db: &Database, id: &str) -> Result<()> {
    validate_id(id)?;

    let submission = SubmissionStore::get(db, id)
        .await?
        .ok_or_else(|| FanoutError::NotFound(id.to_string()))?;

    if !db.dequeue(id).await? {
        return Err(FanoutError::InvalidInput(format!(
            "Submission {} is not queued",
            id
        )));
    }

    if submission.status == SubmissionStatus::Posting {
        println!("Removed {} (posting will stop after the current attempt)", id);
    } else {
        println!("Removed {}", id);
    }
    Ok(())
}

/// Put a finished submission back at the tail of the queue
async fn cmd_requeue(db: &Database, id: &str) -> Result<()> {
    validate_id(id)?;

    let mut submission = SubmissionStore::get(db, id)
        .await?
        .ok_or_else(|| FanoutError::NotFound(id.to_string()))?;

    if db.current_queue().await?.iter().any(|s| s.id == id) {
        return Err(FanoutError::InvalidInput(format!(
            "Submission {} is already queued",
            id
        )));
    }
    if submission.pending_destinations.is_empty() {
        return Err(FanoutError::InvalidInput(format!(
            "Submission {} has no pending destinations",
            id
        )));
    }

    submission.status = SubmissionStatus::Queued;
    db.enqueue(&submission).await?;
    println!(
        "Requeued {} for {}",
        id,
        destinations_label(&submission.pending_destinations)
    );
    Ok(())
}

async fn cmd_clear(db: &Database) -> Result<()> {
    let cleared = db.dequeue_all().await?;
    println!("Cleared {} submission(s)", cleared);
    Ok(())
}

async fn cmd_settings(db: &Database, action: SettingsAction) -> Result<()> {
    match action {
        SettingsAction::Get { key } => {
            let settings = Settings::load(db).await?;
            let keys = match key {
                Some(key) => vec![key],
                None => SettingKey::ALL.to_vec(),
            };
            for key in keys {
                println!("{} = {}", key.name(), key.read(&settings));
            }
        }
        SettingsAction::Set { key, value } => {
            Settings::set_flag(db, key.store_key(), value).await?;
            println!("{} = {}", key.name(), value);
        }
    }
    Ok(())
}

/// Show the rate-limit ledger
async fn cmd_ledger(db: &Database, intervals: &IntervalTable, format: &str) -> Result<()> {
    validate_format(format)?;

    let now = now_millis();
    let mut rows = Vec::new();
    for (key, value) in db.kv_entries(LEDGER_PREFIX).await? {
        let destination = key.trim_start_matches(LEDGER_PREFIX).to_string();
        let Ok(last) = value.parse::<i64>() else {
            tracing::warn!(%destination, %value, "Skipping unreadable ledger entry");
            continue;
        };
        let due = last.saturating_add(intervals.min_interval(&destination) as i64);
        rows.push((destination, last, (due - now).max(0)));
    }

    if format == "json" {
        let json: Vec<_> = rows
            .iter()
            .map(|(destination, last, wait_ms)| {
                serde_json::json!({
                    "destination": destination,
                    "last_attempt_ms": last,
                    "min_interval_ms": intervals.min_interval(destination),
                    "next_slot_in_ms": wait_ms,
                })
            })
            .collect();
        print_json(&serde_json::Value::Array(json));
        return Ok(());
    }

    for (destination, last, wait_ms) in &rows {
        let ago = Duration::from_secs(((now - last).max(0) / 1000) as u64);
        let next = if *wait_ms == 0 {
            "ready".to_string()
        } else {
            format!(
                "ready in {}",
                humantime::format_duration(Duration::from_secs((*wait_ms as u64).div_ceil(1000)))
            )
        };
        println!(
            "{} | {} ({} ago) | {}",
            destination,
            format_millis(*last),
            humantime::format_duration(ago),
            next
        );
    }
    Ok(())
}

/// Show persisted failure reports
async fn cmd_logs(db: &Database, limit: usize, format: &str) -> Result<()> {
    validate_format(format)?;

    let logs = db.failure_logs(limit).await?;
    if format == "json" {
        print_json(&serde_json::json!(logs));
    } else {
        for entry in &logs {
            println!("{}", log_line(entry));
        }
    }
    Ok(())
}

fn log_line(entry: &FailureLogEntry) -> String {
    format!(
        "{} | {} | {} | {}",
        format_seconds(entry.created_at),
        entry.channel,
        entry.message,
        entry.payload.cause
    )
}

fn submission_json(submission: &Submission) -> serde_json::Value {
    serde_json::json!({
        "id": submission.id,
        "content": submission.content,
        "assets": submission.assets,
        "pending_destinations": submission.pending_destinations,
        "status": submission.status.as_str(),
        "created_at": submission.created_at,
    })
}

fn destinations_label(destinations: &[String]) -> String {
    if destinations.is_empty() {
        "-".to_string()
    } else {
        destinations.join(",")
    }
}

/// Truncate content to max characters with ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let truncated: String = single_line.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn format_millis(ms: i64) -> String {
    let time = UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64);
    humantime::format_rfc3339_seconds(time).to_string()
}

fn format_seconds(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}
