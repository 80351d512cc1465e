//! Fleetlink - fleet enrollment and telemetry shipping agent
//!
//! Enrolls the device with a fleet server, buffers telemetry records
//! locally and delivers them in budgeted sync cycles.

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleetlink_core::{ConfigLoader, FleetlinkConfig};
use fleetlink_sync::{Agent, EnrollmentResult, SyncBudget};
use serde::Serialize;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// How often `run` compacts acknowledged and expired records
const COMPACT_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "fleetlink")]
#[command(version)]
#[command(about = "Fleet enrollment and telemetry shipping agent", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format (json, text)
    #[arg(short, long, global = true)]
    format: Option<String>,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "FLEETLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll this device with the fleet server
    Enroll {
        /// Enrollment token (defaults to fleet.enrollment_token)
        #[arg(short, long)]
        token: Option<String>,

        /// Fleet server URL (defaults to fleet.url)
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Buffer records, one per line, for delivery
    Append {
        /// Input file (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Run a single sync cycle
    Sync {
        /// Maximum number of batches to send
        #[arg(long)]
        max_batches: Option<u32>,

        /// Maximum cycle duration in seconds
        #[arg(long)]
        max_duration_secs: Option<u64>,
    },

    /// Run the agent until interrupted
    Run,

    /// Show enrollment and queue status
    Status,

    /// Remove acknowledged and expired records
    Compact,

    /// Forget the device identity (buffered records are kept)
    Unenroll,

    /// Send a single check-in
    Heartbeat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::new()
        .with_cli_path(cli.config.clone())
        .load()
        .context("failed to load configuration")?;
    if let Some(format) = &cli.format {
        config.agent.log_format = format.clone();
    }
    let json = config.agent.log_format.eq_ignore_ascii_case("json");

    // Setup logging - CLI verbose flag takes precedence, then config
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.agent.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    match cli.command {
        Commands::Enroll { token, url } => enroll_command(config, token, url, json).await,
        Commands::Append { input } => append_command(&config, input),
        Commands::Sync {
            max_batches,
            max_duration_secs,
        } => sync_command(&config, max_batches, max_duration_secs, json).await,
        Commands::Run => run_command(&config).await,
        Commands::Status => status_command(&config, json),
        Commands::Compact => compact_command(&config),
        Commands::Unenroll => unenroll_command(&config).await,
        Commands::Heartbeat => heartbeat_command(&config).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn enroll_command(
    mut config: FleetlinkConfig,
    token: Option<String>,
    url: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    if let Some(url) = url {
        config.fleet.url = url;
    }
    let token = token
        .or_else(|| config.fleet.enrollment_token.clone())
        .context("no enrollment token given (use --token or fleet.enrollment_token)")?;

    let agent = Agent::open(&config)?;
    let result = agent.enrollment().enroll(&token).await?;
    let identity = result.identity();

    if json {
        return print_json(identity);
    }
    match &result {
        EnrollmentResult::Enrolled(_) => println!("Enrolled as {}", identity.device_id),
        EnrollmentResult::AlreadyEnrolled(_) => {
            println!("Already enrolled as {}", identity.device_id)
        }
    }
    if let Some(policy) = &identity.policy_id {
        println!("Policy: {}", policy);
    }
    Ok(())
}

fn append_command(config: &FleetlinkConfig, input: Option<PathBuf>) -> anyhow::Result<()> {
    let reader: Box<dyn BufRead> = match &input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }

    let agent = Agent::open(config)?;
    let ids = agent.events().append_many(&lines)?;
    info!("Buffered {} records", ids.len());
    println!("Buffered {} records", ids.len());
    Ok(())
}

async fn sync_command(
    config: &FleetlinkConfig,
    max_batches: Option<u32>,
    max_duration_secs: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let mut budget = SyncBudget::from_settings(&config.sync);
    if let Some(n) = max_batches {
        budget.max_batches = n;
    }
    if let Some(secs) = max_duration_secs {
        budget.max_duration = Duration::from_secs(secs);
    }

    let agent = Agent::open(config)?;
    let report = agent.engine().run_cycle(budget).await?;

    if json {
        return print_json(&report);
    }
    println!("Outcome:  {}", report.outcome);
    println!("Batches:  {}", report.batches);
    println!("Acked:    {}", report.acked);
    println!("Requeued: {}", report.requeued);
    println!("Failed:   {}", report.failed());
    if let Some(err) = &report.last_error {
        println!("Last error: {}", err);
    }
    Ok(())
}

async fn run_command(config: &FleetlinkConfig) -> anyhow::Result<()> {
    let agent = Agent::open(config)?;

    if !agent.enrollment().is_enrolled() {
        match &config.fleet.enrollment_token {
            Some(token) => match agent.enrollment().enroll(token).await {
                Ok(result) => info!("Enrolled as {}", result.identity().device_id),
                Err(e) => warn!("Enrollment failed, records will stay buffered: {}", e),
            },
            None => warn!("Device is not enrolled and no enrollment token is configured"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = agent.scheduler().clone();
    let scheduler_rx = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(scheduler_rx).await });

    let heartbeat_handle = if config.heartbeat.enabled {
        Some(agent.heartbeat().clone().start(shutdown_rx.clone()))
    } else {
        None
    };

    let events = agent.events().clone();
    let mut compact_rx = shutdown_rx;
    let compact_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(COMPACT_INTERVAL);
        loop {
            tokio::select! {
                _ = compact_rx.changed() => break,
                _ = ticker.tick() => match events.compact() {
                    Ok(0) => {}
                    Ok(n) => info!("Compacted {} records", n),
                    Err(e) => warn!("Compaction failed: {}", e),
                },
            }
        }
    });

    println!();
    println!("  Fleetlink v{}", env!("CARGO_PKG_VERSION"));
    println!("  Fleet server: {}", config.fleet.url);
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_tx.send(true)?;

    scheduler_handle.await?;
    if let Some(handle) = heartbeat_handle {
        handle.await?;
    }
    compact_handle.await?;

    info!("Agent stopped");
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    enrollment: fleetlink_sync::EnrollmentState,
    queue: fleetlink_sync::StoreCounts,
    stats: fleetlink_sync::AgentStats,
}

fn status_command(config: &FleetlinkConfig, json: bool) -> anyhow::Result<()> {
    let agent = Agent::open(config)?;
    let report = StatusReport {
        enrollment: agent.enrollment().state()?,
        queue: agent.events().counts()?,
        stats: agent.database().agent_stats().load()?,
    };

    if json {
        return print_json(&report);
    }

    println!();
    println!("Fleetlink v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Enrollment:");
    println!("  Status: {}", report.enrollment.status);
    if let Some(device_id) = &report.enrollment.device_id {
        println!("  Device: {}", device_id);
    }
    if let Some(policy) = &report.enrollment.policy_id {
        println!("  Policy: {}", policy);
    }
    if let Some(err) = &report.enrollment.last_error {
        println!("  Last error: {}", err);
    }

    println!();
    println!("Queue:");
    println!("  Pending:   {}", report.queue.pending);
    println!("  In flight: {}", report.queue.in_flight);
    println!("  Acked:     {}", report.queue.acked);
    println!("  Failed:    {}", report.queue.failed);
    if let Some(oldest) = report.queue.oldest_pending_at {
        println!("  Oldest pending: {}", oldest.to_rfc3339());
    }

    println!();
    println!("Agent:");
    println!("  Health:    {}", report.stats.agent_health.as_str());
    println!("  Check-ins: {}", report.stats.total_checkins);
    println!("  Failures:  {}", report.stats.total_failures);
    if let Some(at) = report.stats.last_sent_at {
        println!(
            "  Last sent: {} records at {}",
            report.stats.last_sent_count,
            at.to_rfc3339()
        );
    }
    println!();

    Ok(())
}

fn compact_command(config: &FleetlinkConfig) -> anyhow::Result<()> {
    let agent = Agent::open(config)?;
    let removed = agent.events().compact()?;
    println!("Removed {} records", removed);
    Ok(())
}

async fn unenroll_command(config: &FleetlinkConfig) -> anyhow::Result<()> {
    let agent = Agent::open(config)?;
    agent.enrollment().unenroll().await?;
    let pending = agent.events().counts()?.unsent();
    println!("Device unenrolled, {} records remain buffered", pending);
    Ok(())
}

async fn heartbeat_command(config: &FleetlinkConfig) -> anyhow::Result<()> {
    let agent = Agent::open(config)?;
    let response = agent.heartbeat().send_heartbeat().await?;
    println!("Check-in sent, {} actions received", response.actions.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "fleetlink",
            "status",
            "-vv",
            "--format",
            "json",
            "--config",
            "/tmp/fleetlink.toml",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.format.as_deref(), Some("json"));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/fleetlink.toml")));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_global_flags_before_subcommand() {
        let cli = Cli::try_parse_from(["fleetlink", "-v", "--format", "text", "sync"]).unwrap();
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.format.as_deref(), Some("text"));
        assert!(matches!(cli.command, Commands::Sync { .. }));
    }
}
