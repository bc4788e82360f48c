//! Binary entrypoint for the meshdock CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `discover [--json]` - list serial and BLE candidates
//! - `find` - discovery plus BLE-to-node matches by MAC
//! - `validate <id> [--ble] [--expect X]` - probe one candidate read-only
//! - `commit <id> [--ble] [--dry-run]` - validate, then bind the candidate as the active device
//! - `auto [--dry-run] [--prefer ID]` - discover, validate all and commit the best candidate
//! - `undo` - restore the device that was active before the last commit
//! - `status` - show the active device and undo availability
//! - `nodes [--positions] [--node ID]` - cached node telemetry from the active device
//!
//! See the library crate docs for module-level details: `meshdock::`.
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;

use meshdock::cache::Freshness;
use meshdock::config::Config;
use meshdock::discovery::Candidate;
use meshdock::onboard::Onboarding;
use meshdock::telemetry::{NodeSummary, Telemetry};

#[derive(Parser)]
#[command(name = "meshdock")]
#[command(about = "Onboard Meshtastic radios and serve cached node telemetry")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Enumerate serial ports and scan for BLE radios
    Discover {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Discover and pair BLE advertisers with mesh nodes by MAC
    Find,
    /// Probe one candidate without changing anything
    Validate {
        /// Serial port (COM4, /dev/ttyUSB0) or BLE address
        id: String,
        /// Treat the identifier as a BLE address
        #[arg(long)]
        ble: bool,
        /// Node id, MAC or name that must appear in the device's answer
        #[arg(long)]
        expect: Option<String>,
    },
    /// Validate a candidate, then make it the active device
    Commit {
        id: String,
        #[arg(long)]
        ble: bool,
        /// Report what would change without persisting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Discover, validate every candidate and commit the first reachable one
    Auto {
        #[arg(long)]
        dry_run: bool,
        /// Identifier to choose when it is among the reachable candidates
        #[arg(long)]
        prefer: Option<String>,
    },
    /// Restore the device that was active before the most recent commit
    Undo,
    /// Show the active device and whether an undo is available
    Status,
    /// Show node telemetry from the active device
    Nodes {
        /// Only nodes reporting a position
        #[arg(long, conflicts_with = "node")]
        positions: bool,
        /// A single node by id, MAC or short name
        #[arg(long)]
        node: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        println!("Wrote default configuration to {}", cli.config);
        return Ok(());
    }

    let config = match Config::load(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}; using built-in defaults (run `meshdock init` to create a config file)");
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };
    init_logging(&Some(config.clone()), cli.verbose);
    let onboarding = Onboarding::open(&config).await?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Discover { json } => {
            let report = onboarding.discover().await;
            if json {
                print_json(&report)?;
            } else {
                if report.is_empty() {
                    println!("No candidates found.");
                }
                for c in report.candidates() {
                    let meta: Vec<String> = c.metadata.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    println!("{:<6} {:<24} {}", c.kind, c.identifier, meta.join(" "));
                }
                for d in &report.diagnostics {
                    println!("warning: {} discovery degraded: {}", d.transport, d.reason);
                }
            }
        }
        Commands::Find => {
            print_json(&onboarding.find().await)?;
        }
        Commands::Validate { id, ble, expect } => {
            let candidate = candidate_for(&id, ble);
            let result = onboarding.validate(&candidate, expect.as_deref()).await;
            print_json(&result)?;
        }
        Commands::Commit { id, ble, dry_run } => {
            let candidate = candidate_for(&id, ble);
            let validation = onboarding.validate(&candidate, None).await;
            if !validation.is_reachable() && !dry_run {
                bail!(
                    "{} is {:?}: {}",
                    candidate.identifier,
                    validation.status,
                    validation.reason
                );
            }
            let result = onboarding.commit(&candidate, dry_run).await?;
            print_json(&result)?;
        }
        Commands::Auto { dry_run, prefer } => {
            let summary = onboarding.auto_connect(dry_run, prefer.as_deref()).await?;
            print_json(&summary)?;
        }
        Commands::Undo => {
            let result = onboarding.undo().await?;
            match &result.restored_identifier {
                Some(id) => println!("Restored {} (snapshot {})", id, result.snapshot_id),
                None => println!(
                    "Cleared the active device (snapshot {})",
                    result.snapshot_id
                ),
            }
        }
        Commands::Status => {
            print_json(&onboarding.status()?)?;
        }
        Commands::Nodes { positions, node } => {
            let telemetry = onboarding.telemetry();
            match node {
                Some(id) => {
                    let read = telemetry.node(&id).await?;
                    report_staleness(&read.freshness);
                    match &read.data {
                        Some(node) => print_json(node)?,
                        None => bail!("node {} not found", id),
                    }
                }
                None => {
                    let read = if positions {
                        telemetry.positions().await?
                    } else {
                        telemetry.nodes().await?
                    };
                    print_nodes(&read);
                }
            }
        }
    }

    Ok(())
}

fn candidate_for(id: &str, ble: bool) -> Candidate {
    if ble {
        Candidate::bluetooth(id)
    } else {
        Candidate::from_identifier(id)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_staleness(freshness: &Freshness) {
    if let Freshness::Stale { fetch_error } = freshness {
        eprintln!("warning: showing cached data, refresh failed: {fetch_error}");
    }
}

fn print_nodes(read: &Telemetry<Vec<NodeSummary>>) {
    report_staleness(&read.freshness);
    println!(
        "{} node(s) as of {}",
        read.data.len(),
        read.fetched_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for n in &read.data {
        let position = n
            .position
            .map(|p| format!("{:.5},{:.5}", p.lat, p.lon))
            .unwrap_or_default();
        println!(
            "{:<11} {:<24} {:<6} {:>5} {}",
            n.id,
            n.long_name.as_deref().unwrap_or("-"),
            n.short_name.as_deref().unwrap_or("-"),
            n.battery.map(|b| format!("{b:.0}%")).unwrap_or_default(),
            position
        );
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match (verbosity, config) {
        (0, Some(cfg)) => cfg
            .logging
            .level
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info),
        (0, None) => log::LevelFilter::Info,
        (1, _) => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.as_ref().and_then(|cfg| cfg.logging.file.clone());
    let audit_path = config.as_ref().and_then(|cfg| cfg.logging.audit_file.clone());
    let file = log_file.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    let write_mutex = file.map(|f| std::sync::Arc::new(std::sync::Mutex::new(f)));
    // With a log file and no terminal, keep stderr quiet
    let is_tty = atty::is(atty::Stream::Stderr);

    builder.format(move |fmt, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("{} [{}] {}", ts, record.level(), record.args());

        if let Some(ref mutex) = write_mutex {
            if let Ok(mut guard) = mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
        }

        if record.target() == "audit" {
            if let Some(ref path) = audit_path {
                if let Ok(mut af) = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                {
                    let _ = writeln!(af, "{}", line);
                }
            }
        }

        if write_mutex.is_none() || is_tty {
            writeln!(fmt, "{}", line)
        } else {
            Ok(())
        }
    });
    let _ = builder.try_init();
}
