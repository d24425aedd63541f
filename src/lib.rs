//! Periodic backups with restic and directory mirrors with rclone and rsync.
//!
//! The configuration directory holds `conf.yml` and one pinned key file per
//! SSH target under `keys/`. Each configured target is one of five kinds
//! (see [`targets::TargetKind`]); passes in [`orchestrator`] run them one at
//! a time in the order they are declared.

pub mod command;
pub mod config;
pub mod orchestrator;
pub mod ssh;
pub mod targets;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Configuration, DEFAULT_CONF_DIR};
use orchestrator::{Availability, PassReport, TargetStatus};
use targets::Target;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "restic-service",
    version,
    about = "Periodic backups and mirrors with restic, rclone and rsync"
)]
pub struct Cli {
    /// Configuration directory, holding conf.yml and keys/
    #[arg(long, global = true, env = "RESTIC_SERVICE_CONF", default_value = DEFAULT_CONF_DIR)]
    pub conf: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Print reports as JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show which targets are reachable right now
    Whereami,
    /// Synchronize all (or the named) available targets
    Sync {
        targets: Vec<String>,
    },
    /// Apply the retention policy of restic targets
    Forget {
        targets: Vec<String>,
    },
    /// Periodically sync then forget, forever
    Auto {
        targets: Vec<String>,
    },
    /// Validate the configuration and print a summary
    Check,
    /// Query the host keys of an SSH target and pin them
    PinKeys {
        target: String,
    },
    /// Remove session aliases left in the SSH client configuration
    CleanupSsh,
}

/// Install the global tracing subscriber, logging to stderr.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<ExitCode> {
    let conf = Configuration::load_dir(&cli.conf)
        .with_context(|| format!("cannot load configuration from {}", cli.conf.display()))?;
    if conf.is_empty() {
        warn!(conf = %cli.conf.display(), "no targets configured");
    }

    match cli.command {
        Commands::Whereami => {
            let targets = orchestrator::select_targets(&conf, &[])?;
            print_availability(&orchestrator::whereami(&targets), cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync { targets } => {
            let selected = orchestrator::select_targets(&conf, &targets)?;
            let report = orchestrator::run_sync(&selected);
            print_pass(&report, cli.json)?;
            Ok(exit_code(&report))
        }
        Commands::Forget { targets } => {
            let selected = orchestrator::select_targets(&conf, &targets)?;
            let report = orchestrator::run_forget(&selected);
            print_pass(&report, cli.json)?;
            Ok(exit_code(&report))
        }
        Commands::Auto { targets } => run_auto(&conf, &targets, cli.json),
        Commands::Check => {
            print_check(&conf);
            Ok(ExitCode::SUCCESS)
        }
        Commands::PinKeys { target } => {
            let target = conf.target_by_name(&target)?;
            let keys = target
                .pin_keys()
                .with_context(|| format!("cannot pin host keys of '{}'", target.name()))?;
            if let Some(ssh) = target.ssh() {
                println!(
                    "pinned {} key(s) of {} in {}",
                    keys.len(),
                    ssh.host(),
                    ssh.keys_path().display()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::CleanupSsh => {
            for target in conf.targets() {
                let Some(ssh) = target.ssh() else { continue };
                if ssh
                    .cleanup()
                    .with_context(|| format!("cannot clean up alias of '{}'", target.name()))?
                {
                    println!("removed {}", ssh.alias());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_auto(conf: &Configuration, names: &[String], json: bool) -> Result<ExitCode> {
    let selected = orchestrator::select_targets(conf, names)?;
    loop {
        info!(targets = selected.len(), "starting automatic pass");
        print_pass(&orchestrator::run_sync(&selected), json)?;
        print_pass(&orchestrator::run_forget(&selected), json)?;
        info!(period_secs = conf.period().as_secs(), "finished automatic pass");
        std::thread::sleep(conf.period());
    }
}

fn exit_code(report: &PassReport) -> ExitCode {
    if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// =============================================================================
// Output
// =============================================================================

fn print_availability(report: &[Availability], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for entry in report {
        let answer = if entry.available {
            "yes".green()
        } else {
            "no".red()
        };
        match &entry.error {
            Some(error) => println!("{}: {answer} ({error})", entry.target),
            None => println!("{}: {answer}", entry.target),
        }
    }
    Ok(())
}

fn print_pass(report: &PassReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
        return Ok(());
    }
    println!(
        "{} - {} pass: {} ok, {} failed, {} skipped",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        report.operation,
        report.succeeded(),
        report.failed(),
        report.skipped()
    );
    for entry in &report.targets {
        let status = match &entry.status {
            TargetStatus::Success => entry.status.to_string().green(),
            s if s.is_failure() => s.to_string().red(),
            s => s.to_string().yellow(),
        };
        println!("  {}: {status} ({} ms)", entry.target, entry.duration_ms);
    }
    Ok(())
}

fn print_check(conf: &Configuration) {
    println!(
        "{} {}",
        "restic-service".bold(),
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    if let Some(built) = option_env!("VERGEN_BUILD_TIMESTAMP") {
        println!("built: {built}");
    }
    println!("configuration: {}", conf.conf_dir().display());
    println!("period: {}s", conf.period().as_secs());
    match conf.bandwidth_limit() {
        Some(limit) => println!("bandwidth limit: {limit} B/s"),
        None => println!("bandwidth limit: none"),
    }

    println!("tools:");
    for (tool, entry) in conf.tools().iter() {
        let state = if entry.available {
            "found".green()
        } else {
            "missing".red()
        };
        println!("  {tool}: {} ({state})", entry.path.display());
    }

    let auto = conf.auto_update();
    println!("auto-update:");
    println!("  restic-service: {}", auto.restic_service);
    println!("  restic: {}", auto.restic);
    println!("  rclone: {}", auto.rclone);

    println!("targets:");
    for target in conf.targets() {
        print_target(target);
    }
}

fn print_target(target: &Target) {
    println!(
        "  {} [{}] {}",
        target.name().bold(),
        target.kind(),
        target.describe()
    );
    if let Some(ssh) = target.ssh() {
        let pinned = ssh.trusted_keys().len();
        let keys = if pinned == 0 {
            "no pinned keys, run pin-keys".yellow()
        } else {
            format!("{pinned} pinned key(s)").normal()
        };
        println!("    {keys}");
    }
}
