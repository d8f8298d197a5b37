//! WolfRecovery - Distributed Recovery Coordinator
//!
//! Command line front end: generate and validate recovery configuration,
//! and run complete recovery sessions against an in-process simulated group.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use wolfrecovery::config::{LoggingConfig, RecoveryConfig};
use wolfrecovery::group::{GroupMessage, MemberInfo};
use wolfrecovery::position::PositionSet;
use wolfrecovery::recovery::{
    CompletionCondition, RecoveryMetadata, RecoveryModule, RecoveryOutcome, RecoveryServices,
    RecoveryStatus,
};
use wolfrecovery::sim::{DonorScript, SimApplier, SimCertifier, SimChannel, SimGroup};

/// WolfRecovery - Distributed Recovery Coordinator
#[derive(Parser)]
#[command(name = "wolfrecovery")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfrecovery.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfrecovery.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Run a recovery session against a simulated group
    Simulate {
        /// Group size, including the joining member
        #[arg(short, long, default_value_t = 3)]
        members: usize,

        /// Number of donors whose receiver drops mid-transfer
        #[arg(short, long, default_value_t = 0)]
        failing_donors: usize,

        /// Completion condition of the session
        #[arg(long, value_enum, default_value_t = Mode::Positions)]
        mode: Mode,

        /// Deliver a failed recovery metadata message
        #[arg(long)]
        metadata_error: bool,

        /// Transactions queued in the applier while recovering
        #[arg(long, default_value_t = 100)]
        backlog: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Finish when the view change is applied
    View,
    /// Finish when the metadata watermark is applied
    Positions,
}

/// Result of a simulated recovery session
#[derive(Debug, Serialize)]
struct RecoveryReport {
    outcome: RecoveryOutcome,
    status: RecoveryStatus,
    donors_tried: Vec<Uuid>,
    announcements: Vec<GroupMessage>,
    leave_requests: Vec<String>,
    elapsed_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when one exists
    let logging = RecoveryConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(cli.config),
        Commands::Simulate {
            members,
            failing_donors,
            mode,
            metadata_error,
            backlog,
        } => run_simulate(cli.config, members, failing_donors, mode, metadata_error, backlog).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Write a default configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let config = RecoveryConfig::default().with_node(Uuid::new_v4(), "8.4.2");
    let content = format!(
        "# WolfRecovery Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );

    std::fs::write(&output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("Validate it with: wolfrecovery validate --config {}", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match RecoveryConfig::from_file(&config_path) {
        Ok(config) => {
            let recovery = &config.recovery;
            println!("✓ Configuration is valid");
            println!(
                "  Member:              {}",
                config.node.uuid.map(|u| u.to_string()).unwrap_or_else(|| "(generated)".into())
            );
            println!("  Version:             {}", config.node.version);
            println!("  Donor retries:       {}", recovery.donor_retry_count);
            println!("  Reconnect interval:  {} ms", recovery.reconnect_interval_ms);
            println!("  Metadata timeout:    {} ms", recovery.metadata_timeout_ms);
            println!("  Completion policy:   {:?}", recovery.completion_policy);
            println!("  TLS:                 {}", recovery.ssl.enabled);
            println!("  Compression:         {:?}", recovery.compression.algorithms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Run a full recovery session against the simulated group
async fn run_simulate(
    config_path: PathBuf,
    members: usize,
    failing_donors: usize,
    mode: Mode,
    metadata_error: bool,
    backlog: usize,
) -> Result<()> {
    anyhow::ensure!(members >= 1, "a group has at least one member");
    anyhow::ensure!(
        failing_donors < members,
        "at most {} donors can fail in a group of {}",
        members.saturating_sub(1),
        members
    );

    let base = if config_path.exists() {
        RecoveryConfig::from_file(&config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?
    } else {
        RecoveryConfig::default()
    };

    // Simulated sessions run on millisecond timings
    let local_uuid = base.member_uuid();
    let config = base
        .clone()
        .with_node(local_uuid, &base.node.version)
        .with_reconnect_interval(Duration::from_millis(20))
        .with_metadata_timeout(Duration::from_secs(5))
        .with_applier_poll_interval(Duration::from_millis(10))
        .with_stop_timeout(Duration::from_secs(5));
    let version = config.local_version()?;

    let group = Arc::new(SimGroup::new(MemberInfo::new(local_uuid, "localhost", 3306, version)));
    let channel = Arc::new(SimChannel::new(DonorScript::Complete, Duration::from_millis(25)));
    for n in 1..members {
        let donor = MemberInfo::new(Uuid::new_v4(), format!("donor-{}", n), 3306, version);
        if n <= failing_donors {
            channel.set_script(donor.uuid, DonorScript::DropReceiver);
        }
        group.add_member(donor).await;
    }

    let applier = Arc::new(SimApplier::new(Duration::from_millis(1)));
    applier.enqueue(backlog);
    let certifier = Arc::new(SimCertifier::new());

    let services = RecoveryServices {
        membership: group.clone(),
        messenger: group.clone(),
        applier: applier.clone(),
        certifier: certifier.clone(),
        channel: channel.clone(),
    };
    let module = Arc::new(RecoveryModule::new(config, services)?);

    let view_id = format!("{}:{}", chrono::Utc::now().timestamp(), members);
    let condition = match mode {
        Mode::View => {
            let module = Arc::downgrade(&module);
            channel.set_view_change_hook(Box::new(move || {
                if let Some(module) = module.upgrade() {
                    module.finish_state_transfer();
                }
            }));
            CompletionCondition::View { view_id: view_id.clone() }
        }
        Mode::Positions => CompletionCondition::PositionSet { view_id: view_id.clone() },
    };

    let started = Instant::now();
    module.start("simulated_group", condition).await?;

    if mode == Mode::Positions {
        let delivery = if metadata_error {
            Err("donor could not send recovery metadata".to_string())
        } else {
            let mut watermark = PositionSet::new();
            watermark.add_interval(Uuid::new_v4(), 1, 1000);
            Ok(RecoveryMetadata {
                view_id,
                certification_info: Bytes::from_static(b"simulated certification info"),
                watermark,
            })
        };
        module.deliver_recovery_metadata(delivery)?;
    }

    let outcome = module.wait_for_completion().await?;
    let report = RecoveryReport {
        outcome,
        status: module.status(),
        donors_tried: channel.connection_attempts(),
        announcements: group.broadcasts(),
        leave_requests: group.leave_requests(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
