use anyhow::Context;
use clap::{Parser, Subcommand};
use kf_core::{ConfigValidator, DataplaneConfig, DataplaneError};
use kf_iptables::{PolicyChange, PolicyManager};
use kf_metrics::{MetricsCollector, MetricsServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kfence")]
#[command(version, about = "NetworkPolicy dataplane for iptables nodes", long_about = None)]
struct Cli {
    /// Dataplane config file (YAML). Built-in defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the base chains and route forwarded traffic into them
    Init,
    /// Remove the jump rule and every chain this engine owns
    Reset,
    /// Run one reconcile pass (jump position + stale chain cleanup)
    Reconcile,
    /// Show the current dataplane state
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply a policy change file as one atomic restore
    Apply {
        /// Change file (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        file: PathBuf,

        /// Print the restore program instead of applying it
        #[arg(long)]
        dry_run: bool,
    },
    /// Initialize, then reconcile periodically until interrupted
    Run {
        /// Serve Prometheus metrics on 127.0.0.1:<port>
        #[arg(short, long)]
        metrics_port: Option<u16>,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the configuration
    Check,
    /// Print the effective configuration as YAML
    Show,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            tokio::runtime::Runtime::new()?.block_on(async { init_dataplane(config).await })?;
        }
        Commands::Reset => {
            tokio::runtime::Runtime::new()?.block_on(async { reset_dataplane(config).await })?;
        }
        Commands::Reconcile => {
            tokio::runtime::Runtime::new()?.block_on(async { reconcile_once(config).await })?;
        }
        Commands::Status { json } => {
            tokio::runtime::Runtime::new()?.block_on(async { show_status(config, json).await })?;
        }
        Commands::Apply { file, dry_run } => {
            tokio::runtime::Runtime::new()?
                .block_on(async { apply_change(config, &file, dry_run).await })?;
        }
        Commands::Run { metrics_port } => {
            tokio::runtime::Runtime::new()?
                .block_on(async { run_dataplane(config, metrics_port).await })?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Check => check_config(&config)?,
            ConfigAction::Show => print!("{}", config.to_yaml()?),
        },
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DataplaneConfig> {
    match path {
        Some(path) => DataplaneConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(DataplaneConfig::default()),
    }
}

fn check_config(config: &DataplaneConfig) -> anyhow::Result<()> {
    let warnings = ConfigValidator::new(config).validate();

    if warnings.is_empty() {
        println!("✅ Configuration is valid");
        return Ok(());
    }

    let mut has_errors = false;
    for warning in &warnings {
        warning.display();
        if warning.is_error() {
            has_errors = true;
        }
        println!();
    }

    if has_errors {
        anyhow::bail!("Configuration validation failed. Please fix the errors above.");
    }
    println!("⚠️  Configuration has warnings");
    Ok(())
}

async fn init_dataplane(config: DataplaneConfig) -> anyhow::Result<()> {
    println!("🚀 Initializing {} chains...", config.chains.top_level);
    let mut manager = PolicyManager::system(config);
    manager.initialize().await.context("initialization failed")?;
    println!("✅ Dataplane initialized");
    Ok(())
}

async fn reset_dataplane(config: DataplaneConfig) -> anyhow::Result<()> {
    println!("🧹 Removing {} chains...", config.chains.top_level);
    let mut manager = PolicyManager::system(config);
    manager.reset().await.context("reset failed")?;
    println!("✅ Dataplane removed");
    Ok(())
}

async fn reconcile_once(config: DataplaneConfig) -> anyhow::Result<()> {
    let mut manager = PolicyManager::system(config);
    manager.reconcile().await.context("reconcile failed")?;
    println!("✅ Reconciled");
    Ok(())
}

async fn show_status(config: DataplaneConfig, json: bool) -> anyhow::Result<()> {
    let manager = PolicyManager::system(config);
    let status = manager.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        status.display();
    }
    Ok(())
}

async fn apply_change(config: DataplaneConfig, file: &Path, dry_run: bool) -> anyhow::Result<()> {
    let change = PolicyChange::from_file(file)
        .with_context(|| format!("failed to load policy change from {}", file.display()))?;
    let tx = change.into_transaction(&config.iptables.table);

    if dry_run {
        print!("{}", tx.render());
        println!("\n⚠️  Dry run mode. Nothing was applied.");
        return Ok(());
    }

    println!("⚡ Applying {} restore line(s)...", tx.len());
    let mut manager = PolicyManager::system(config);
    // this process's stale set dies with it, so destroy retired chains now
    manager
        .apply_and_cleanup(tx)
        .await
        .context("policy change was not fully applied")?;
    println!("✅ Policy change applied");
    Ok(())
}

async fn run_dataplane(config: DataplaneConfig, metrics_port: Option<u16>) -> anyhow::Result<()> {
    let collector = Arc::new(MetricsCollector::new()?);

    if let Some(port) = metrics_port {
        let server = MetricsServer::new(collector.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                error!(error = %e, "metrics server stopped");
            }
        });
    }

    let interval = Duration::from_secs(config.reconcile_interval_secs.max(1));
    let mut manager = PolicyManager::system(config).with_recorder(collector.clone());

    match manager.initialize().await {
        Ok(()) => info!("dataplane initialized"),
        // chains exist; the next reconcile pass retries the jump
        Err(e @ DataplaneError::JumpReposition(_)) => {
            warn!(error = %e, "jump rule not positioned, continuing")
        }
        Err(e) => return Err(e).context("initialization failed"),
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = manager.reconcile().await;
                collector.record_reconcile(result.is_ok());
                if let Err(e) = result {
                    warn!(error = %e, retryable = e.is_retryable(), "reconcile pass failed");
                }

                match manager.status().await {
                    Ok(status) => collector.update_from_status(&status),
                    Err(e) => warn!(error = %e, "failed to collect dataplane status"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping reconcile loop");
                break;
            }
        }
    }

    Ok(())
}
