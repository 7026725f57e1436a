//! # Calendar CLI
//!
//! Runs one of the two notification roles against the configured
//! event store and message broker.
//!
//! Usage:
//!   calendar scheduler                 # Publish due notifications, prune old events
//!   calendar sender                    # Consume and log notifications
//!   calendar config show               # Print the effective configuration
//!   calendar config check              # Validate the configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use calendar_core::config::{CalendarConfig, LogMode, LoggerConfig};
use calendar_core::traits::EventStorage;
use calendar_mq::{AmqpConnector, Consumer, LogHandler, Producer};
use calendar_scheduler::Scheduler;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "calendar",
    version,
    about = "📅 Calendar notification scheduler and sender",
    long_about = "Publishes reminders for upcoming calendar events to a message broker\nand consumes them on the other side."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish notifications for due events and prune expired ones
    Scheduler,

    /// Consume notifications and log each one
    Sender,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate configuration for both roles
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli
        .config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
        .unwrap_or_else(CalendarConfig::default_path);
    let config = CalendarConfig::load_from(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    let _guard = init_logging(&config.logger, cli.verbose)?;
    if !path.exists() {
        tracing::warn!("config file {} not found, using defaults", path.display());
    }

    match cli.command {
        Commands::Scheduler => run_scheduler(config).await?,
        Commands::Sender => run_sender(config).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", config.to_toml()?),
            ConfigAction::Check => {
                config.validate_scheduler()?;
                config.validate_consumer()?;
                println!("✅ {} is valid", path.display());
            }
        },
    }

    Ok(())
}

/// Install the global subscriber. The returned guard flushes file output
/// on drop and must live until exit.
fn init_logging(logger: &LoggerConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { logger.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,calendar={level},calendar_core={level},calendar_storage={level},calendar_mq={level},calendar_scheduler={level}"
        ))
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match logger.mode {
        LogMode::Console => {
            if logger.json {
                builder.json().init();
            } else {
                builder.init();
            }
            Ok(None)
        }
        LogMode::File => {
            let path = logger.expanded_path();
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file = path
                .file_name()
                .with_context(|| format!("logger.path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;

            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
            let builder = builder.with_writer(writer).with_ansi(false);
            if logger.json {
                builder.json().init();
            } else {
                builder.init();
            }
            Ok(Some(guard))
        }
    }
}

/// Root token, cancelled on ctrl-c.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            return;
        }
        tracing::info!("interrupt received, shutting down");
        trigger.cancel();
    });
    cancel
}

async fn run_scheduler(config: CalendarConfig) -> Result<()> {
    config.validate_scheduler()?;
    let cancel = cancel_on_ctrl_c();

    let storage = calendar_storage::create_storage(&config.storage, config.rabbitmq.retry_policy(), &cancel)
        .await
        .context("storage unavailable")?;
    tracing::info!(backend = storage.name(), "storage ready");

    let producer = Producer::connect(Arc::new(AmqpConnector), &config.rabbitmq, &cancel)
        .await
        .context("broker unavailable")?;
    tracing::info!(exchange = %config.rabbitmq.exchange, "producer ready");

    let scheduler = Scheduler::new(storage.clone(), Arc::new(producer), &config.notifications)?;
    let result = scheduler.run(cancel).await;

    if let Err(e) = storage.close().await {
        tracing::error!(error = %e, "storage close failed");
    }
    result?;
    tracing::info!("scheduler stopped");
    Ok(())
}

async fn run_sender(config: CalendarConfig) -> Result<()> {
    config.validate_consumer()?;
    let cancel = cancel_on_ctrl_c();

    let consumer = Consumer::connect(Arc::new(AmqpConnector), &config.rabbitmq, &cancel)
        .await
        .context("broker unavailable")?;
    tracing::info!(queue = %config.rabbitmq.queue, "sender ready");

    let result = consumer.handle(&LogHandler, &cancel).await;
    if let Err(e) = consumer.shutdown().await {
        tracing::error!(error = %e, "consumer shutdown failed");
    }
    result?;
    tracing::info!("sender stopped");
    Ok(())
}
