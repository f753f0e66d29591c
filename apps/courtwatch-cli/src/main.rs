use std::{
    collections::HashSet,
    env,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use courtwatch_auth::{ChatCodeSource, CodeSource, StaticCodeSource, StdinCodeSource};
use courtwatch_notify::{
    format::{describe, format_self_check},
    ChatChannel, TelegramChannel,
};
use courtwatch_ops::{init_tracing, Shutdown};
use courtwatch_orchestrator::{CycleEvent, Monitor};
use courtwatch_site::{HttpSite, SiteDriver};
use courtwatch_types::config::{CodeSourceKind, CourtwatchConfig};
use futures::{stream::BoxStream, StreamExt};
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "configs/courtwatch.toml";

#[derive(Parser, Debug)]
#[command(name = "courtwatch", about = "Watches court availability and announces new slots")]
struct Args {
    /// TOML configuration file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "COURTWATCH_CONFIG",
        default_value = DEFAULT_CONFIG
    )]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run a single check and exit with its status.
    Once,
    /// Keep checking on the configured interval (default).
    Watch,
    /// Validate the configuration, send a test message and reach the site.
    Check,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    if args.verbose {
        config.ops.log_level = "debug".into();
    }
    init_tracing(&config.ops)?;

    match args.command.unwrap_or(Command::Watch) {
        Command::Check => self_check(&config).await,
        command => monitor(config, command).await,
    }
}

fn load_config(path: &Path) -> Result<CourtwatchConfig> {
    let mut config = if path.exists() {
        CourtwatchConfig::from_file(path)?
    } else {
        eprintln!(
            "No config file at '{}', using built-in defaults and the environment.",
            path.display()
        );
        CourtwatchConfig::default()
    };
    config.apply_env_overrides(|key| env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("invalid configuration from '{}'", path.display()))?;
    Ok(config)
}

fn request_timeout(config: &CourtwatchConfig) -> Duration {
    Duration::from_secs(config.site.request_timeout_secs)
}

async fn monitor(config: CourtwatchConfig, command: Command) -> Result<ExitCode> {
    let channel = Arc::new(TelegramChannel::new(
        &config.credentials.bot_token,
        &config.credentials.chat_id,
        request_timeout(&config),
    )?);
    let codes = code_source(&config, Arc::clone(&channel))?;
    let site = HttpSite::new(config.site.clone())?;
    let shutdown = Shutdown::new();
    stop_on_ctrl_c(shutdown.clone());

    let mut monitor = Monitor::assemble(config, site, codes, channel, shutdown)?;
    let printer = tokio::spawn(print_slots(monitor.subscribe()));

    let status = match command {
        Command::Once => {
            if monitor.run_cycle().await.result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        _ => {
            monitor.run().await;
            ExitCode::SUCCESS
        }
    };

    // Dropping the monitor closes the event bus and lets the printer drain.
    drop(monitor);
    if let Err(err) = printer.await {
        warn!("Slot printer stopped abnormally: {err}");
    }
    Ok(status)
}

fn code_source(
    config: &CourtwatchConfig,
    channel: Arc<TelegramChannel>,
) -> Result<Box<dyn CodeSource>> {
    let source: Box<dyn CodeSource> = match config.auth.code_source {
        CodeSourceKind::Stdin => Box::new(StdinCodeSource::new()),
        CodeSourceKind::Chat => Box::new(ChatCodeSource::new(
            channel,
            config.credentials.chat_id.clone(),
            Duration::from_secs(config.auth.code_poll_secs.max(1)),
        )),
        CodeSourceKind::Static => match config.auth.static_code.as_deref() {
            Some(code) => Box::new(StaticCodeSource::new(code)?),
            None => {
                warn!("Static code source selected but no code configured; logins will time out");
                Box::new(StaticCodeSource::empty())
            }
        },
    };
    Ok(source)
}

fn stop_on_ctrl_c(shutdown: Shutdown) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => shutdown.trigger(),
            Err(err) => warn!("Cannot listen for Ctrl-C: {err}"),
        }
    });
}

async fn print_slots(mut events: BoxStream<'static, CycleEvent>) {
    while let Some(event) = events.next().await {
        let CycleEvent::Finished(report) = event else {
            continue;
        };
        let fresh: HashSet<_> = report.announced.iter().map(|slot| slot.key()).collect();
        for slot in &report.slots {
            let tag = if fresh.contains(&slot.key()) { "new" } else { "   " };
            println!("[{tag}] {}", describe(slot));
        }
        match &report.result.error {
            None => println!(
                "{} slots available, {} announced",
                report.slots.len(),
                report.announced.len()
            ),
            Some(err) => println!("check failed: {err}"),
        }
    }
}

async fn self_check(config: &CourtwatchConfig) -> Result<ExitCode> {
    info!("Configuration is valid");
    let mut healthy = true;

    let channel = TelegramChannel::new(
        &config.credentials.bot_token,
        &config.credentials.chat_id,
        request_timeout(config),
    )?;
    match channel.send(&format_self_check(Utc::now())).await {
        Ok(()) => info!("Test message delivered to chat {}", channel.chat_id()),
        Err(err) => {
            error!("Test message failed: {err}");
            healthy = false;
        }
    }

    let mut site = HttpSite::new(config.site.clone())?;
    match site.navigate(&config.site.base_url).await {
        Ok(landing) => info!("Reached {} ({:?})", landing.url, landing.surface),
        Err(err) => {
            error!("Booking site unreachable: {err}");
            healthy = false;
        }
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
