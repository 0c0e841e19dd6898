use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lift_core::Config;
use lift_proto::TokenPair;
use lift_syncd::config::{expand_path, load_syncd_config};
use lift_syncd::link::LinkWatcher;
use lift_syncd::{Availability, ConnectivityEvent, Engine, SyncOutcome};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lift-syncd", about = "Offline-first sync daemon for lift", version)]
struct Args {
    /// Path to the configuration file (defaults to $LIFT_CONFIG or ~/.config/lift/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in the foreground: watch the link, probe the backend, auto-sync
    Run,
    /// Run a single sync cycle and exit
    Sync {
        /// Seconds to wait for the backend to wake up
        #[arg(long, default_value_t = 60)]
        wait: u64,
    },
    /// List queued mutations
    Queue,
    /// Show sync status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Store tokens issued by the backend
    Login {
        /// Access token
        #[arg(long)]
        token: String,
        /// Refresh token, if the backend issued one
        #[arg(long)]
        refresh_token: Option<String>,
    },
    /// Forget the stored session
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config_path = match &args.config {
        Some(raw) => expand_path(raw)?,
        None => Config::get_config_path()?,
    };
    let config = load_syncd_config(&config_path)?;
    tracing::debug!("lift-syncd using config {}", config_path.display());

    let engine = Engine::open(&config)?;

    match args.command {
        Command::Run => run(&engine, &config).await,
        Command::Sync { wait } => sync_once(&engine, &config, Duration::from_secs(wait)).await,
        Command::Queue => {
            let queued = engine.store().list_queued()?;
            if queued.is_empty() {
                println!("mutation queue is empty");
            }
            for entry in queued {
                println!(
                    "#{:<5} {}  {:<6} {}{}",
                    entry.id,
                    entry.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.method.as_str(),
                    entry.resource,
                    entry
                        .local_id
                        .map(|id| format!("  ({id})"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Status { json } => {
            let status = engine.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{status}");
            }
            Ok(())
        }
        Command::Login {
            token,
            refresh_token,
        } => {
            engine.login(
                TokenPair {
                    access_token: token,
                    refresh_token,
                },
                None,
            )?;
            engine.shutdown();
            println!("signed in");
            Ok(())
        }
        Command::Logout => {
            engine.logout()?;
            println!("signed out");
            Ok(())
        }
    }
}

/// Start the monitor, auto-sync and (with a backend) the link watcher.
fn start_background(engine: &Engine, config: &Config) -> Option<LinkWatcher> {
    engine.start();
    match &config.server.base_url {
        Some(url) => LinkWatcher::spawn(
            url,
            config.sync.link_check_interval(),
            engine.monitor().clone(),
        ),
        None => None,
    }
}

/// Keep syncing in the background until interrupted.
async fn run(engine: &Engine, config: &Config) -> Result<()> {
    if !engine.is_signed_in() {
        tracing::warn!("not signed in, only the availability monitor will run");
    }
    let _link = start_background(engine, config);
    tracing::info!("lift-syncd running");

    let mut availability = engine.monitor().watch();
    loop {
        tokio::select! {
            changed = availability.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *availability.borrow_and_update();
                tracing::debug!("availability now {state}");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal, stopping lift-syncd");
                break;
            }
        }
    }

    engine.shutdown();
    Ok(())
}

async fn sync_once(engine: &Engine, config: &Config, wait: Duration) -> Result<()> {
    if config.server.base_url.is_none() {
        bail!("no server.base_url configured");
    }
    // Probe right away instead of waiting for the link watcher.
    engine.monitor().start();
    engine.connectivity_changed(ConnectivityEvent::Up);

    let mut availability = engine.monitor().watch();
    tokio::time::timeout(wait, async {
        while *availability.borrow_and_update() != Availability::OnlineReady {
            if availability.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .context("backend did not become ready in time")?;

    match engine.sync_now().await {
        SyncOutcome::Completed(report) => {
            println!("{report}");
            for failure in &report.failures {
                eprintln!("  {}: {}", failure.step, failure.error);
            }
            Ok(())
        }
        SyncOutcome::AlreadyRunning => {
            println!("a sync cycle is already running");
            Ok(())
        }
        SyncOutcome::Skipped(reason) => bail!("sync skipped: {reason}"),
    }
}
