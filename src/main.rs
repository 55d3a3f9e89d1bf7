//! stagehand: a local multi-service supervisor.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads the service configuration, and wires the supervisor's
//! single-consumer event loop to a headless frontend: notifications are
//! rendered through tracing, and a line-oriented stdin control channel
//! (`start <name>` / `stop <name>` / `remove <name>` / `quit`) feeds requests
//! onto the same channel as all internal events.

mod advisory;
mod backup;
mod config;
mod error;
mod events;
mod git;
mod health;
mod logtail;
mod proc;
mod service;
mod supervisor;
mod sync;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::{Event, HealthSignal, Notification};
use crate::git::Git;
use crate::service::ServiceSpec;
use crate::supervisor::{Supervisor, Timing};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = "stagehand", version, about = "Local multi-service supervisor")]
struct Cli {
    /// Path to stagehand.toml configuration file.
    #[arg(long, default_value = "stagehand.toml")]
    config: PathBuf,
    /// Override the services directory from the config file.
    #[arg(long)]
    services_dir: Option<PathBuf>,
    /// Do not start services at launch; wait for stdin commands.
    #[arg(long)]
    idle: bool,
    /// Disable the periodic working-tree backup agent.
    #[arg(long)]
    no_backup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    let services_dir = resolve_services_dir(&cli, &config);
    std::fs::create_dir_all(&services_dir)
        .with_context(|| format!("failed to create {}", services_dir.display()))?;

    let specs: Vec<ServiceSpec> = config.services.iter().map(|s| s.to_spec()).collect();
    if specs.is_empty() {
        info!("no services configured; waiting for a config with [[service]] entries");
    }

    let (event_tx, event_rx) = mpsc::channel(256);
    let (notify_tx, notify_rx) = mpsc::channel(256);
    let supervisor = Supervisor::new(
        specs.clone(),
        services_dir.clone(),
        Timing::default(),
        event_tx.clone(),
        notify_tx,
    );

    if !cli.no_backup {
        backup::spawn_backup_loop(
            Git::default(),
            services_dir,
            Duration::from_secs(config.settings.backup_interval_secs),
            config.settings.backup_push,
            supervisor.backup_feed(),
        );
    }

    spawn_notification_printer(notify_rx);
    spawn_control_listener(event_tx.clone());
    spawn_signal_listener(event_tx.clone());

    if !cli.idle {
        for spec in &specs {
            let _ = event_tx
                .send(Event::StartRequested {
                    name: spec.name.clone(),
                })
                .await;
        }
    }

    supervisor.run(event_rx).await;
    Ok(())
}

/// The services directory comes from the CLI, else the config; a relative
/// configured path is resolved against the config file's directory.
fn resolve_services_dir(cli: &Cli, config: &Config) -> PathBuf {
    if let Some(dir) = &cli.services_dir {
        return dir.clone();
    }
    let configured = PathBuf::from(&config.settings.services_dir);
    if configured.is_absolute() {
        configured
    } else {
        cli.config
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(configured)
    }
}

/// Renders state and health notifications for the terminal.
fn spawn_notification_printer(mut rx: mpsc::Receiver<Notification>) {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            match notification {
                Notification::State {
                    name,
                    state,
                    advisory,
                } => {
                    if advisory.is_empty() {
                        info!(service = %name, state = %state, "state changed");
                    } else {
                        warn!(service = %name, state = %state, advisory = %advisory, "state changed");
                    }
                }
                Notification::Health {
                    name,
                    signal,
                    advisory,
                } => {
                    let status = match signal {
                        HealthSignal::NotListening => "not listening yet".to_string(),
                        HealthSignal::ServerError { status } => {
                            format!("responding with HTTP {}", status)
                        }
                        HealthSignal::Healthy => "healthy".to_string(),
                    };
                    if advisory.is_empty() {
                        debug!(service = %name, health = %status, "health probe");
                    } else {
                        warn!(service = %name, health = %status, advisory = %advisory, "health probe");
                    }
                }
                Notification::Removed { name } => {
                    info!(service = %name, "service removed");
                }
            }
        }
    });
}

/// Reads control commands from stdin on a dedicated thread and forwards them
/// onto the supervisor's event channel.
fn spawn_control_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            let Some(event) = parse_control_line(&line) else {
                eprintln!("commands: start <name> | stop <name> | remove <name> | quit");
                continue;
            };
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
}

fn parse_control_line(line: &str) -> Option<Event> {
    let mut parts = line.split_whitespace();
    let command = parts.next()?;
    let name = parts.next();
    match (command, name) {
        ("quit", None) | ("exit", None) => Some(Event::Shutdown),
        ("start", Some(name)) => Some(Event::StartRequested {
            name: name.to_string(),
        }),
        ("stop", Some(name)) => Some(Event::StopRequested {
            name: name.to_string(),
        }),
        ("remove", Some(name)) => Some(Event::RemoveRequested {
            name: name.to_string(),
        }),
        _ => None,
    }
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            let _ = tx.send(Event::Shutdown).await;
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(Event::Shutdown).await;
        }
    });
}
