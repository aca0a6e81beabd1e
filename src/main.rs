use anyhow::{Context, Result};
use clap::Parser;
use secmon::alert::{Alert, AlertSender, Alerter};
use secmon::config::Config;
use secmon::hashdb::HashDb;
use secmon::monitors::{FileIntegrityMonitor, NetworkMonitor, ProcessMonitor};
use secmon::rules::RuleSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Parser, Debug)]
#[command(name = "secmon", version)]
#[command(about = "Lightweight host-based security monitor")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/secmon/config.toml")]
    config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json {
        subscriber.json().init();
    } else {
        subscriber.with_target(false).init();
    }

    let (config, config_error) = Config::load_with_fallback(&args.config);
    info!("Config: {}", args.config.display());
    if let Some(ref msg) = config_error {
        warn!("{}; running with defaults", msg);
    }
    config.validate().context("Invalid configuration")?;

    let (alert_tx, alert_rx) = mpsc::channel::<Alert>(1000);
    let alerts = AlertSender::new(alert_tx);

    let alerter = Alerter::new(&config);
    let alerter_handle = tokio::spawn(async move {
        alerter.run(alert_rx).await;
    });

    if let Some(msg) = config_error {
        alerts.error(msg).await;
    }

    let rules = Arc::new(RuleSet::load(&config.general.rules_file, &alerts).await);
    if rules.is_empty() {
        warn!("Running with an empty rule set");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<(JoinHandle<()>, &'static str)> = Vec::new();

    if config.file_monitor.enabled {
        let db = HashDb::load(&config.file_monitor.hash_db, &alerts).await;
        let watched = rules.watched_files().to_vec();
        let mut monitor =
            FileIntegrityMonitor::new(config.file_monitor.clone(), watched, db, alerts.clone());
        let rx = shutdown_rx.clone();
        handles.push((
            tokio::spawn(async move {
                if let Err(e) = monitor.run(rx).await {
                    error!("File integrity monitor error: {}", e);
                }
            }),
            "file integrity monitor",
        ));
        info!("File integrity monitor enabled");
    }

    if config.process_monitor.enabled {
        let mut monitor =
            ProcessMonitor::new(config.process_monitor.clone(), rules.clone(), alerts.clone());
        let rx = shutdown_rx.clone();
        handles.push((
            tokio::spawn(async move {
                if let Err(e) = monitor.run(rx).await {
                    error!("Process monitor error: {}", e);
                }
            }),
            "process monitor",
        ));
        info!("Process monitor enabled");
    }

    if config.network_monitor.enabled {
        let mut monitor = NetworkMonitor::new(config.network_monitor.clone(), alerts.clone());
        let rx = shutdown_rx.clone();
        handles.push((
            tokio::spawn(async move {
                if let Err(e) = monitor.run(rx).await {
                    error!("Network monitor error: {}", e);
                }
            }),
            "network monitor",
        ));
        info!("Network monitor enabled");
    }

    alerts.info("secmon started").await;
    info!("secmon running. Press Ctrl+C to stop.");

    wait_for_signal().await?;

    info!("Shutting down...");
    alerts.info("secmon shutting down").await;
    let _ = shutdown_tx.send(true);

    let grace = tokio::time::Duration::from_secs(SHUTDOWN_GRACE_SECS);
    for (mut handle, name) in handles {
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("{} did not stop within grace period, aborting", name);
            handle.abort();
        }
    }

    // Close the alert channel so the dispatcher drains and exits
    drop(alerts);
    if tokio::time::timeout(grace, alerter_handle).await.is_err() {
        warn!("Alert dispatcher did not stop within grace period");
    }

    info!("secmon stopped.");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
    Ok(())
}
