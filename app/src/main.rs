//! Tandem Ingest Daemon
//!
//! Reads newline-delimited JSON commands from stdin, drives the tracker and
//! writes every notification to stdout as one JSON line per event.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tandem_behavior::{
    FanoutNotifier, FileArtifactStore, LoggingNotifier, MemoryStore, Notification, NotificationHub,
    NotificationJournal, Notifier, Tracker,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

mod config;
mod input;

use config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(config.log_json);

    tracing::info!("Tandem co-location tracker v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Configuration loaded from {:?}", config.config_path);

    let hub = Arc::new(NotificationHub::new());
    let journal = Arc::new(NotificationJournal::new(&config.journal_dir())?);
    let artifacts = Arc::new(FileArtifactStore::new(&config.models_dir())?);
    let notifier: Arc<dyn Notifier> = Arc::new(FanoutNotifier::new(vec![
        Arc::new(LoggingNotifier),
        journal,
        hub.clone(),
    ]));

    let tracker = Tracker::new(
        config.tracker_config(),
        Arc::new(MemoryStore::new()),
        artifacts,
        notifier,
    );

    print_system_status(&config);

    tracing::info!("Reading commands from stdin");
    tracing::info!("Press Ctrl+C to stop");

    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            tracing::info!("End of input");
            break;
        };
        line_no += 1;

        let command = match input::parse_line(line_no, &line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!("Bad command: {}", e);
                continue;
            }
        };

        if subscribed.insert(command.user_id().to_string()) {
            let rx = hub.subscribe(command.user_id());
            forwarders.push(tokio::spawn(forward(command.user_id().to_string(), rx)));
        }

        match input::execute(&tracker, command, Utc::now()).await {
            Ok(response) => match serde_json::to_string(&response) {
                Ok(json) => println!("{}", json),
                Err(e) => tracing::error!("Failed to encode response: {}", e),
            },
            Err(e) => tracing::error!(line = line_no, "Command failed: {}", e),
        }
    }

    // Closing every sender ends the forwarders once their queues drain
    tracing::info!("Shutting down...");
    drop(tracker);
    drop(hub);
    for task in forwarders {
        if let Err(e) = task.await {
            tracing::warn!("Forwarder ended abnormally: {}", e);
        }
    }

    tracing::info!("Tandem shutdown complete");

    Ok(())
}

/// Print one user's notifications to stdout in publish order
async fn forward(user_id: String, mut rx: UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        let line = serde_json::json!({
            "user_id": user_id,
            "notification": notification,
        });
        println!("{}", line);
    }
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tandem=debug,tandem_behavior=debug,tandem_geo=debug"));

    // stdout carries the event stream, so logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true))
            .init();
    } else {
        registry
            .with(fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false))
            .init();
    }
}

fn print_system_status(config: &AppConfig) {
    use sysinfo::System;

    let mut sys = System::new_all();
    sys.refresh_all();

    tracing::info!("╭─────────────── System Status ───────────────╮");
    tracing::info!("│ Hostname: {:>32} │", System::host_name().unwrap_or_default());
    tracing::info!("│ OS: {:>38} │", System::name().unwrap_or_default());
    tracing::info!("│ CPU: {:>37} │", sys.cpus().first().map(|c| c.brand()).unwrap_or("Unknown"));
    tracing::info!("│ Memory: {:>26} MB / {} MB │",
        sys.used_memory() / 1024 / 1024,
        sys.total_memory() / 1024 / 1024);
    tracing::info!("├──────────────── Configuration ────────────────┤");
    tracing::info!("│ Data dir: {:>32} │", config.data_directory);
    tracing::info!("│ Max accuracy: {:>26} m │", config.max_acceptable_accuracy_m);
    tracing::info!("│ Drift radius: {:>26} m │", config.max_drift_m);
    tracing::info!("│ Training: {:>19} samples / {} min │",
        config.min_training_samples,
        config.training_window_minutes);
    tracing::info!("│ Panel policy: {:>28} │", format!("{:?}", config.panel_policy));
    tracing::info!("╰──────────────────────────────────────────────╯");
}
