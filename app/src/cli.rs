//! Tandem CLI Tool
//!
//! Operator tooling: preview layouts, replay command files, read the
//! notification journal and inspect trained models.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tandem_behavior::{
    AnomalyModel, ArtifactStore, FileArtifactStore, MemoryArtifactStore, MemoryStore, Notification,
    NotificationHub, NotificationJournal, Tracker,
};
use tandem_geo::{Position, ZoneLayout};

mod config;
mod input;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "tandem-cli")]
#[command(author = "Tandem Team")]
#[command(version = "0.1.0")]
#[command(about = "Tandem co-location tracker CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (defaults to the configured one)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the zone layout generated around a point
    Layout {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },

    /// Run a JSONL command file through an in-memory tracker
    Replay {
        file: PathBuf,

        /// Print command responses as well as notifications
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show journaled notifications for a user
    Alerts {
        user_id: Option<String>,

        /// Only this event, e.g. anomaly_alert
        #[arg(short, long)]
        event: Option<String>,

        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Show the persisted model for a user
    Model {
        user_id: String,
    },

    /// Generate sample configuration
    Config {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let config = match cli.data_dir {
        Some(dir) => AppConfig {
            data_directory: dir.to_string_lossy().into_owned(),
            ..config
        },
        None => config,
    };

    match cli.command {
        Commands::Layout { lat, lon } => {
            show_layout(&config, lat, lon)?;
        }

        Commands::Replay { file, verbose } => {
            replay(&config, &file, verbose).await?;
        }

        Commands::Alerts { user_id, event, format } => {
            show_alerts(&config, user_id.as_deref(), event.as_deref(), format)?;
        }

        Commands::Model { user_id } => {
            show_model(&config, &user_id)?;
        }

        Commands::Config { output } => {
            generate_config(output)?;
        }
    }

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn show_layout(config: &AppConfig, lat: f64, lon: f64) -> Result<()> {
    let layout = ZoneLayout::generate(Position::new(lat, lon), &config.tracker_config().layout)?;

    println!("╭──────────────────────────────────────────────────────────────────────╮");
    println!("│ Layout at ({:.6}, {:.6}), {:.0} m across{:>27}│", lat, lon, layout.total_size_m(), "");
    println!("├────┬──────────────────┬─────────┬─────────────────────────────────────┤");
    println!("│ ID │ Zone             │ Color   │ Bounds (lat / lon)                  │");
    println!("├────┼──────────────────┼─────────┼─────────────────────────────────────┤");

    for zone in &layout.zones {
        println!("│ {:>2} │ {:16} │ {:7} │ {:.6}..{:.6} / {:.6}..{:.6} │",
            zone.id,
            truncate(&zone.name, 16),
            zone.color,
            zone.bounds.min_lat,
            zone.bounds.max_lat,
            zone.bounds.min_lon,
            zone.bounds.max_lon);
    }

    println!("╰────┴──────────────────┴─────────┴─────────────────────────────────────╯");
    Ok(())
}

async fn replay(config: &AppConfig, file: &Path, verbose: bool) -> Result<()> {
    let hub = Arc::new(NotificationHub::new());
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
    let tracker = Tracker::new(
        config.tracker_config(),
        Arc::new(MemoryStore::new()),
        artifacts,
        hub.clone(),
    );

    let reader = BufReader::new(
        std::fs::File::open(file).with_context(|| format!("Failed to open {:?}", file))?,
    );

    let mut users: Vec<String> = Vec::new();
    let mut streams = Vec::new();
    let mut last_time = Utc::now();
    let mut counts = ReplayCounts::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let command = match input::parse_line(index + 1, &line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("skipped: {}", e);
                counts.failed += 1;
                continue;
            }
        };

        let user_id = command.user_id().to_string();
        if !users.contains(&user_id) {
            streams.push((user_id.clone(), hub.subscribe(&user_id)));
            users.push(user_id);
        }
        if let Some(at) = command.timestamp() {
            last_time = at;
        }

        match input::execute(&tracker, command, last_time).await {
            Ok(response) => {
                counts.commands += 1;
                if verbose {
                    println!("{}", serde_json::to_string(&response)?);
                }
            }
            Err(e) => {
                eprintln!("line {}: {}", index + 1, e);
                counts.failed += 1;
            }
        }

        for (user_id, rx) in streams.iter_mut() {
            while let Ok(notification) = rx.try_recv() {
                counts.observe(&notification);
                println!("{}", serde_json::json!({ "user_id": user_id, "notification": notification }));
            }
        }
    }

    println!();
    println!("Commands: {} ok, {} failed", counts.commands, counts.failed);
    println!("Alerts: {} pair, {} device", counts.pair_alerts, counts.device_alerts);

    for user_id in &users {
        let status = tracker.get_training_status(user_id, last_time)?;
        println!("{}: {} ({})", user_id, status.phase.as_str(), status.message);
    }

    Ok(())
}

#[derive(Default)]
struct ReplayCounts {
    commands: usize,
    failed: usize,
    pair_alerts: usize,
    device_alerts: usize,
}

impl ReplayCounts {
    fn observe(&mut self, notification: &Notification) {
        match notification {
            Notification::AnomalyAlert(_) => self.pair_alerts += 1,
            Notification::IndividualAnomaly { .. } => self.device_alerts += 1,
            _ => {}
        }
    }
}

fn show_alerts(config: &AppConfig, user_id: Option<&str>, event: Option<&str>, format: OutputFormat) -> Result<()> {
    let journal = NotificationJournal::new(&config.journal_dir())?;

    let Some(user_id) = user_id else {
        let users = journal.users()?;
        if users.is_empty() {
            println!("No journaled users found.");
        }
        for user in users {
            println!("{}", user);
        }
        return Ok(());
    };

    let mut entries = journal.load(user_id)?;
    if let Some(event) = event {
        entries.retain(|e| e.notification.name() == event);
    }

    if entries.is_empty() {
        println!("No notifications found matching criteria.");
        return Ok(());
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Table => {
            println!("╭──────────────────────┬──────────────────────┬────────────┬──────────────────────────────╮");
            println!("│ Time                 │ Event                │ Confidence │ Summary                      │");
            println!("├──────────────────────┼──────────────────────┼────────────┼──────────────────────────────┤");

            for entry in &entries {
                let (confidence, summary) = describe(&entry.notification);
                println!("│ {:20} │ {:20} │ {:>10} │ {:28} │",
                    entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.notification.name(),
                    confidence.map(|c| format!("{:.0}%", c * 100.0)).unwrap_or_default(),
                    truncate(&summary, 28));
            }

            println!("╰──────────────────────┴──────────────────────┴────────────┴──────────────────────────────╯");
            println!("\nTotal notifications: {}", entries.len());
        }
    }

    Ok(())
}

fn describe(notification: &Notification) -> (Option<f64>, String) {
    match notification {
        Notification::LocationUpdate { device_id, zone_name, .. } => (None, format!("{} in {}", device_id, zone_name)),
        Notification::LocationRejected { device_id, reason, .. } => (None, format!("{}: {}", device_id, reason)),
        Notification::MlStatusUpdate { message, .. }
        | Notification::MlTrainingProgress { message, .. }
        | Notification::MlTrainingComplete { message, .. } => (None, message.clone()),
        Notification::AnomalyAlert(alert) => (
            Some(alert.confidence),
            format!("{} / {} ({:.0} m)", alert.device1_id, alert.device2_id, alert.distance_m),
        ),
        Notification::IndividualAnomaly { device_id, reasons, confidence, .. } => {
            (Some(*confidence), format!("{}: {}", device_id, reasons.join("; ")))
        }
    }
}

fn show_model(config: &AppConfig, user_id: &str) -> Result<()> {
    let store = FileArtifactStore::new(&config.models_dir())?;

    let Some(bytes) = store.read(user_id)? else {
        println!("No model stored for {}", user_id);
        return Ok(());
    };

    let model = AnomalyModel::from_bytes(&bytes)?;
    let info = model.info();

    println!("Model for {}:", user_id);
    println!("  Type: {} (schema v{})", info.model_type, info.schema_version);
    if let Some(started) = info.training_started_at {
        println!("  Collection started: {}", started);
    }
    println!("  Trained: {}", info.trained_at);
    println!("  Samples: {}", info.sample_count);
    println!("  Threshold: {:.4}", info.anomaly_threshold);
    println!("  Contamination offset: {:.4}", info.contamination_offset);
    println!("  Cluster sizes: {:?}", info.cluster_sizes);

    if !model.typical_zones.is_empty() {
        println!("  Typical zones:");
        for (device_id, zones) in &model.typical_zones {
            println!("    {}: {:?}", device_id, zones);
        }
    }

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let example = format!(
        "# Tandem Configuration File\n\
         #\n\
         # Copy this file to /etc/tandem/config.toml or ~/.config/tandem/config.toml\n\n{}",
        AppConfig::example()
    );

    if let Some(path) = output {
        std::fs::write(&path, example)?;
        println!("Configuration written to: {:?}", path);
    } else {
        println!("{}", example);
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
