mod config;
mod daemon;
mod gps;
mod predict;
mod radio;
mod scheduler;
mod web;

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::config::{to_chrono, Config};
use crate::predict::TleLoader;
use crate::scheduler::parser::{check_known, parse_manual_request};
use crate::scheduler::{ManualStore, OutcomeLog, PassSchedule, ScheduleEntry};

#[derive(Parser)]
#[command(name = "pass-o-mat")]
#[command(about = "Unattended satellite pass recording")]
struct Cli {
    /// Station configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until interrupted
    Run,
    /// Run one prediction refresh and print the passes
    Refresh,
    /// Show predicted passes merged with stored manual requests
    Schedule,
    /// Schedule a manual recording
    Manual {
        satellite: String,
        /// `T+10m`, RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC)
        start: String,
        /// Minutes, or a duration such as `12m30s`
        duration: String,
    },
    /// Cancel a stored manual recording
    Cancel { id: String },
    /// List recording outcomes
    Recordings,
    /// List configured satellites
    Satellites,
    /// Validate the configuration file
    ValidateConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Refresh => refresh(&config).await,
        Commands::Schedule => schedule(&config).await,
        Commands::Manual {
            satellite,
            start,
            duration,
        } => manual(&config, &satellite, &start, &duration),
        Commands::Cancel { id } => cancel(&config, &id),
        Commands::Recordings => recordings(&config),
        Commands::Satellites => satellites(&config),
        Commands::ValidateConfig => validate_config(&config, &cli.config),
    }
}

async fn run(config: Config) -> ExitCode {
    match daemon::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn refresh(config: &Config) -> ExitCode {
    let predictor = match daemon::build_predictor(config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match predictor.refresh(Utc::now()).await {
        Ok(batch) => {
            println!("{} passes from {}", batch.events.len(), batch.origin);
            for event in &batch.events {
                println!(
                    "  {:<12} {} -> {}  max {:>5.1}°",
                    event.satellite,
                    event.start.format("%Y-%m-%d %H:%M:%S"),
                    event.end.format("%H:%M:%S"),
                    event.max_elevation_deg
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Prediction failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn schedule(config: &Config) -> ExitCode {
    let now = Utc::now();
    let mut schedule = PassSchedule::new();

    match daemon::build_predictor(config) {
        Ok(predictor) => match predictor.refresh(now).await {
            Ok(batch) => {
                if let Err(e) = schedule.apply_predictions(batch, now) {
                    eprintln!("Rejected predictions: {}", e);
                }
            }
            Err(e) => eprintln!("Prediction failed, showing manual requests only: {}", e),
        },
        Err(e) => eprintln!("{}; showing manual requests only", e),
    }

    let store = ManualStore::new(config.storage.base_folder.clone());
    let requests = match store.list() {
        Ok(list) => list,
        Err(e) => {
            eprintln!("Error reading manual requests: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let requests: Vec<_> = requests.into_iter().map(|stored| stored.request).collect();
    if let Err(e) = schedule.sync_manual(&requests) {
        eprintln!("Rejected manual requests: {}", e);
        return ExitCode::FAILURE;
    }

    let entries = schedule.entries();
    if entries.is_empty() {
        println!("Schedule is empty");
    }
    for entry in &entries {
        print_entry(entry);
    }
    if let Some(next) = schedule.next_due(now, to_chrono(config.predict.horizon)) {
        println!("Next: {} ({})", next.key(), next.source);
    }
    ExitCode::SUCCESS
}

fn print_entry(entry: &ScheduleEntry) {
    let event = &entry.event;
    let superseded = match &entry.superseded_by {
        Some(by) => format!(" (by {})", by),
        None => String::new(),
    };
    println!(
        "  {:<12} {} -> {}  {:<14} {}{}",
        event.satellite,
        event.start.format("%Y-%m-%d %H:%M:%S"),
        event.end.format("%H:%M:%S"),
        event.source,
        entry.status,
        superseded
    );
}

fn manual(config: &Config, satellite: &str, start: &str, duration: &str) -> ExitCode {
    let request = match parse_manual_request(satellite, start, duration, Utc::now())
        .and_then(|r| check_known(&r, config).map(|()| r))
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Invalid request: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let store = ManualStore::new(config.storage.base_folder.clone());
    match store.submit(request) {
        Ok(stored) => {
            println!(
                "Scheduled {} at {} for {}s (id: {})",
                stored.request.satellite,
                stored.request.start.format("%Y-%m-%d %H:%M:%S"),
                stored.request.duration_seconds,
                stored.id
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cancel(config: &Config, id: &str) -> ExitCode {
    let store = ManualStore::new(config.storage.base_folder.clone());
    match store.delete(id) {
        Ok(stored) => {
            println!("Cancelled {} ({})", stored.id, stored.request.satellite);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn recordings(config: &Config) -> ExitCode {
    let log = OutcomeLog::new(&config.storage.base_folder);
    let sessions = match log.sessions() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", log.path().display(), e);
            return ExitCode::FAILURE;
        }
    };

    if sessions.is_empty() {
        println!("No recordings yet");
    }
    for session in &sessions {
        let artifact = session
            .artifact
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        println!(
            "  {:<12} {}  {:<10} {}{}",
            session.satellite,
            session.scheduled_start.format("%Y-%m-%d %H:%M:%S"),
            session.state,
            artifact,
            session
                .reason
                .as_ref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
    }
    ExitCode::SUCCESS
}

fn satellites(config: &Config) -> ExitCode {
    let catalog = config.predict.tle_folder.as_ref().and_then(|folder| {
        let mut loader = TleLoader::new(folder.clone());
        match loader.load_all() {
            Ok(()) => Some(loader),
            Err(e) => {
                log::warn!("TLE catalog unavailable: {}", e);
                None
            }
        }
    });

    for sat in &config.satellites {
        let tle = match &catalog {
            Some(loader) => match loader.find(&sat.name, sat.norad_id) {
                Some(entry) => format!("TLE epoch {}", entry.elements.datetime.format("%Y-%m-%d")),
                None => "no TLE".to_string(),
            },
            None => String::new(),
        };
        println!(
            "  {:<12} {:>11} Hz {:<4} min el {:>4.1}°  {}",
            sat.name, sat.frequency_hz, sat.mode, sat.min_elevation_deg, tle
        );
    }
    ExitCode::SUCCESS
}

fn validate_config(config: &Config, path: &Path) -> ExitCode {
    println!("{} is valid", path.display());
    println!(
        "  station: {:.4}, {:.4} at {} m",
        config.station.latitude_deg, config.station.longitude_deg, config.station.altitude_m
    );
    println!("  satellites: {}", config.satellites.len());
    println!(
        "  prediction: remote {}, local fallback {}",
        config
            .predict
            .remote
            .as_ref()
            .map(|r| r.address.as_str())
            .unwrap_or("off"),
        config
            .predict
            .tle_folder
            .as_ref()
            .map(|f| f.display().to_string())
            .unwrap_or_else(|| "off".to_string())
    );
    println!(
        "  gps: {}",
        config.gps.as_ref().map(|g| g.bind.as_str()).unwrap_or("off")
    );
    println!(
        "  web: {}",
        config.web.as_ref().map(|w| w.bind.as_str()).unwrap_or("off")
    );
    ExitCode::SUCCESS
}
