use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{to_chrono, Config};
use crate::gps;
use crate::predict::{
    run_refresh_task, GroundStation, LocalFallback, PredictionSource, Predictor, PredictorStatus,
    RefreshChannels, RemoteClient, TleLoader,
};
use crate::radio::{RadioController, Tuning};
use crate::scheduler::{
    ManagerSettings, ManagerStatus, ManualStore, OutcomeLog, PassSchedule, RecordingManager,
};
use crate::web::{self, AppState};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("no usable prediction source (remote unset, TLE catalog unavailable)")]
    NoPredictionSource,
    #[error("cannot bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error("signal handler: {0}")]
    Signal(std::io::Error),
}

/// Remote collaborator first, local SGP4 fallback second.
pub fn build_sources(config: &Config) -> Result<Vec<PredictionSource>, DaemonError> {
    let mut sources = Vec::new();

    if let Some(remote) = &config.predict.remote {
        sources.push(PredictionSource::Remote(RemoteClient::new(
            remote.address.clone(),
            remote.timeout,
        )));
    }

    if let Some(folder) = &config.predict.tle_folder {
        let mut loader = TleLoader::new(folder.clone());
        match loader.load_all() {
            Ok(()) if loader.is_empty() => {
                log::warn!("TLE folder {} holds no usable TLEs", folder.display())
            }
            Ok(()) => {
                log::info!(
                    "Local fallback over {} TLEs from {}",
                    loader.len(),
                    folder.display()
                );
                sources.push(PredictionSource::LocalFallback(LocalFallback::new(
                    Arc::new(loader),
                )))
            }
            Err(e) => log::warn!("Local fallback disabled: {}", e),
        }
    }

    if sources.is_empty() {
        return Err(DaemonError::NoPredictionSource);
    }
    Ok(sources)
}

fn location_file(config: &Config) -> PathBuf {
    config.storage.base_folder.join("location.yaml")
}

/// The configured station, or the last GPS location adopted when GPS is on.
pub fn initial_station(config: &Config) -> GroundStation {
    if config.gps.is_none() {
        return config.ground_station();
    }
    let path = location_file(config);
    match GroundStation::load(&path) {
        Ok(Some(saved)) => {
            log::info!(
                "Using saved location {:.5},{:.5} from {}",
                saved.latitude_deg,
                saved.longitude_deg,
                path.display()
            );
            saved
        }
        Ok(None) => config.ground_station(),
        Err(e) => {
            log::warn!("Ignoring saved location {}: {}", path.display(), e);
            config.ground_station()
        }
    }
}

pub fn build_predictor(config: &Config) -> Result<Predictor, DaemonError> {
    let mut predictor = Predictor::new(
        build_sources(config)?,
        initial_station(config),
        config.satellites.clone(),
        to_chrono(config.predict.horizon),
        to_chrono(config.predict.recording_margin),
    );
    if let Some(gps) = &config.gps {
        predictor = predictor
            .with_drift_threshold(gps.drift_threshold_km)
            .with_location_file(location_file(config));
    }
    Ok(predictor)
}

/// Run every component until Ctrl-C.
pub async fn run(config: Config) -> Result<(), DaemonError> {
    let config = Arc::new(config);
    let predictor = build_predictor(&config)?;

    let schedule = PassSchedule::shared();
    let outcomes = OutcomeLog::new(&config.storage.base_folder);
    let store = Arc::new(ManualStore::new(config.storage.base_folder.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (updates_tx, updates_rx) = mpsc::channel(32);
    let (refresh_tx, refresh_rx) = mpsc::channel(1);
    let (manager_tx, manager_rx) = watch::channel(ManagerStatus::default());
    let (predictor_tx, predictor_rx) = watch::channel(PredictorStatus {
        station: predictor.station(),
        epoch: predictor.epoch(),
        last_refresh: None,
        last_origin: None,
        last_error: None,
    });

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let fixes = match &config.gps {
        Some(gps_config) => {
            let listener =
                TcpListener::bind(&gps_config.bind)
                    .await
                    .map_err(|source| DaemonError::Bind {
                        address: gps_config.bind.clone(),
                        source,
                    })?;
            let (fix_tx, fix_rx) = mpsc::channel(4);
            let interval = gps_config.update_interval;
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = gps::run_listener(listener, interval, fix_tx, shutdown).await {
                    log::error!("GPS listener failed: {}", e);
                }
            }));
            Some(fix_rx)
        }
        None => None,
    };

    let satellites: HashMap<String, Tuning> = config
        .satellites
        .iter()
        .map(|sat| (sat.name.clone(), Tuning::from(sat)))
        .collect();
    let radio = RadioController::new(config.radio.address.clone(), config.radio.timeout);
    let manager = RecordingManager::new(
        schedule.clone(),
        radio,
        outcomes.clone(),
        satellites,
        ManagerSettings::from_config(&config),
    )
    .with_status(manager_tx);
    tasks.push(tokio::spawn(manager.run(updates_rx, shutdown_rx.clone())));

    tasks.push(tokio::spawn(run_refresh_task(
        predictor,
        ManualStore::new(config.storage.base_folder.clone()),
        config.predict.refresh_interval,
        RefreshChannels {
            updates: updates_tx.clone(),
            requests: refresh_rx,
            fixes,
            status: predictor_tx,
            shutdown: shutdown_rx.clone(),
        },
    )));

    if let Some(web_config) = &config.web {
        let state = AppState {
            config: config.clone(),
            schedule,
            store,
            outcomes,
            updates: updates_tx,
            refresh: refresh_tx,
            manager: manager_rx,
            predictor: predictor_rx,
        };
        let bind = web_config.bind.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = web::run_server(state, bind, shutdown).await {
                log::error!("Web server failed: {}", e);
            }
        }));
    }

    log::info!(
        "Pass-o-mat running at {} for {} satellites",
        config.station.name.as_deref().unwrap_or("unnamed station"),
        config.satellites.len()
    );

    let signal = tokio::signal::ctrl_c().await;
    log::info!("Shutting down");
    shutdown_tx.send_replace(true);

    for task in tasks {
        if let Err(e) = task.await {
            log::error!("Task ended abnormally: {}", e);
        }
    }

    signal.map_err(DaemonError::Signal)
}
