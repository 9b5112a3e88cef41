use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use utoipa::ToSchema;

use crate::config::SatelliteConfig;
use crate::gps::GpsFix;
use crate::predict::error::PredictError;
use crate::predict::source::PredictionSource;
use crate::predict::GroundStation;
use crate::scheduler::storage::ManualStore;
use crate::scheduler::{ManualRequest, PassEvent, ScheduleUpdate, Source};

const MANUAL_POLL: StdDuration = StdDuration::from_secs(5);

/// Result of one successful refresh, tagged with the source that produced it
/// and the location epoch it was computed for.
#[derive(Debug, Clone)]
pub struct PredictionBatch {
    pub events: Vec<PassEvent>,
    pub origin: Source,
    pub epoch: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PredictorStatus {
    pub station: GroundStation,
    pub epoch: u64,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_origin: Option<Source>,
    pub last_error: Option<String>,
}

/// Runs the configured sources in order (remote first) and owns the station
/// location used for every request.
pub struct Predictor {
    sources: Vec<PredictionSource>,
    station: GroundStation,
    epoch: u64,
    satellites: Vec<SatelliteConfig>,
    horizon: Duration,
    margin: Duration,
    drift_threshold_km: f64,
    location_file: Option<PathBuf>,
}

impl Predictor {
    pub fn new(
        sources: Vec<PredictionSource>,
        station: GroundStation,
        satellites: Vec<SatelliteConfig>,
        horizon: Duration,
        margin: Duration,
    ) -> Self {
        Self {
            sources,
            station,
            epoch: 0,
            satellites,
            horizon,
            margin,
            drift_threshold_km: 1.0,
            location_file: None,
        }
    }

    pub fn with_drift_threshold(mut self, km: f64) -> Self {
        self.drift_threshold_km = km;
        self
    }

    /// Save every adopted location to `path`.
    pub fn with_location_file(mut self, path: PathBuf) -> Self {
        self.location_file = Some(path);
        self
    }

    pub fn station(&self) -> GroundStation {
        self.station
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Adopt a GPS fix. Returns true when the station moved far enough to
    /// start a new location epoch.
    pub fn update_location(&mut self, fix: &GpsFix) -> bool {
        let candidate = GroundStation::from(fix);
        let moved = self.station.distance_km(&candidate);
        if moved <= self.drift_threshold_km {
            return false;
        }

        log::info!(
            "Station moved {:.2} km to {:.5},{:.5}; starting location epoch {}",
            moved,
            candidate.latitude_deg,
            candidate.longitude_deg,
            self.epoch + 1
        );
        self.station = candidate;
        self.epoch += 1;
        if let Some(path) = &self.location_file {
            if let Err(e) = self.station.save(path) {
                log::warn!("Failed to save location to {}: {}", path.display(), e);
            }
        }
        true
    }

    /// Ask each source in turn; the first success wins.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<PredictionBatch, PredictError> {
        let mut last_error = PredictError::Unavailable("no prediction source configured".into());

        for source in &self.sources {
            match source
                .refresh(&self.station, &self.satellites, now, self.horizon)
                .await
            {
                Ok(events) => {
                    let events: Vec<PassEvent> =
                        events.into_iter().map(|e| e.widened(self.margin)).collect();
                    log::info!(
                        "Prediction refresh from {}: {} passes over the next {}",
                        source.tag(),
                        events.len(),
                        humantime::format_duration(self.horizon.to_std().unwrap_or_default())
                    );
                    return Ok(PredictionBatch {
                        events,
                        origin: source.tag(),
                        epoch: self.epoch,
                    });
                }
                Err(e) => {
                    log::warn!("{} prediction failed: {}", source.tag(), e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn status(&self) -> PredictorStatus {
        PredictorStatus {
            station: self.station,
            epoch: self.epoch,
            last_refresh: None,
            last_origin: None,
            last_error: None,
        }
    }
}

/// Channels the refresh task talks over.
pub struct RefreshChannels {
    pub updates: mpsc::Sender<ScheduleUpdate>,
    pub requests: mpsc::Receiver<()>,
    pub fixes: Option<mpsc::Receiver<GpsFix>>,
    pub status: watch::Sender<PredictorStatus>,
    pub shutdown: watch::Receiver<bool>,
}

/// Keep the schedule fed: periodic and on-demand prediction refreshes, a
/// refresh whenever the station moves, and manual requests picked up from the
/// on-disk store.
pub async fn run_refresh_task(
    mut predictor: Predictor,
    store: ManualStore,
    refresh_interval: StdDuration,
    mut channels: RefreshChannels,
) {
    let mut refresh_timer = tokio::time::interval(refresh_interval);
    refresh_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut manual_timer = tokio::time::interval(MANUAL_POLL);
    manual_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let known: Vec<String> = predictor.satellites.iter().map(|s| s.name.clone()).collect();
    let mut last_manual: Option<Vec<ManualRequest>> = None;
    let mut status = predictor.status();
    channels.status.send_replace(status.clone());

    loop {
        let refresh = tokio::select! {
            _ = refresh_timer.tick() => true,
            Some(()) = channels.requests.recv() => {
                log::info!("Prediction refresh requested");
                true
            }
            Some(fix) = next_fix(&mut channels.fixes) => {
                let moved = predictor.update_location(&fix);
                status.station = predictor.station();
                status.epoch = predictor.epoch();
                channels.status.send_replace(status.clone());
                moved
            }
            _ = manual_timer.tick() => {
                sync_manual_store(&store, &known, &mut last_manual, &channels.updates).await;
                false
            }
            _ = channels.shutdown.changed() => break,
        };

        if !refresh {
            continue;
        }

        let now = Utc::now();
        match predictor.refresh(now).await {
            Ok(batch) => {
                status.last_refresh = Some(now);
                status.last_origin = Some(batch.origin);
                status.last_error = None;
                if channels
                    .updates
                    .send(ScheduleUpdate::Predictions(batch))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                log::error!("Prediction refresh failed, keeping previous schedule: {}", e);
                status.last_error = Some(e.to_string());
            }
        }
        channels.status.send_replace(status.clone());
    }

    log::info!("Refresh task stopped");
}

async fn next_fix(fixes: &mut Option<mpsc::Receiver<GpsFix>>) -> Option<GpsFix> {
    match fixes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sync_manual_store(
    store: &ManualStore,
    known: &[String],
    last: &mut Option<Vec<ManualRequest>>,
    updates: &mpsc::Sender<ScheduleUpdate>,
) {
    match store.prune(Utc::now() - Duration::hours(1)) {
        Ok(0) => {}
        Ok(n) => log::info!("Pruned {} finished manual requests", n),
        Err(e) => log::warn!("Failed to prune manual requests: {}", e),
    }

    let requests: Vec<ManualRequest> = match store.list() {
        Ok(stored) => stored
            .into_iter()
            .map(|s| s.request)
            .filter(|r| {
                let ok = known.iter().any(|k| *k == r.satellite);
                if !ok {
                    log::warn!("Ignoring manual request for unknown satellite {}", r.satellite);
                }
                ok
            })
            .collect(),
        Err(e) => {
            log::warn!("Failed to read manual requests: {}", e);
            return;
        }
    };

    if last.as_ref() == Some(&requests) {
        return;
    }
    match updates.send(ScheduleUpdate::SyncManual(requests.clone())).await {
        Ok(()) => *last = Some(requests),
        Err(_) => log::warn!("Schedule is gone, manual requests not delivered"),
    }
}
