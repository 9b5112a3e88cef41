mod error;
mod ground_station;
mod pass_finder;
mod predictor;
mod propagation;
mod remote;
mod source;
mod tle_loader;
mod types;

pub use ground_station::GroundStation;
pub use predictor::{run_refresh_task, PredictionBatch, Predictor, PredictorStatus, RefreshChannels};
pub use remote::RemoteClient;
pub use source::{LocalFallback, PredictionSource};
pub use tle_loader::TleLoader;

#[cfg(test)]
pub(crate) use tle_loader::tests::ISS_TLE;
