use thiserror::Error;

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("TLE directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("TLE file read error: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Invalid TLE format in {file}: {message}")]
    InvalidTle { file: String, message: String },
    #[error("Propagation error: {0}")]
    Propagation(String),
    #[error("No TLE for satellite {0}")]
    UnknownSatellite(String),
    #[error("Prediction unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("coordinates out of range: {0}, {1}")]
    OutOfRange(f64, f64),
}
