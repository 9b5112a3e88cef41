use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};

use crate::scheduler::session::RecordingSession;

/// Destination for recording session records.
pub trait OutcomeSink: Send {
    fn append(&mut self, record: &RecordingSession) -> io::Result<()>;
}

/// Append-only JSON-lines log of session records.
#[derive(Debug, Clone)]
pub struct OutcomeLog {
    path: PathBuf,
}

impl OutcomeLog {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            path: base_dir.join("recordings.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record in write order. A missing log is an empty log.
    pub fn read_all(&self) -> io::Result<Vec<RecordingSession>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!(
                    "Skipping malformed record at {}:{}: {}",
                    self.path.display(),
                    number + 1,
                    e
                ),
            }
        }
        Ok(records)
    }

    /// Latest record per session, ordered by scheduled start.
    pub fn sessions(&self) -> io::Result<Vec<RecordingSession>> {
        let mut latest: HashMap<String, RecordingSession> = HashMap::new();
        for record in self.read_all()? {
            latest.insert(record.key.clone(), record);
        }
        let mut sessions: Vec<RecordingSession> = latest.into_values().collect();
        sessions.sort_by(|a, b| {
            a.scheduled_start
                .cmp(&b.scheduled_start)
                .then_with(|| a.satellite.cmp(&b.satellite))
        });
        Ok(sessions)
    }
}

impl OutcomeSink for OutcomeLog {
    fn append(&mut self, record: &RecordingSession) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)
            .map_err(|e| io::Error::other(format!("Failed to serialize record: {}", e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

/// `<dir>/<SAT>/<SAT>_<YYYYmmdd_HHMMSS>.wav`
pub fn artifact_path(recordings_dir: &Path, satellite: &str, at: DateTime<Utc>) -> PathBuf {
    let safe: String = satellite
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    recordings_dir
        .join(&safe)
        .join(format!("{}_{}.wav", safe, at.format("%Y%m%d_%H%M%S")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::event::{PassEvent, Source};
    use crate::scheduler::session::SessionState;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn session(sat: &str, start: DateTime<Utc>) -> RecordingSession {
        let event = PassEvent {
            satellite: sat.into(),
            start,
            end: start + Duration::minutes(12),
            max_elevation_deg: 33.0,
            source: Source::Remote,
        };
        RecordingSession::new(&event, start)
    }

    #[test]
    fn test_sessions_fold_to_latest_record() {
        let dir = TempDir::new().unwrap();
        let mut log = OutcomeLog::new(dir.path());
        let start = Utc.with_ymd_and_hms(2026, 5, 3, 12, 0, 0).unwrap();

        let mut first = session("NOAA-18", start);
        log.append(&first).unwrap();
        first
            .transition(SessionState::Armed, start, None)
            .unwrap();
        log.append(&first).unwrap();
        first
            .transition(SessionState::Aborted, start, Some("shutdown".into()))
            .unwrap();
        log.append(&first).unwrap();

        let earlier = session("ISS", start - Duration::hours(1));
        log.append(&earlier).unwrap();

        assert_eq!(log.read_all().unwrap().len(), 4);

        let sessions = log.sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].satellite, "ISS");
        assert_eq!(sessions[1].state, SessionState::Aborted);
        assert_eq!(sessions[1].reason.as_deref(), Some("shutdown"));
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = OutcomeLog::new(&dir.path().join("nowhere"));
        assert!(log.sessions().unwrap().is_empty());
    }

    #[test]
    fn test_artifact_path_layout() {
        let at = Utc.with_ymd_and_hms(2025, 5, 3, 15, 30, 0).unwrap();
        let path = artifact_path(Path::new("/data"), "NOAA-19", at);
        assert_eq!(path, PathBuf::from("/data/NOAA-19/NOAA-19_20250503_153000.wav"));

        let path = artifact_path(Path::new("/data"), "ISS (ZARYA)", at);
        assert_eq!(
            path,
            PathBuf::from("/data/ISS__ZARYA_/ISS__ZARYA__20250503_153000.wav")
        );
    }
}
