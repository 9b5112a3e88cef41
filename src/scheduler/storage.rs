use chrono::{DateTime, Utc};
use log::error;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use utoipa::ToSchema;

use crate::scheduler::event::ManualRequest;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StoredRequest {
    pub id: String,
    #[serde(flatten)]
    pub request: ManualRequest,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Manual request not found: {0}")]
    NotFound(String),
    #[error("Manual request overlaps {0}")]
    Overlap(String),
    #[error("Manual request ends out of range")]
    OutOfRange,
}

/// Manual requests kept on disk, one YAML file each, so a CLI invocation can
/// hand work to a running daemon.
pub struct ManualStore {
    base: PathBuf,
}

impl ManualStore {
    pub fn new(base: PathBuf) -> Self {
        ManualStore { base }
    }

    fn folder(&self) -> PathBuf {
        self.base.join("manual")
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.folder().join(format!("{}.yaml", id))
    }

    pub fn list(&self) -> Result<Vec<StoredRequest>, StorageError> {
        let path = self.folder();

        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in path.read_dir()? {
            let entry = entry?;
            let entry_path = entry.path();

            if !entry_path.is_file() || entry_path.extension().is_none_or(|ext| ext != "yaml") {
                continue;
            }

            let id = entry_path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(String::from)
                .unwrap_or_default();

            let content = match std::fs::read_to_string(&entry_path) {
                Ok(content) => content,
                Err(e) => {
                    error!("Failed to read manual request {}: {}", entry_path.display(), e);
                    continue;
                }
            };

            let request: ManualRequest = match serde_yaml::from_str(&content) {
                Ok(request) => request,
                Err(e) => {
                    error!("Failed to parse manual request {}: {}", id, e);
                    continue;
                }
            };
            if request.end().is_none() {
                error!("Manual request {} ends out of range, skipped", id);
                continue;
            }

            entries.push(StoredRequest { id, request });
        }

        entries.sort_by_key(|e| e.request.start);
        Ok(entries)
    }

    pub fn get(&self, id: &str) -> Result<StoredRequest, StorageError> {
        let path = self.request_path(id);

        if !path.exists() {
            return Err(StorageError::NotFound(id.to_string()));
        }

        let content = std::fs::read_to_string(&path)?;
        let request = serde_yaml::from_str(&content)?;
        Ok(StoredRequest {
            id: id.to_string(),
            request,
        })
    }

    /// Store a new request. Overlapping requests for the same satellite are
    /// rejected; requests for different satellites may overlap.
    pub fn submit(&self, request: ManualRequest) -> Result<StoredRequest, StorageError> {
        let end = request.end().ok_or(StorageError::OutOfRange)?;
        if let Some(existing) = self.find_overlap(&request, end)? {
            return Err(StorageError::Overlap(existing));
        }

        let id = self.generate_id(request.start);
        std::fs::create_dir_all(self.folder())?;
        std::fs::write(self.request_path(&id), serde_yaml::to_string(&request)?)?;

        Ok(StoredRequest { id, request })
    }

    pub fn delete(&self, id: &str) -> Result<StoredRequest, StorageError> {
        let stored = self.get(id)?;
        std::fs::remove_file(self.request_path(id))?;
        Ok(stored)
    }

    /// Delete requests that ended before `before`.
    pub fn prune(&self, before: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut removed = 0;
        for stored in self.list()? {
            if stored.request.end().is_some_and(|end| end < before) {
                std::fs::remove_file(self.request_path(&stored.id))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn find_overlap(
        &self,
        request: &ManualRequest,
        end: DateTime<Utc>,
    ) -> Result<Option<String>, StorageError> {
        for stored in self.list()? {
            let other = &stored.request;
            // Two ranges [a, b] and [c, d] overlap if a < d && c < b
            if other.satellite == request.satellite
                && other.end().is_some_and(|other_end| request.start < other_end)
                && other.start < end
            {
                return Ok(Some(stored.id));
            }
        }
        Ok(None)
    }

    fn generate_id(&self, start: DateTime<Utc>) -> String {
        let uuid = uuid::Uuid::new_v4();
        let timestamp = start.format("%Y%m%dT%H%M%SZ");
        format!("{}_{}", timestamp, uuid)
    }
}
