use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use sgp4::{Constants, Elements};

use crate::predict::error::PredictError;
use crate::predict::types::SatelliteInfo;

pub struct TleEntry {
    pub info: SatelliteInfo,
    pub elements: Elements,
    pub constants: Constants,
}

/// Two-line element catalog read from a folder of `.tle`/`.txt` files.
pub struct TleLoader {
    tle_dir: PathBuf,
    satellites: HashMap<u32, TleEntry>,
}

impl TleLoader {
    pub fn new(tle_dir: PathBuf) -> Self {
        Self {
            tle_dir,
            satellites: HashMap::new(),
        }
    }

    /// Catalog built from in-memory TLE text instead of a folder.
    #[cfg(test)]
    pub fn from_content(content: &str, source: &str) -> Result<Self, PredictError> {
        let mut loader = Self::new(PathBuf::new());
        for entry in parse_tle_content(content, source)? {
            loader.satellites.insert(entry.info.norad_id, entry);
        }
        Ok(loader)
    }

    /// Load all TLE files from the directory
    pub fn load_all(&mut self) -> Result<(), PredictError> {
        if !self.tle_dir.exists() {
            return Err(PredictError::DirectoryNotFound(
                self.tle_dir.display().to_string(),
            ));
        }

        self.satellites.clear();

        for entry in fs::read_dir(&self.tle_dir)? {
            let path = entry?.path();

            let is_tle = path
                .extension()
                .is_some_and(|ext| ext == "tle" || ext == "txt");
            if !path.is_file() || !is_tle {
                continue;
            }

            match self.parse_tle_file(&path) {
                Ok(entries) => {
                    for tle_entry in entries {
                        self.satellites.insert(tle_entry.info.norad_id, tle_entry);
                    }
                }
                Err(e) => {
                    log::warn!("Failed to parse TLE file {}: {}", path.display(), e);
                }
            }
        }

        log::info!(
            "Loaded {} TLEs from {}",
            self.satellites.len(),
            self.tle_dir.display()
        );
        Ok(())
    }

    fn parse_tle_file(&self, path: &Path) -> Result<Vec<TleEntry>, PredictError> {
        let content = fs::read_to_string(path)?;
        let filename = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        parse_tle_content(&content, &filename)
    }

    /// Look a satellite up by NORAD id, falling back to its TLE name.
    pub fn find(&self, name: &str, norad_id: Option<u32>) -> Option<&TleEntry> {
        if let Some(entry) = norad_id.and_then(|id| self.satellites.get(&id)) {
            return Some(entry);
        }
        self.satellites
            .values()
            .find(|e| e.info.name.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.satellites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.satellites.is_empty()
    }
}

fn parse_tle_content(content: &str, source: &str) -> Result<Vec<TleEntry>, PredictError> {
    let invalid = |message: String| PredictError::InvalidTle {
        file: source.to_string(),
        message,
    };

    let mut results = Vec::new();
    for (name, line1, line2) in parse_multi_tle(content) {
        let elements = Elements::from_tle(name.clone(), line1.as_bytes(), line2.as_bytes())
            .map_err(|e| invalid(e.to_string()))?;
        let constants =
            Constants::from_elements(&elements).map_err(|e| invalid(e.to_string()))?;

        let sat_name = name.unwrap_or_else(|| format!("NORAD {}", elements.norad_id));

        results.push(TleEntry {
            info: SatelliteInfo {
                name: sat_name,
                norad_id: elements.norad_id as u32,
                tle_source: source.to_string(),
            },
            elements,
            constants,
        });
    }

    Ok(results)
}

/// Split multi-satellite TLE text into (name, line1, line2) triples.
fn parse_multi_tle(content: &str) -> Vec<(Option<String>, String, String)> {
    let lines: Vec<&str> = content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();

    let mut result = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].starts_with("1 ") && i + 1 < lines.len() && lines[i + 1].starts_with("2 ") {
            // 2-line TLE (no name)
            result.push((None, lines[i].to_string(), lines[i + 1].to_string()));
            i += 2;
        } else if i + 2 < lines.len()
            && lines[i + 1].starts_with("1 ")
            && lines[i + 2].starts_with("2 ")
        {
            // 3-line TLE (with name)
            result.push((
                Some(lines[i].to_string()),
                lines[i + 1].to_string(),
                lines[i + 2].to_string(),
            ));
            i += 3;
        } else {
            i += 1;
        }
    }

    result
}
