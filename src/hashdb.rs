//! Persistent hash database for the file integrity monitor.
//!
//! On-disk format is a flat JSON object: for every tracked path there is a
//! `"<path>"` key holding the SHA-256 hex digest and a `"<path>_mtime"` key
//! holding the modification time in epoch seconds.

use crate::alert::AlertSender;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MTIME_SUFFIX: &str = "_mtime";

#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub digest: String,
    pub mtime: f64,
}

#[derive(Debug)]
pub struct HashDb {
    path: PathBuf,
    records: HashMap<String, FileRecord>,
}

impl HashDb {
    /// Load the database from `path`. A missing file starts empty; a
    /// malformed file is replaced with an empty database and reported as one
    /// ERROR alert.
    pub async fn load(path: &Path, alerts: &AlertSender) -> Self {
        let records = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, Value>>(&content) {
                Ok(flat) => {
                    let records = parse_flat(&flat);
                    info!(entries = records.len(), "Hash database loaded from {}", path.display());
                    records
                }
                Err(e) => {
                    warn!(path = %path.display(), "Malformed hash database: {}", e);
                    alerts
                        .error(format!(
                            "Hash database {} is corrupt, starting fresh: {}",
                            path.display(),
                            e
                        ))
                        .await;
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path: path.to_path_buf(),
            records,
        }
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.records.get(&path.to_string_lossy().into_owned())
    }

    pub fn insert(&mut self, path: &Path, digest: String, mtime: f64) {
        self.records
            .insert(path.to_string_lossy().into_owned(), FileRecord { digest, mtime });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Persist atomically: write a sibling temp file, then rename over the
    /// database so a crash mid-write never truncates it.
    pub fn save(&self) -> Result<()> {
        let mut flat = serde_json::Map::new();
        for (path, record) in &self.records {
            flat.insert(path.clone(), Value::String(record.digest.clone()));
            flat.insert(
                format!("{}{}", path, MTIME_SUFFIX),
                serde_json::json!(record.mtime),
            );
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(&Value::Object(flat))
            .context("Failed to serialize hash database")?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }
}

fn parse_flat(flat: &HashMap<String, Value>) -> HashMap<String, FileRecord> {
    let mut records = HashMap::new();
    for (key, value) in flat {
        if key.ends_with(MTIME_SUFFIX) {
            continue;
        }
        let Some(digest) = value.as_str() else {
            continue;
        };
        let mtime = flat
            .get(&format!("{}{}", key, MTIME_SUFFIX))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        records.insert(
            key.clone(),
            FileRecord {
                digest: digest.to_string(),
                mtime,
            },
        );
    }
    records
}
