//! File integrity monitor.
//!
//! Hashes each watched file once per cycle and compares the SHA-256 digest
//! and mtime against the persisted database. The baseline always advances:
//! after every cycle the database holds the current state, so a file that
//! changes every cycle alerts every cycle.

use crate::alert::AlertSender;
use crate::config::FileMonitorConfig;
use crate::hashdb::HashDb;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct FileIntegrityMonitor {
    config: FileMonitorConfig,
    alerts: AlertSender,
    watched: Vec<PathBuf>,
    db: HashDb,
}

impl FileIntegrityMonitor {
    /// Watched paths come from the rule set at construction; they are not
    /// re-read per cycle.
    pub fn new(
        config: FileMonitorConfig,
        watched: Vec<PathBuf>,
        db: HashDb,
        alerts: AlertSender,
    ) -> Self {
        Self {
            config,
            alerts,
            watched,
            db,
        }
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(files = self.watched.len(), "File integrity monitor started");
        self.alerts.info("File integrity monitor started").await;

        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_secs(self.config.scan_interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        error!("File integrity scan failed: {}", e);
                        self.alerts
                            .error(format!("File integrity scan failed: {}", e))
                            .await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("File integrity monitor stopped");
        Ok(())
    }

    /// One full pass over the watched files, then persist the database.
    pub async fn scan(&mut self) -> Result<()> {
        for path in self.watched.clone() {
            if !path.exists() {
                debug!(path = %path.display(), "Watched file does not exist, skipping");
                continue;
            }

            let digest = match compute_sha256(&path) {
                Ok(d) => d,
                Err(e) => {
                    self.alerts
                        .error(format!("Failed to hash {}: {}", path.display(), e))
                        .await;
                    continue;
                }
            };

            let mtime = match read_mtime(&path) {
                Ok(t) => t,
                Err(e) => {
                    self.alerts
                        .error(format!("Failed to stat {}: {}", path.display(), e))
                        .await;
                    continue;
                }
            };

            if let Some(prior) = self.db.get(&path) {
                if prior.digest != digest || prior.mtime != mtime {
                    warn!(
                        path = %path.display(),
                        old_hash = %prior.digest,
                        new_hash = %digest,
                        "File integrity violation"
                    );
                    self.alerts
                        .warning(format!("File modified: {}", path.display()))
                        .await;
                }
            }

            self.db.insert(&path, digest, mtime);
        }

        self.db.save().context("Failed to persist hash database")?;
        Ok(())
    }

    #[cfg(test)]
    fn db(&self) -> &HashDb {
        &self.db
    }
}

/// Streamed SHA-256 of a file, 8 KiB chunks.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).context("Failed to open file")?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer).context("Failed to read file")?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

fn read_mtime(path: &Path) -> Result<f64> {
    let metadata = std::fs::metadata(path).context("Failed to read metadata")?;
    let modified = metadata.modified().context("Failed to read mtime")?;
    let secs = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(secs)
}
