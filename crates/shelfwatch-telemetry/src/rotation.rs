//! Log file rotation implementation

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Size-triggered rotation of a single log file to a timestamped archive
pub struct LogRotator;

impl LogRotator {
    /// Rotate `path` if its size exceeds `max_bytes`
    pub fn maybe_rotate(path: &Path, max_bytes: u64) -> Result<Option<PathBuf>> {
        Self::maybe_rotate_for(path, max_bytes, 0)
    }

    /// Rotate `path` if appending `pending` bytes would carry it past `max_bytes`.
    ///
    /// An empty file is never rotated, so a single oversized line still lands
    /// somewhere. Returns the archive path when a rotation happened.
    pub fn maybe_rotate_for(path: &Path, max_bytes: u64, pending: u64) -> Result<Option<PathBuf>> {
        let size = match std::fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if size == 0 || size.saturating_add(pending) <= max_bytes {
            return Ok(None);
        }

        Self::rotate(path).map(Some)
    }

    /// Move `path` to its archive name and leave an empty file in its place
    pub fn rotate(path: &Path) -> Result<PathBuf> {
        let rotated_path = Self::archive_path(path, Utc::now());

        std::fs::rename(path, &rotated_path).map_err(|e| Error::Rotation {
            message: format!(
                "Failed to rename {} to {}: {}",
                path.display(),
                rotated_path.display(),
                e
            ),
        })?;
        File::create(path)?;

        tracing::info!(
            telemetry.event = "log_rotated",
            old_file = %path.display(),
            new_file = %rotated_path.display(),
            "Log file rotated"
        );

        Ok(rotated_path)
    }

    /// `<dir>/<stem>-<timestamp>.log`, suffixed with a counter if taken
    pub fn archive_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("log");
        let timestamp = at.format("%Y-%m-%dT%H-%M-%S-%3fZ");

        let candidate = dir.join(format!("{}-{}.log", stem, timestamp));
        if !candidate.exists() {
            return candidate;
        }

        (1u32..)
            .map(|n| dir.join(format!("{}-{}-{}.log", stem, timestamp, n)))
            .find(|p| !p.exists())
            .unwrap_or(candidate)
    }
}

/// Utility functions for rotated archive management
pub struct LogFileManager;

impl LogFileManager {
    /// Archives of the `<stem>.log` file in `log_dir`, newest first
    pub fn find_archives(log_dir: &Path, stem: &str) -> Result<Vec<LogFileInfo>> {
        let mut archives = Vec::new();

        if !log_dir.exists() {
            return Ok(archives);
        }

        let prefix = format!("{}-", stem);

        for entry in WalkDir::new(log_dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::Retention {
                message: format!("Failed to read {}: {}", log_dir.display(), e),
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };

            if file_name.starts_with(&prefix)
                && (file_name.ends_with(".log") || file_name.ends_with(".log.gz"))
            {
                let metadata = entry.metadata().map_err(|e| Error::Retention {
                    message: format!("Failed to stat {}: {}", entry.path().display(), e),
                })?;

                archives.push(LogFileInfo {
                    path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    modified: metadata.modified()?,
                });
            }
        }

        archives.sort_by(|a, b| b.modified.cmp(&a.modified));

        Ok(archives)
    }

    /// Compress a log file using gzip
    pub fn compress_log_file(file_path: &Path) -> Result<PathBuf> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::copy;

        let compressed_path = file_path.with_extension("log.gz");

        let input_file = File::open(file_path)?;
        let output_file = File::create(&compressed_path)?;
        let mut encoder = GzEncoder::new(output_file, Compression::default());

        let mut reader = io::BufReader::new(input_file);
        copy(&mut reader, &mut encoder)?;
        encoder.finish()?;

        std::fs::remove_file(file_path)?;

        tracing::info!(
            telemetry.event = "log_compressed",
            original_file = %file_path.display(),
            compressed_file = %compressed_path.display(),
            "Log archive compressed"
        );

        Ok(compressed_path)
    }
}

/// Information about a log file
#[derive(Debug, Clone)]
pub struct LogFileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl LogFileInfo {
    /// Get the age of the log file in days
    pub fn age_days(&self) -> f64 {
        SystemTime::now()
            .duration_since(self.modified)
            .map(|d| d.as_secs_f64() / (24.0 * 60.0 * 60.0))
            .unwrap_or(0.0)
    }

    /// Check if this is a compressed log file
    pub fn is_compressed(&self) -> bool {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == "gz")
            .unwrap_or(false)
    }
}
