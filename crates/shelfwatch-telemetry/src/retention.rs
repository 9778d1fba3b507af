//! Retention of rotated log archives

use crate::{
    config::RetentionConfig,
    rotation::{LogFileInfo, LogFileManager},
    Result,
};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Applies age, count and compression policies to rotated archives
#[derive(Debug, Clone)]
pub struct RetentionManager {
    config: RetentionConfig,
}

impl RetentionManager {
    pub fn new(config: RetentionConfig) -> Self {
        Self { config }
    }

    /// Clean up the archives of every file in `stems`
    pub async fn cleanup_all(&self, log_dir: &Path, stems: &[&str]) -> CleanupReport {
        let mut total = CleanupReport::default();

        for stem in stems {
            match self.perform_cleanup(log_dir, stem).await {
                Ok(report) => total.merge(&report),
                Err(e) => {
                    warn!(
                        telemetry.event = "retention_cleanup_failed",
                        stem = stem,
                        error = %e,
                        "Failed to clean up log archives"
                    );
                }
            }
        }

        total
    }

    /// Perform immediate cleanup of the archives of `<stem>.log`
    pub async fn perform_cleanup(&self, log_dir: &Path, stem: &str) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        let mut archives = LogFileManager::find_archives(log_dir, stem)?;
        if archives.is_empty() {
            return Ok(report);
        }
        report.initial_archive_count = archives.len();

        if self.config.compress_archives {
            report.archives_compressed = self.compress_old_archives(&mut archives);
        }

        report.removed_by_age = self.remove_old_archives(&mut archives).await;
        report.removed_by_count = self.remove_excess_archives(&mut archives).await;
        report.final_archive_count = archives.len();

        info!(
            telemetry.event = "retention_cleanup_completed",
            stem = stem,
            initial_archives = report.initial_archive_count,
            final_archives = report.final_archive_count,
            archives_compressed = report.archives_compressed,
            removed_by_age = report.removed_by_age,
            removed_by_count = report.removed_by_count,
            "Log archive cleanup completed"
        );

        Ok(report)
    }

    /// Compress uncompressed archives older than one day
    fn compress_old_archives(&self, archives: &mut [LogFileInfo]) -> u32 {
        let mut compressed_count = 0;
        let one_day_ago = SystemTime::now() - Duration::from_secs(24 * 60 * 60);

        for archive in archives
            .iter_mut()
            .filter(|a| !a.is_compressed() && a.modified < one_day_ago)
        {
            match LogFileManager::compress_log_file(&archive.path) {
                Ok(compressed_path) => {
                    compressed_count += 1;
                    archive.path = compressed_path;
                }
                Err(e) => {
                    warn!(
                        telemetry.event = "compression_failed",
                        file = %archive.path.display(),
                        error = %e,
                        "Failed to compress log archive"
                    );
                }
            }
        }

        compressed_count
    }

    /// Remove archives older than the maximum age
    async fn remove_old_archives(&self, archives: &mut Vec<LogFileInfo>) -> u32 {
        let max_age_days = self.config.max_age_days as f64;
        let (expired, kept): (Vec<_>, Vec<_>) = archives
            .drain(..)
            .partition(|a| a.age_days() > max_age_days);
        *archives = kept;

        let mut removed_count = 0;
        for archive in expired {
            if remove_archive(&archive, "expired").await {
                removed_count += 1;
            }
        }

        removed_count
    }

    /// Remove the oldest archives beyond the maximum count
    async fn remove_excess_archives(&self, archives: &mut Vec<LogFileInfo>) -> u32 {
        let max_archives = self.config.max_archives as usize;
        if archives.len() <= max_archives {
            return 0;
        }

        // Newest first, so everything past max_archives is the oldest
        archives.sort_by(|a, b| b.modified.cmp(&a.modified));
        let excess = archives.split_off(max_archives);

        let mut removed_count = 0;
        for archive in excess {
            if remove_archive(&archive, "excess").await {
                removed_count += 1;
            }
        }

        removed_count
    }
}

async fn remove_archive(archive: &LogFileInfo, reason: &'static str) -> bool {
    match tokio::fs::remove_file(&archive.path).await {
        Ok(()) => {
            info!(
                telemetry.event = "archive_removed",
                file = %archive.path.display(),
                reason = reason,
                age_days = archive.age_days(),
                "Removed log archive"
            );
            true
        }
        Err(e) => {
            warn!(
                telemetry.event = "archive_removal_failed",
                file = %archive.path.display(),
                error = %e,
                "Failed to remove log archive"
            );
            false
        }
    }
}

/// Report of cleanup operations performed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub initial_archive_count: usize,
    pub final_archive_count: usize,
    pub archives_compressed: u32,
    pub removed_by_age: u32,
    pub removed_by_count: u32,
}

impl CleanupReport {
    pub fn total_removed(&self) -> u32 {
        self.removed_by_age + self.removed_by_count
    }

    fn merge(&mut self, other: &CleanupReport) {
        self.initial_archive_count += other.initial_archive_count;
        self.final_archive_count += other.final_archive_count;
        self.archives_compressed += other.archives_compressed;
        self.removed_by_age += other.removed_by_age;
        self.removed_by_count += other.removed_by_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_archive(dir: &Path, name: &str, age: Duration) {
        let path = dir.join(name);
        std::fs::write(&path, "archived entries").unwrap();
        let time = SystemTime::now() - age;
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(time)).unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_by_count() {
        let temp_dir = TempDir::new().unwrap();

        for i in 0..10 {
            write_archive(
                temp_dir.path(),
                &format!("application-2024-01-01T00-00-{:02}-000Z.log", i),
                Duration::from_secs(i * 60),
            );
        }

        let manager = RetentionManager::new(RetentionConfig {
            max_archives: 5,
            max_age_days: 365,
            compress_archives: false,
        });
        let report = manager
            .perform_cleanup(temp_dir.path(), "application")
            .await
            .unwrap();

        assert_eq!(report.removed_by_count, 5);
        assert_eq!(report.final_archive_count, 5);

        // The five newest survive
        for i in 0..5 {
            assert!(temp_dir
                .path()
                .join(format!("application-2024-01-01T00-00-{:02}-000Z.log", i))
                .exists());
        }
    }

    #[tokio::test]
    async fn test_cleanup_by_age_and_compression() {
        let temp_dir = TempDir::new().unwrap();

        write_archive(temp_dir.path(), "errors-a.log", Duration::from_secs(40 * 24 * 3600));
        write_archive(temp_dir.path(), "errors-b.log", Duration::from_secs(2 * 24 * 3600));
        write_archive(temp_dir.path(), "errors-c.log", Duration::from_secs(60));
        std::fs::write(temp_dir.path().join("errors.log"), "live").unwrap();

        let manager = RetentionManager::new(RetentionConfig {
            max_archives: 10,
            max_age_days: 30,
            compress_archives: true,
        });
        let report = manager.perform_cleanup(temp_dir.path(), "errors").await.unwrap();

        // The 40 day old archive is compressed first, then expired
        assert_eq!(report.archives_compressed, 2);
        assert_eq!(report.removed_by_age, 1);
        assert!(temp_dir.path().join("errors-b.log.gz").exists());
        assert!(temp_dir.path().join("errors-c.log").exists());
        assert!(temp_dir.path().join("errors.log").exists());
    }

    #[tokio::test]
    async fn test_cleanup_all_without_archives() {
        let temp_dir = TempDir::new().unwrap();
        let manager = RetentionManager::new(RetentionConfig::default());

        let report = manager
            .cleanup_all(temp_dir.path(), &["application", "errors"])
            .await;

        assert_eq!(report, CleanupReport::default());
    }
}
