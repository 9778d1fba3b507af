//! Process identity and memory snapshots

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;

/// Memory usage of the current process, in kilobytes
///
/// Fields are `None` on platforms without `/proc/self/status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Resident set size
    pub rss_kb: Option<u64>,
    /// Data segment (heap) size
    pub heap_kb: Option<u64>,
    /// Virtual memory size
    pub virtual_kb: Option<u64>,
}

impl MemorySnapshot {
    /// Capture the current memory usage
    pub fn capture() -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                return Self::parse_proc_status(&status);
            }
        }

        Self::default()
    }

    fn parse_proc_status(status: &str) -> Self {
        let mut snapshot = Self::default();

        for line in status.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(kb) = value.parse::<u64>() else {
                continue;
            };

            match key {
                "VmRSS:" => snapshot.rss_kb = Some(kb),
                "VmData:" => snapshot.heap_kb = Some(kb),
                "VmSize:" => snapshot.virtual_kb = Some(kb),
                _ => {}
            }
        }

        snapshot
    }
}

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Mark the process start; later calls keep the first instant
pub fn mark_start() {
    PROCESS_START.get_or_init(Instant::now);
}

/// Seconds since [`mark_start`] was first called
pub fn uptime_seconds() -> u64 {
    PROCESS_START.get_or_init(Instant::now).elapsed().as_secs()
}

pub fn pid() -> u32 {
    std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\tshelfwatch\nVmSize:\t  204800 kB\nVmRSS:\t   10240 kB\nVmData:\t    8192 kB\nThreads:\t4\n";
        let snapshot = MemorySnapshot::parse_proc_status(status);

        assert_eq!(snapshot.rss_kb, Some(10240));
        assert_eq!(snapshot.heap_kb, Some(8192));
        assert_eq!(snapshot.virtual_kb, Some(204800));
    }

    #[test]
    fn test_parse_ignores_garbage() {
        let snapshot = MemorySnapshot::parse_proc_status("VmRSS:\tlots kB\nbroken");
        assert_eq!(snapshot, MemorySnapshot::default());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_capture_on_linux() {
        assert!(MemorySnapshot::capture().rss_kb.is_some());
    }
}
