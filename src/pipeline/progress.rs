// Throughput accounting and progress updates

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Since-last-report accumulators, bumped by the coordinator loops and
/// drained by the reporter each update interval.
#[derive(Debug, Default)]
pub struct Counters {
    pub bytes_downloaded: AtomicU64,
    pub bytes_decompressed: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub chunks_processed: AtomicUsize,
    pub tasks_processed: AtomicUsize,
}

/// One drained snapshot of the counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub bytes_downloaded: u64,
    pub bytes_decompressed: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub chunks_processed: usize,
    pub tasks_processed: usize,
}

impl Counters {
    /// Atomically take and reset all accumulators.
    pub fn drain(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_downloaded: self.bytes_downloaded.swap(0, Ordering::Relaxed),
            bytes_decompressed: self.bytes_decompressed.swap(0, Ordering::Relaxed),
            bytes_written: self.bytes_written.swap(0, Ordering::Relaxed),
            bytes_read: self.bytes_read.swap(0, Ordering::Relaxed),
            chunks_processed: self.chunks_processed.swap(0, Ordering::Relaxed),
            tasks_processed: self.tasks_processed.swap(0, Ordering::Relaxed),
        }
    }
}

/// Periodic status snapshot pushed to the optional status channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UiUpdate {
    pub progress: f64,
    /// Decompressed download throughput, bytes/s
    pub download_speed: f64,
    pub write_speed: f64,
    pub read_speed: f64,
    pub memory_usage: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_resets() {
        let counters = Counters::default();
        counters.bytes_downloaded.fetch_add(100, Ordering::Relaxed);
        counters.tasks_processed.fetch_add(3, Ordering::Relaxed);

        let snap = counters.drain();
        assert_eq!(snap.bytes_downloaded, 100);
        assert_eq!(snap.tasks_processed, 3);

        let snap = counters.drain();
        assert_eq!(snap.bytes_downloaded, 0);
        assert_eq!(snap.tasks_processed, 0);
    }

    #[test]
    fn test_ui_update_serializes() {
        let update = UiUpdate {
            progress: 42.5,
            download_speed: 1024.0,
            write_speed: 2048.0,
            read_speed: 0.0,
            memory_usage: 8 * 1024 * 1024,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"progress\":42.5"));
    }
}
