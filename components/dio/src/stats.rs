use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide operation counters, shared by all workers.
#[derive(Default, Debug)]
pub struct DioStats {
    total_file_open_count: AtomicU64,
    success_file_open_count: AtomicU64,
    total_file_read_count: AtomicU64,
    success_file_read_count: AtomicU64,
    total_file_write_count: AtomicU64,
    success_file_write_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DioStatsSnapshot {
    pub total_file_open_count: u64,
    pub success_file_open_count: u64,
    pub total_file_read_count: u64,
    pub success_file_read_count: u64,
    pub total_file_write_count: u64,
    pub success_file_write_count: u64,
}

impl DioStats {
    pub(crate) fn record_open(&self, ok: bool) {
        self.total_file_open_count.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.success_file_open_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_read(&self, ok: bool) {
        self.total_file_read_count.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.success_file_read_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_write(&self, ok: bool) {
        self.total_file_write_count.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.success_file_write_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DioStatsSnapshot {
        DioStatsSnapshot {
            total_file_open_count: self.total_file_open_count.load(Ordering::Relaxed),
            success_file_open_count: self.success_file_open_count.load(Ordering::Relaxed),
            total_file_read_count: self.total_file_read_count.load(Ordering::Relaxed),
            success_file_read_count: self.success_file_read_count.load(Ordering::Relaxed),
            total_file_write_count: self.total_file_write_count.load(Ordering::Relaxed),
            success_file_write_count: self.success_file_write_count.load(Ordering::Relaxed),
        }
    }
}
