use serde::{Deserialize, Serialize};

/// Worker pool topology, per store path. Loaded externally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DioConfig {
    pub store_path_count: usize,
    /// Workers servicing read traffic on each store path.
    pub reader_threads_per_path: usize,
    /// Workers servicing write traffic on each store path.
    pub writer_threads_per_path: usize,
    /// Keep the reader and writer sub-pools disjoint so read traffic
    /// never queues behind writes. When off, every worker takes both.
    pub rw_separated: bool,
}

impl Default for DioConfig {
    fn default() -> Self {
        Self {
            store_path_count: 1,
            reader_threads_per_path: 1,
            writer_threads_per_path: 1,
            rw_separated: true,
        }
    }
}

impl DioConfig {
    pub fn threads_per_path(&self) -> usize {
        self.reader_threads_per_path + self.writer_threads_per_path
    }

    pub fn total_threads(&self) -> usize {
        self.threads_per_path() * self.store_path_count
    }
}
