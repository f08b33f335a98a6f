use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use trunkfs_common::{
    DEFAULT_SLOT_MAX_SIZE, DEFAULT_SLOT_MIN_SIZE, DEFAULT_SUBDIR_COUNT, DEFAULT_TRUNK_FILE_SIZE,
};
use trunkfs_utils::ReadableSize;

/// Allocator configuration. Loaded externally; the allocator only
/// consumes it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrunkConfig {
    /// Where the binlog, checkpoint and counters live, usually the
    /// storage node's base path.
    pub base_path: PathBuf,
    /// Physical storage roots; the unit of allocation-pool partitioning.
    pub store_paths: Vec<PathBuf>,

    /// Smallest slot the allocator hands out or tracks; freed spaces
    /// below this are dropped.
    pub slot_min_size: ReadableSize,
    /// Largest file eligible for trunk storage.
    pub slot_max_size: ReadableSize,
    /// Size every trunk file is pre-allocated to.
    pub trunk_file_size: ReadableSize,
    /// Allocation sizes are rounded up to a multiple of this; 0 disables
    /// rounding.
    pub alignment_size: ReadableSize,

    /// Coalesce adjacent free ranges (and unlink all-free trunk files)
    /// when writing a checkpoint.
    pub merge_free_space_on_save: bool,

    /// Minimum interval between binlog compactions; zero disables
    /// compaction.
    pub compress_binlog_min_interval: Duration,

    /// When non-zero, `create_trunk_files_in_advance` tops the pool up to
    /// this much free space.
    pub pre_create_space_threshold: ReadableSize,

    /// HH/HH fan-out per subdirectory level.
    pub subdir_count: u16,
}

impl Default for TrunkConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::new(),
            store_paths: Vec::new(),
            slot_min_size: ReadableSize(DEFAULT_SLOT_MIN_SIZE),
            slot_max_size: ReadableSize(DEFAULT_SLOT_MAX_SIZE),
            trunk_file_size: ReadableSize(DEFAULT_TRUNK_FILE_SIZE),
            alignment_size: ReadableSize(0),
            merge_free_space_on_save: false,
            compress_binlog_min_interval: Duration::ZERO,
            pre_create_space_threshold: ReadableSize(0),
            subdir_count: DEFAULT_SUBDIR_COUNT,
        }
    }
}

impl TrunkConfig {
    pub fn slot_min(&self) -> u32 {
        self.slot_min_size.as_bytes() as u32
    }

    pub fn slot_max(&self) -> u32 {
        self.slot_max_size.as_bytes() as u32
    }

    pub fn trunk_file_bytes(&self) -> u32 {
        self.trunk_file_size.as_bytes() as u32
    }
}
