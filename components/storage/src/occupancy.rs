//! Offset-ordered index of live free-list ranges, one map per physical
//! trunk file. The size-keyed index answers "smallest slot >= N"; this
//! one answers "does this range collide with anything already tracked"
//! before an insert is allowed to go through.

use std::collections::{BTreeMap, HashMap};

use trunkfs_common::{StorePathIndex, TrunkFileId};
use trunkfs_types::TrunkFullInfo;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InsertCheck {
    Ok,
    /// Exactly this range is already tracked.
    Duplicate,
    /// A different range overlaps this one.
    Overlap(TrunkFullInfo),
}

#[derive(Default)]
pub(crate) struct OccupancyIndex {
    files: HashMap<(StorePathIndex, TrunkFileId), BTreeMap<u32, TrunkFullInfo>>,
}

impl OccupancyIndex {
    pub fn check(&self, info: &TrunkFullInfo) -> InsertCheck {
        let Some(ranges) = self.files.get(&info.file_key()) else {
            return InsertCheck::Ok;
        };

        // The nearest range at or before our offset.
        if let Some((_, prev)) = ranges.range(..=info.file.offset).next_back() {
            if prev.file.offset == info.file.offset && prev.file.size == info.file.size {
                return InsertCheck::Duplicate;
            }
            if prev.end() > info.file.offset {
                return InsertCheck::Overlap(*prev);
            }
        }
        // The nearest range after our offset.
        if let Some((_, next)) = ranges.range(info.file.offset + 1..).next() {
            if info.end() > next.file.offset {
                return InsertCheck::Overlap(*next);
            }
        }
        InsertCheck::Ok
    }

    /// The caller must have passed [`check`](Self::check) first.
    pub fn insert(&mut self, info: TrunkFullInfo) {
        self.files
            .entry(info.file_key())
            .or_default()
            .insert(info.file.offset, info);
    }

    pub fn remove(&mut self, info: &TrunkFullInfo) -> bool {
        let Some(ranges) = self.files.get_mut(&info.file_key()) else {
            return false;
        };
        match ranges.get(&info.file.offset) {
            Some(found) if found == info => {
                ranges.remove(&info.file.offset);
                if ranges.is_empty() {
                    self.files.remove(&info.file_key());
                }
                true
            }
            _ => false,
        }
    }

    pub fn total_count(&self) -> usize {
        self.files.values().map(|ranges| ranges.len()).sum()
    }
}
