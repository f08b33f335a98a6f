// Copyright 2024 trunkfs
//
// FastDFS, Copyright 2008 Happy Fish / YuQing
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Identification of a byte range inside a trunk file. A trunk file packs
//! many small logical files; `TrunkFullInfo` is the coordinate of one
//! slot: which store path, which HH/HH subdirectory pair, which trunk
//! file id, and the offset/size of the slot within it.

use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use trunkfs_common::{StorePathIndex, TrunkFileId, STORE_DATA_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrunkStatus {
    #[default]
    Free,
    /// Reserved by an in-flight allocation, waiting for `alloc_confirm`.
    Hold,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TrunkPathInfo {
    /// Store path as Mxx.
    pub store_path_index: StorePathIndex,
    /// Front part of the HH/HH subdirectory pair.
    pub sub_path_high: u8,
    /// Tail part of the HH/HH subdirectory pair.
    pub sub_path_low: u8,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TrunkFileInfo {
    /// Trunk file id, unique per store path set.
    pub id: TrunkFileId,
    /// Slot offset within the trunk file.
    pub offset: u32,
    /// Slot size in bytes, header included.
    pub size: u32,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TrunkFullInfo {
    pub path: TrunkPathInfo,
    pub file: TrunkFileInfo,
}

impl TrunkFullInfo {
    /// Key identifying the physical trunk file this range lives in.
    pub fn file_key(&self) -> (StorePathIndex, TrunkFileId) {
        (self.path.store_path_index, self.file.id)
    }

    pub fn end(&self) -> u32 {
        self.file.offset + self.file.size
    }

    /// Path of the trunk file relative to its store path root, e.g.
    /// `data/3F/02/000153`.
    pub fn rel_path(&self) -> PathBuf {
        let mut path = PathBuf::from(STORE_DATA_DIR);
        path.push(format!("{:02X}", self.path.sub_path_high));
        path.push(format!("{:02X}", self.path.sub_path_low));
        path.push(trunk_file_name(self.file.id));
        path
    }
}

impl Display for TrunkFullInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "path index: {}, sub path: {:02X}/{:02X}, id: {}, offset: {}, size: {}",
            self.path.store_path_index,
            self.path.sub_path_high,
            self.path.sub_path_low,
            self.file.id,
            self.file.offset,
            self.file.size,
        )
    }
}

/// File name of a trunk file inside its subdirectory.
pub fn trunk_file_name(id: TrunkFileId) -> String {
    format!("{:06}", id)
}

/// Map a trunk file id onto its HH/HH subdirectory pair. The mapping must
/// be stable across restarts, so it hashes the printed file name rather
/// than using a per-process seeded hasher.
pub fn sub_path_for(id: TrunkFileId, subdir_count: u16) -> (u8, u8) {
    let hash = crc32fast::hash(trunk_file_name(id).as_bytes());
    let high = ((hash >> 16) % subdir_count as u32) as u8;
    let low = (hash % subdir_count as u32) as u8;
    (high, low)
}
