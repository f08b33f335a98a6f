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

pub const TRUNKFS: &str = "trunkfs";

/// Directory under a store path holding the HH/HH subdirectory fan-out.
pub const STORE_DATA_DIR: &str = "data";
/// Directory under the base path holding the trunk binlog and its
/// compaction artifacts.
pub const TRUNK_DIR: &str = "trunk";

pub const TRUNK_BINLOG_FILENAME: &str = "binlog";
pub const TRUNK_BINLOG_ROLLBACK_EXT: &str = "rollback";
pub const TRUNK_CHECKPOINT_FILENAME: &str = "storage_trunk.dat";
pub const TRUNK_STATE_FILENAME: &str = "trunk_state.json";
pub const TRUNK_COMPRESS_STAGE_FILENAME: &str = "compress_stage";

/// Max length of a stored file's extension, excluding the dot.
pub const EXT_NAME_MAX_LEN: usize = 6;

pub const KIB: u64 = 1 << 10;
pub const MIB: u64 = 1 << 20;

pub const DEFAULT_SLOT_MIN_SIZE: u64 = 256;
pub const DEFAULT_SLOT_MAX_SIZE: u64 = 16 * MIB;
pub const DEFAULT_TRUNK_FILE_SIZE: u64 = 64 * MIB;
/// Number of second-level subdirectories per level under a store path.
pub const DEFAULT_SUBDIR_COUNT: u16 = 256;

pub type StorePathIndex = u8;
pub type TrunkFileId = u32;
pub type ConnId = u64;
