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

//! Trunk space management. A trunk file is a large pre-allocated file
//! packing many small logical files to avoid filesystem inode
//! exhaustion; the [`TrunkAllocator`] hands out byte ranges (slots)
//! inside trunk files, persists every change to an append-only binlog,
//! checkpoints the free-space index, and compacts the binlog.

mod arena;
pub mod binlog;
pub mod checkpoint;
pub mod compress;
pub mod config;
pub mod err;
mod occupancy;
pub mod trunk_file;

mod allocator;

pub use allocator::{AllocConfirmStatus, RoundRobinSelector, StorePathSelector, TrunkAllocator};
pub use config::TrunkConfig;
pub use err::{Error, Result};
