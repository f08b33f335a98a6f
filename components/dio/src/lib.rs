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

//! Disk I/O engine. Blocking file operations run on per-store-path
//! worker thread pools so the network event loop never blocks on disk;
//! each worker owns one FIFO queue, and a connection's chunks are pinned
//! to one worker so its bytes land strictly in order.

pub mod config;
pub mod context;
mod engine;
pub mod err;
mod ops;
pub mod stats;

pub use config::DioConfig;
pub use context::{
    BeforeCloseHook, BeforeOpenHook, CleanupKind, DioListener, DioOpCode, DioTask, FileContext,
    FileOpKind, OpenFlags, UploadMeta,
};
pub use engine::DioEngine;
pub use err::{Error, Result};
pub use stats::{DioStats, DioStatsSnapshot};
