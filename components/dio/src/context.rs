//! Per-task state binding one network task to an open file. Instead of
//! raw continuation callbacks, the hooks are tagged enums plus one
//! listener trait: the worker decides *what* to do from the enum, and
//! the network layer only learns *when* through [`DioListener`].

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::Arc,
};

use bytes::BytesMut;
use snafu::ResultExt;
use tracing::{debug, error, warn};
use trunkfs_common::ConnId;
use trunkfs_storage::trunk_file;
use trunkfs_types::{TrunkFileType, TrunkFullInfo};

use crate::{
    err::{OpenFileSnafu, ReadFileSnafu, Result, SeekFileSnafu, WriteFileSnafu},
    stats::DioStats,
};

/// Whether an operation consumes reader or writer pool capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DioOpCode {
    Read,
    Write,
    Truncate,
    DeleteNormal,
    DeleteTrunk,
    /// Consume incoming bytes without touching the disk.
    Discard,
}

impl DioOpCode {
    pub fn kind(self) -> FileOpKind {
        match self {
            DioOpCode::Read => FileOpKind::Read,
            _ => FileOpKind::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn write_create() -> Self {
        Self {
            write: true,
            create: true,
            ..Default::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    fn to_options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .create(self.create)
            .truncate(self.truncate);
        options
    }
}

/// Work to run once before the file is first opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BeforeOpenHook {
    #[default]
    None,
    /// Verify the target trunk slot still carries the free sentinel
    /// before writing into a shared trunk file.
    CheckTrunkFile,
}

/// Work to run after the last chunk, before the file closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BeforeCloseHook {
    #[default]
    None,
    /// Write the slot header (type, sizes, crc, mtime, ext name) in
    /// front of the payload.
    WriteTrunkHeader,
}

/// What to do when the connection drops mid-transfer. No partial content
/// may ever be visible to a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupKind {
    /// Downloads: just close.
    #[default]
    CloseOnly,
    /// Fresh uploads: delete the half-written file.
    DeleteOnAbort,
    /// Appenders: truncate back to the pre-operation length.
    TruncateToStart,
    /// In-place modify: nothing to undo, log the failure.
    LogOnly,
    /// Trunk uploads: reclaim the slot (header to NONE, body zeroed).
    DeleteTrunkSlot,
}

/// Upload-side metadata consumed by the trunk hooks.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub file_type: TrunkFileType,
    pub ext_name: String,
    /// Seconds timestamp stamped into the slot header as mtime.
    pub start_time: u32,
    pub trunk_info: Option<TrunkFullInfo>,
    /// Full pre-allocated size of the trunk file, for the create/resize
    /// guard.
    pub trunk_file_size: u64,
}

/// State of one in-flight disk task: the backing file, the byte window
/// being transferred, and the running digests.
pub struct FileContext {
    pub filename: PathBuf,
    pub open_flags: OpenFlags,
    pub(crate) file: Option<File>,

    /// Next byte to transfer.
    pub offset: u64,
    /// First byte of the operation (pre-operation length for appenders).
    pub start: u64,
    /// One past the last byte of the operation.
    pub end: u64,
    /// Where this chunk's payload begins inside the task buffer.
    pub buff_offset: usize,

    pub calc_crc32: bool,
    pub(crate) crc: crc32fast::Hasher,
    /// Finalized at `end`.
    pub crc32: Option<u32>,

    pub calc_signature: bool,
    pub(crate) signer: blake3::Hasher,
    /// Finalized at `end`.
    pub signature: Option<blake3::Hash>,

    pub before_open: BeforeOpenHook,
    pub before_close: BeforeCloseHook,
    pub cleanup: CleanupKind,
    pub upload: Option<UploadMeta>,
}

impl FileContext {
    pub fn new(filename: impl Into<PathBuf>, open_flags: OpenFlags) -> Self {
        Self {
            filename: filename.into(),
            open_flags,
            file: None,
            offset: 0,
            start: 0,
            end: 0,
            buff_offset: 0,
            calc_crc32: false,
            crc: crc32fast::Hasher::new(),
            crc32: None,
            calc_signature: false,
            signer: blake3::Hasher::new(),
            signature: None,
            before_open: BeforeOpenHook::None,
            before_close: BeforeCloseHook::None,
            cleanup: CleanupKind::CloseOnly,
            upload: None,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.offset)
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Lazily open the backing file, seeking to the current offset on
    /// first use.
    pub(crate) fn ensure_open(&mut self, stats: &DioStats) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let result = self.open_flags.to_options().open(&self.filename);
        stats.record_open(result.is_ok());
        let mut file = result.context(OpenFileSnafu {
            path: &self.filename,
        })?;
        if self.offset > 0 {
            file.seek(SeekFrom::Start(self.offset)).context(SeekFileSnafu {
                path: &self.filename,
            })?;
        }
        self.file = Some(file);
        Ok(())
    }

    /// [`ensure_open`](Self::ensure_open) must have succeeded first.
    pub(crate) fn file_mut(&mut self) -> &mut File {
        self.file.as_mut().expect("file context is not open")
    }

    /// Read the next chunk into `buf`, updating digests and advancing the
    /// offset. `buf` must not reach past `end`.
    pub(crate) fn read_chunk(&mut self, buf: &mut [u8], stats: &DioStats) -> Result<()> {
        let result = self.file_mut().read_exact(buf);
        stats.record_read(result.is_ok());
        result.context(ReadFileSnafu {
            path: &self.filename,
        })?;
        self.update_digests(buf);
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Write this chunk's bytes, updating digests and advancing the
    /// offset.
    pub(crate) fn write_chunk(&mut self, data: &[u8], stats: &DioStats) -> Result<()> {
        let result = self.file_mut().write_all(data);
        stats.record_write(result.is_ok());
        result.context(WriteFileSnafu {
            path: &self.filename,
        })?;
        self.update_digests(data);
        self.offset += data.len() as u64;
        Ok(())
    }

    fn update_digests(&mut self, data: &[u8]) {
        if self.calc_crc32 {
            self.crc.update(data);
        }
        if self.calc_signature {
            self.signer.update(data);
        }
    }

    pub(crate) fn finalize_digests(&mut self) {
        if self.calc_crc32 {
            self.crc32 = Some(std::mem::take(&mut self.crc).finalize());
        }
        if self.calc_signature {
            self.signature = Some(self.signer.finalize());
        }
    }

    pub(crate) fn close_file(&mut self) {
        self.file = None;
    }

    /// Undo a half-finished transfer after the connection dropped or the
    /// write failed, according to the configured cleanup kind.
    pub fn clean_up(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };

        match self.cleanup {
            CleanupKind::CloseOnly => {}
            CleanupKind::DeleteOnAbort => {
                drop(file);
                if self.offset < self.end {
                    if let Err(e) = std::fs::remove_file(&self.filename) {
                        error!(
                            "delete useless file {} fail: {}",
                            self.filename.display(),
                            e
                        );
                    }
                }
            }
            CleanupKind::TruncateToStart => {
                if self.offset > self.start && self.offset < self.end {
                    if let Err(e) = file.set_len(self.start) {
                        error!(
                            "truncate file {} to {} fail: {}",
                            self.filename.display(),
                            self.start,
                            e
                        );
                    } else {
                        debug!(
                            "append fail, truncated file {} back to {}",
                            self.filename.display(),
                            self.start
                        );
                    }
                }
            }
            CleanupKind::LogOnly => {
                if self.offset >= self.start && self.offset < self.end {
                    error!("modify file {} fail", self.filename.display());
                }
            }
            CleanupKind::DeleteTrunkSlot => {
                if self.offset > self.start && self.offset < self.end {
                    let trunk_info = self.upload.as_ref().and_then(|u| u.trunk_info);
                    match trunk_info {
                        Some(info) => {
                            if let Err(e) = trunk_file::delete_slot(&self.filename, &info) {
                                error!(
                                    "reclaim trunk slot in {} fail: {}",
                                    self.filename.display(),
                                    e
                                );
                            }
                        }
                        None => warn!(
                            "trunk cleanup for {} has no trunk info",
                            self.filename.display()
                        ),
                    }
                }
            }
        }
    }
}

/// One queued unit of disk work: the context, the opcode, and the chunk
/// buffer shared with the network layer. Reads append into `buffer`;
/// writes consume `buffer[ctx.buff_offset..]`.
pub struct DioTask {
    /// Connection descriptor; its hash pins the task to a worker.
    pub conn_id: ConnId,
    pub op: DioOpCode,
    pub ctx: FileContext,
    pub buffer: BytesMut,
    pub listener: Arc<dyn DioListener>,
}

/// The seam back into the network layer. The worker calls exactly one of
/// `on_continue`/`on_done` per execution; `on_continue` hands the task
/// back so the network layer can drain/refill the buffer and re-enqueue
/// it, which is what drives multi-chunk transfers (never a blocking loop
/// inside the worker).
pub trait DioListener: Send + Sync {
    fn on_continue(&self, task: DioTask);
    fn on_done(&self, task: DioTask, result: Result<()>);
    /// A chance to log an error against the owning connection before
    /// `on_done` reports it.
    fn on_error_log(&self, _task: &DioTask, _err: &crate::err::Error) {}
}
