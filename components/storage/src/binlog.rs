//! Append-only trunk binlog. One text line per record:
//!
//! `timestamp op_type store_path_index sub_path_high sub_path_low file_id offset size`
//!
//! where op_type is `A` (space added) or `D` (space deleted). Records are
//! immutable once written; compaction replaces the whole file through the
//! staged pipeline in [`crate::compress`].

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tracing::warn;
use trunkfs_types::{TrunkFileInfo, TrunkFullInfo, TrunkPathInfo};

use crate::err::{IoSnafu, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinlogOp {
    AddSpace,
    DelSpace,
}

impl BinlogOp {
    fn as_char(self) -> char {
        match self {
            BinlogOp::AddSpace => 'A',
            BinlogOp::DelSpace => 'D',
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "A" => Some(BinlogOp::AddSpace),
            "D" => Some(BinlogOp::DelSpace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinlogRecord {
    pub timestamp: i64,
    pub op: BinlogOp,
    pub info: TrunkFullInfo,
}

impl BinlogRecord {
    pub fn format(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {}\n",
            self.timestamp,
            self.op.as_char(),
            self.info.path.store_path_index,
            self.info.path.sub_path_high,
            self.info.path.sub_path_low,
            self.info.file.id,
            self.info.file.offset,
            self.info.file.size,
        )
    }

    pub fn parse(line: &str) -> Option<Self> {
        let mut cols = line.split_ascii_whitespace();
        let timestamp = cols.next()?.parse().ok()?;
        let op = BinlogOp::from_str(cols.next()?)?;
        let info = parse_info_columns(&mut cols)?;
        if cols.next().is_some() {
            return None;
        }
        Some(BinlogRecord { timestamp, op, info })
    }
}

/// Parse the 6 trailing `TrunkFullInfo` columns shared by binlog records
/// and checkpoint lines.
pub(crate) fn parse_info_columns<'a>(
    cols: &mut impl Iterator<Item = &'a str>,
) -> Option<TrunkFullInfo> {
    Some(TrunkFullInfo {
        path: TrunkPathInfo {
            store_path_index: cols.next()?.parse().ok()?,
            sub_path_high: cols.next()?.parse().ok()?,
            sub_path_low: cols.next()?.parse().ok()?,
        },
        file: TrunkFileInfo {
            id: cols.next()?.parse().ok()?,
            offset: cols.next()?.parse().ok()?,
            size: cols.next()?.parse().ok()?,
        },
    })
}

/// Appender over the binlog file. Each record is flushed to the OS as it
/// is written so a process crash loses nothing; `sync` forces the bytes
/// to stable storage for checkpoint barriers.
pub struct BinlogWriter {
    path: PathBuf,
    file: File,
    offset: u64,
}

impl BinlogWriter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(IoSnafu { path: &path })?;
        let offset = file
            .seek(SeekFrom::End(0))
            .context(IoSnafu { path: &path })?;
        Ok(Self { path, file, offset })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current binlog size in bytes.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn write(&mut self, record: &BinlogRecord) -> Result<()> {
        let line = record.format();
        self.file
            .write_all(line.as_bytes())
            .context(IoSnafu { path: &self.path })?;
        self.offset += line.len() as u64;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data().context(IoSnafu { path: &self.path })
    }
}

/// Sequential reader that replays records starting at a byte offset.
/// Malformed lines are skipped with a warning; their bytes still count
/// toward the reported offset so replay can resume past them.
pub struct BinlogReader {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    line_buf: String,
}

impl BinlogReader {
    pub fn open(path: impl Into<PathBuf>, from_offset: u64) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path).context(IoSnafu { path: &path })?;
        file.seek(SeekFrom::Start(from_offset))
            .context(IoSnafu { path: &path })?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            offset: from_offset,
            line_buf: String::new(),
        })
    }

    /// Byte offset just past the last returned record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next_record(&mut self) -> Result<Option<BinlogRecord>> {
        loop {
            self.line_buf.clear();
            let bytes = self
                .reader
                .read_line(&mut self.line_buf)
                .context(IoSnafu { path: &self.path })?;
            if bytes == 0 {
                return Ok(None);
            }

            let line = self.line_buf.trim_end_matches('\n');
            // A torn final line (no newline) is left for the next replay.
            if !self.line_buf.ends_with('\n') {
                warn!(
                    "binlog {} has a torn trailing record at offset {}, ignoring it",
                    self.path.display(),
                    self.offset
                );
                return Ok(None);
            }

            self.offset += bytes as u64;
            match BinlogRecord::parse(line) {
                Some(record) => return Ok(Some(record)),
                None => {
                    warn!(
                        "skip malformed binlog line at offset {} in {}: {:?}",
                        self.offset - bytes as u64,
                        self.path.display(),
                        line
                    );
                }
            }
        }
    }
}

/// Size of the binlog file, 0 when it does not exist yet.
pub fn binlog_size(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).context(IoSnafu { path }),
    }
}
