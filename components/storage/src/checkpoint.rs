//! Free-space checkpoint file. Line 1 carries the binlog byte offset the
//! snapshot covers; every following line is an ADD record for one free
//! (or held) range, written in the binlog's 8-column form. Loading also
//! accepts the legacy 6-column form without the timestamp/op prefix.
//! The file is written to a temp name and atomically renamed into place.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use trunkfs_types::TrunkFullInfo;

use crate::{
    binlog::{parse_info_columns, BinlogOp, BinlogRecord},
    err::{InvalidCheckpointSnafu, IoSnafu, Result},
};

pub struct Checkpoint {
    pub binlog_offset: u64,
    pub records: Vec<TrunkFullInfo>,
}

/// Load the checkpoint, `None` when no checkpoint has been written yet.
pub fn load(path: &Path) -> Result<Option<Checkpoint>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(IoSnafu { path }),
    };

    let mut lines = BufReader::new(file).lines();
    let offset_line = lines
        .next()
        .transpose()
        .context(IoSnafu { path })?
        .ok_or_else(|| InvalidCheckpointSnafu { path, line: 1u64 }.build())?;
    let binlog_offset = offset_line
        .trim()
        .parse::<u64>()
        .map_err(|_| InvalidCheckpointSnafu { path, line: 1u64 }.build())?;

    let mut records = Vec::new();
    let mut line_no = 1u64;
    for line in lines {
        let line = line.context(IoSnafu { path })?;
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let info = parse_record_line(&line)
            .ok_or_else(|| InvalidCheckpointSnafu { path, line: line_no }.build())?;
        records.push(info);
    }

    Ok(Some(Checkpoint {
        binlog_offset,
        records,
    }))
}

fn parse_record_line(line: &str) -> Option<TrunkFullInfo> {
    let col_count = line.split_ascii_whitespace().count();
    let mut cols = line.split_ascii_whitespace();
    match col_count {
        // timestamp and op_type prefix the info columns
        8 => {
            cols.next()?;
            cols.next()?;
            parse_info_columns(&mut cols)
        }
        6 => parse_info_columns(&mut cols),
        _ => None,
    }
}

/// Serialize `records` plus the covered binlog offset, fsync, then rename
/// over the previous checkpoint.
pub fn save<'a>(
    path: &Path,
    binlog_offset: u64,
    timestamp: i64,
    records: impl Iterator<Item = &'a TrunkFullInfo>,
) -> Result<()> {
    let temp_path = temp_path_for(path);
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .context(IoSnafu { path: &temp_path })?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", binlog_offset).context(IoSnafu { path: &temp_path })?;
        for info in records {
            let record = BinlogRecord {
                timestamp,
                op: BinlogOp::AddSpace,
                info: *info,
            };
            writer
                .write_all(record.format().as_bytes())
                .context(IoSnafu { path: &temp_path })?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .context(IoSnafu { path: &temp_path })?;
        file.sync_data().context(IoSnafu { path: &temp_path })?;
    }

    std::fs::rename(&temp_path, path).context(IoSnafu { path })
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    if let Some(file_name) = path.file_name() {
        name.push(file_name);
    }
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use trunkfs_types::{TrunkFileInfo, TrunkPathInfo};

    use super::*;

    fn info(id: u32, offset: u32, size: u32) -> TrunkFullInfo {
        TrunkFullInfo {
            path: TrunkPathInfo {
                store_path_index: 1,
                sub_path_high: 2,
                sub_path_low: 3,
            },
            file: TrunkFileInfo { id, offset, size },
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage_trunk.dat");

        let records = vec![info(1, 0, 1024), info(1, 4096, 512), info(2, 0, 65536)];
        save(&path, 12345, 1_700_000_000, records.iter()).unwrap();

        let checkpoint = load(&path).unwrap().unwrap();
        assert_eq!(checkpoint.binlog_offset, 12345);
        assert_eq!(checkpoint.records, records);
        // No temp file left behind.
        assert!(!dir.path().join(".storage_trunk.dat.tmp").exists());
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("storage_trunk.dat")).unwrap().is_none());
    }

    #[test]
    fn legacy_six_column_lines_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage_trunk.dat");
        std::fs::write(&path, "77\n1 2 3 9 128 256\n").unwrap();

        let checkpoint = load(&path).unwrap().unwrap();
        assert_eq!(checkpoint.binlog_offset, 77);
        assert_eq!(checkpoint.records, vec![info(9, 128, 256)]);
    }

    #[test]
    fn corrupt_lines_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage_trunk.dat");

        std::fs::write(&path, "not-an-offset\n").unwrap();
        assert!(load(&path).is_err());

        std::fs::write(&path, "0\n1 2 3\n").unwrap();
        assert!(load(&path).is_err());
    }
}
