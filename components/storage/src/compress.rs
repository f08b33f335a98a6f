//! Binlog compaction pipeline. Compaction rewrites the binlog as
//! "checkpoint snapshot + deltas since" through four externally visible
//! stages; the current stage is persisted before each step so a crash at
//! any point leaves enough on disk to roll back deterministically.
//!
//! ```text
//! None/Success -> Begin -> ApplyDone -> SaveDone
//!     -> CommitMerging -> CommitMergeDone -> Success
//!  or -> RollbackMerging -> RollbackMergeDone -> None
//! ```
//!
//! Any stage other than `None`/`Success` found at startup triggers a
//! rollback before the allocator accepts work.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tracing::warn;

use crate::err::{IoSnafu, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressStage {
    /// No compaction has run, or the last one rolled back cleanly.
    #[default]
    None,
    Begin,
    /// Binlog rotated aside; fresh binlog receiving new records.
    ApplyDone,
    /// Checkpoint of the in-memory state written.
    SaveDone,
    CommitMerging,
    CommitMergeDone,
    /// Terminal: compaction fully committed.
    Success,
    RollbackMerging,
    RollbackMergeDone,
}

impl CompressStage {
    /// Stages that need no recovery at startup.
    pub fn is_terminal(self) -> bool {
        matches!(self, CompressStage::None | CompressStage::Success)
    }

    fn as_str(self) -> &'static str {
        match self {
            CompressStage::None => "none",
            CompressStage::Begin => "begin",
            CompressStage::ApplyDone => "apply_done",
            CompressStage::SaveDone => "save_done",
            CompressStage::CommitMerging => "commit_merging",
            CompressStage::CommitMergeDone => "commit_merge_done",
            CompressStage::Success => "success",
            CompressStage::RollbackMerging => "rollback_merging",
            CompressStage::RollbackMergeDone => "rollback_merge_done",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "none" => CompressStage::None,
            "begin" => CompressStage::Begin,
            "apply_done" => CompressStage::ApplyDone,
            "save_done" => CompressStage::SaveDone,
            "commit_merging" => CompressStage::CommitMerging,
            "commit_merge_done" => CompressStage::CommitMergeDone,
            "success" => CompressStage::Success,
            "rollback_merging" => CompressStage::RollbackMerging,
            "rollback_merge_done" => CompressStage::RollbackMergeDone,
            _ => return None,
        })
    }
}

/// The persisted pipeline stage. Every transition is one
/// write-temp-then-rename, so the file always holds exactly one valid
/// stage.
pub struct StageFile {
    path: PathBuf,
}

impl StageFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<CompressStage> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CompressStage::None);
            }
            Err(e) => return Err(e).context(IoSnafu { path: &self.path }),
        };
        match CompressStage::parse(content.trim()) {
            Some(stage) => Ok(stage),
            None => {
                warn!(
                    "unrecognized compress stage {:?} in {}, treating as in-progress",
                    content.trim(),
                    self.path.display()
                );
                Ok(CompressStage::Begin)
            }
        }
    }

    pub fn store(&self, stage: CompressStage) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&temp_path).context(IoSnafu { path: &temp_path })?;
            file.write_all(stage.as_str().as_bytes())
                .context(IoSnafu { path: &temp_path })?;
            file.sync_data().context(IoSnafu { path: &temp_path })?;
        }
        std::fs::rename(&temp_path, &self.path).context(IoSnafu { path: &self.path })
    }
}

/// Concatenate `first` (when present) and `second` (when present) into
/// `dest` via a temp file + fsync + atomic rename. With
/// `skip_first_line_of_first` the first input's leading line is dropped,
/// which strips a checkpoint's offset header when merging its records
/// into a binlog.
pub(crate) fn merge_files(
    first: Option<&Path>,
    skip_first_line_of_first: bool,
    second: Option<&Path>,
    dest: &Path,
) -> Result<()> {
    let temp_path = dest.with_extension("merge-tmp");
    {
        let mut out = File::create(&temp_path).context(IoSnafu { path: &temp_path })?;
        let mut skip_first_line = skip_first_line_of_first;
        for src in [first, second].into_iter().flatten() {
            match File::open(src) {
                Ok(file) => {
                    let mut reader = std::io::BufReader::new(file);
                    if skip_first_line {
                        let mut header = String::new();
                        std::io::BufRead::read_line(&mut reader, &mut header)
                            .context(IoSnafu { path: src })?;
                    }
                    std::io::copy(&mut reader, &mut out).context(IoSnafu { path: src })?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context(IoSnafu { path: src }),
            }
            skip_first_line = false;
        }
        out.sync_data().context(IoSnafu { path: &temp_path })?;
    }
    std::fs::rename(&temp_path, dest).context(IoSnafu { path: dest })
}

/// Undo a partially applied compaction from its on-disk artifacts alone:
/// fold the rotated-aside binlog back in front of whatever the current
/// binlog holds, and drop a checkpoint whose offset may describe a binlog
/// that no longer exists. Ends at stage `None`.
pub(crate) fn rollback_binlog_files(
    binlog_path: &Path,
    rollback_path: &Path,
    checkpoint_path: &Path,
    stage_file: &StageFile,
) -> Result<()> {
    stage_file.store(CompressStage::RollbackMerging)?;
    if rollback_path.exists() {
        merge_files(Some(rollback_path), false, Some(binlog_path), binlog_path)?;
    }
    stage_file.store(CompressStage::RollbackMergeDone)?;

    for stale in [rollback_path, checkpoint_path] {
        if let Err(e) = std::fs::remove_file(stale) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("unlink {} fail: {}", stale.display(), e);
            }
        }
    }
    stage_file.store(CompressStage::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let stage_file = StageFile::new(dir.path().join("compress_stage"));

        assert_eq!(stage_file.load().unwrap(), CompressStage::None);

        for stage in [
            CompressStage::Begin,
            CompressStage::ApplyDone,
            CompressStage::SaveDone,
            CompressStage::CommitMerging,
            CompressStage::CommitMergeDone,
            CompressStage::Success,
            CompressStage::RollbackMerging,
            CompressStage::RollbackMergeDone,
            CompressStage::None,
        ] {
            stage_file.store(stage).unwrap();
            assert_eq!(stage_file.load().unwrap(), stage);
        }
    }

    #[test]
    fn unknown_stage_reads_as_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compress_stage");
        std::fs::write(&path, "who-knows").unwrap();
        let stage = StageFile::new(&path).load().unwrap();
        assert!(!stage.is_terminal());
    }

    #[test]
    fn merge_files_concatenates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let dest = dir.path().join("dest");
        std::fs::write(&a, "first\n").unwrap();
        std::fs::write(&b, "second\n").unwrap();

        merge_files(Some(&a), false, Some(&b), &dest).unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "first\nsecond\n");

        // Missing inputs are simply skipped.
        merge_files(Some(&dir.path().join("nope")), false, Some(&b), &dest).unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "second\n");
    }

    #[test]
    fn merge_can_strip_a_header_line() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let dest = dir.path().join("dest");
        std::fs::write(&a, "offset-header\nrecord-1\n").unwrap();
        std::fs::write(&b, "record-2\n").unwrap();

        merge_files(Some(&a), true, Some(&b), &dest).unwrap();
        assert_eq!(
            std::fs::read_to_string(&dest).unwrap(),
            "record-1\nrecord-2\n"
        );
    }
}
