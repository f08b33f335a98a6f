use std::path::PathBuf;

use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("open file {}", path.display()))]
    OpenFile {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },

    #[snafu(display("seek file {}", path.display()))]
    SeekFile {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },

    #[snafu(display("read from file {}", path.display()))]
    ReadFile {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },

    #[snafu(display("write to file {}", path.display()))]
    WriteFile {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },

    #[snafu(display("truncate file {}", path.display()))]
    TruncateFile {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },

    #[snafu(display("delete file {}", path.display()))]
    DeleteFile {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },

    #[snafu(display(
        "trunk file {} offset {} already occupied by another file",
        path.display(),
        offset
    ))]
    SlotOccupied {
        path: PathBuf,
        offset: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("task carries no trunk info"))]
    MissingTrunkInfo {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("slot start {} leaves no room for the header", start))]
    InvalidSlotOffset {
        start: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("trunk maintenance failed"))]
    Trunk {
        #[snafu(implicit)]
        location: Location,
        source: trunkfs_storage::Error,
    },

    #[snafu(display("disk io engine is stopped"))]
    EngineStopped {
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    /// The OS error code to surface to the peer, when there is one.
    /// A slot-guard mismatch reports as `EEXIST`, so the allocator
    /// recycles space elsewhere instead of double-using the slot.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::OpenFile { source, .. }
            | Error::SeekFile { source, .. }
            | Error::ReadFile { source, .. }
            | Error::WriteFile { source, .. }
            | Error::TruncateFile { source, .. }
            | Error::DeleteFile { source, .. } => source.raw_os_error(),
            Error::SlotOccupied { .. } => Some(17), // EEXIST
            _ => None,
        }
    }

    pub fn is_occupied(&self) -> bool {
        matches!(self, Error::SlotOccupied { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
