use std::path::PathBuf;

use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("io on {}", path.display()))]
    Io {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },

    #[snafu(display("allocator is disabled, refusing trunk operations"))]
    AllocatorDisabled {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("can't find trunk entry: {}", info))]
    SpaceNotFound {
        info: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("trunk space already exists: {}", info))]
    DuplicateSpace {
        info: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("checkpoint file {} line {} is invalid", path.display(), line))]
    InvalidCheckpoint {
        path: PathBuf,
        line: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("id state file {} is invalid", path.display()))]
    InvalidIdState {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
        source: serde_json::Error,
    },

    #[snafu(display("waiting for trunk file {} ready timeout", path.display()))]
    WaitTrunkFileTimeout {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("no store path configured"))]
    NoStorePath {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("requested {} bytes exceeds the trunk file size", size))]
    SpaceTooLarge {
        size: u32,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateSpace { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::SpaceNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
