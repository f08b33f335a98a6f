//! Physical trunk file maintenance: pre-sizing new trunk files and
//! reclaiming individual slots. A slot delete never touches the rest of
//! the file; it rewrites the slot's header as unoccupied and zero-fills
//! the payload so stale content can't leak into the next tenant.

use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    path::Path,
    time::{Duration, Instant},
};

use lazy_static::lazy_static;
use snafu::ResultExt;
use tracing::debug;
use trunkfs_types::{TrunkFullInfo, TrunkHeader, TRUNK_HEADER_SIZE};

use crate::err::{IoSnafu, Result, WaitTrunkFileTimeoutSnafu};

const ZERO_BUFF_SIZE: usize = 64 * 1024;
const WAIT_READY_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_READY_POLL: Duration = Duration::from_millis(5);

lazy_static! {
    static ref ZERO_BUFF: Vec<u8> = vec![0u8; ZERO_BUFF_SIZE];
}

/// Create a trunk file and pre-size it. Creation is exclusive: losing the
/// race to a concurrent creator degrades to waiting for the winner to
/// finish sizing the file.
pub fn init_file(path: &Path, file_size: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
    }

    let file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!("waiting for trunk file {} ready ...", path.display());
            return wait_file_ready(path, file_size);
        }
        Err(e) => return Err(e).context(IoSnafu { path }),
    };

    file.set_len(file_size).context(IoSnafu { path })
}

/// Make sure the trunk file exists with its full size, creating or
/// re-sizing it as needed.
pub fn check_and_init_file(path: &Path, file_size: u64) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() >= file_size => Ok(()),
        Ok(meta) => {
            debug!(
                "trunk file {} size {} < {}, resizing",
                path.display(),
                meta.len(),
                file_size
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .context(IoSnafu { path })?;
            file.set_len(file_size).context(IoSnafu { path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => init_file(path, file_size),
        Err(e) => Err(e).context(IoSnafu { path }),
    }
}

fn wait_file_ready(path: &Path, file_size: u64) -> Result<()> {
    let deadline = Instant::now() + WAIT_READY_TIMEOUT;
    loop {
        let meta = std::fs::metadata(path).context(IoSnafu { path })?;
        if meta.len() >= file_size {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return WaitTrunkFileTimeoutSnafu { path }.fail();
        }
        std::thread::sleep(WAIT_READY_POLL);
    }
}

/// Reclaim a slot: mark its header unoccupied (keeping `alloc_size`) and
/// zero-fill the payload bytes.
pub fn delete_slot(path: &Path, info: &TrunkFullInfo) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .context(IoSnafu { path })?;
    file.seek(SeekFrom::Start(info.file.offset as u64))
        .context(IoSnafu { path })?;

    let header = TrunkHeader {
        alloc_size: info.file.size,
        ..Default::default()
    };
    file.write_all(&header.pack()).context(IoSnafu { path })?;

    let mut remain = (info.file.size as usize).saturating_sub(TRUNK_HEADER_SIZE);
    while remain > 0 {
        let chunk = remain.min(ZERO_BUFF.len());
        file.write_all(&ZERO_BUFF[..chunk]).context(IoSnafu { path })?;
        remain -= chunk;
    }
    Ok(())
}
