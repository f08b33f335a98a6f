//! The operations a worker runs against one task. Each call handles at
//! most one buffer chunk and then reports Continue or Done through the
//! task's listener; large transfers are driven by re-invocation from the
//! network layer, so a slow peer never monopolizes a worker.

use std::io::{Seek, SeekFrom, Write};

use snafu::ResultExt;
use trunkfs_storage::trunk_file;
use trunkfs_types::{header::is_free_slot, TrunkHeader, TRUNK_HEADER_SIZE};

use crate::{
    context::{BeforeCloseHook, BeforeOpenHook, DioOpCode, DioTask, FileContext},
    err::{
        DeleteFileSnafu, Error, InvalidSlotOffsetSnafu, MissingTrunkInfoSnafu, ReadFileSnafu,
        Result, SeekFileSnafu, SlotOccupiedSnafu, TruncateFileSnafu, TrunkSnafu, WriteFileSnafu,
    },
    stats::DioStats,
};

pub(crate) fn execute(task: DioTask, stats: &DioStats) {
    match task.op {
        DioOpCode::Read => read_file(task, stats),
        DioOpCode::Write => write_file(task, stats),
        DioOpCode::Truncate => truncate_file(task, stats),
        DioOpCode::DeleteNormal => delete_normal_file(task),
        DioOpCode::DeleteTrunk => delete_trunk_file(task),
        DioOpCode::Discard => discard_file(task),
    }
}

fn continue_task(task: DioTask) {
    let listener = task.listener.clone();
    listener.on_continue(task);
}

fn done(task: DioTask, result: Result<()>) {
    let listener = task.listener.clone();
    listener.on_done(task, result);
}

fn fail(task: DioTask, err: Error) {
    task.listener.clone().on_error_log(&task, &err);
    done(task, Err(err));
}

fn read_file(mut task: DioTask, stats: &DioStats) {
    match read_step(&mut task, stats) {
        Ok(()) if task.ctx.offset < task.ctx.end => continue_task(task),
        Ok(()) => {
            task.ctx.finalize_digests();
            task.ctx.close_file();
            done(task, Ok(()));
        }
        Err(e) => {
            task.ctx.close_file();
            fail(task, e);
        }
    }
}

fn read_step(task: &mut DioTask, stats: &DioStats) -> Result<()> {
    let ctx = &mut task.ctx;
    let buffer = &mut task.buffer;

    ctx.ensure_open(stats)?;

    let remain = ctx.remaining() as usize;
    let capacity = buffer.capacity().saturating_sub(buffer.len());
    let chunk = remain.min(capacity);
    if chunk == 0 {
        return Ok(());
    }

    let old_len = buffer.len();
    buffer.resize(old_len + chunk, 0);
    ctx.read_chunk(&mut buffer[old_len..], stats)
}

fn write_file(mut task: DioTask, stats: &DioStats) {
    match write_step(&mut task, stats) {
        Ok(true) => {
            task.ctx.buff_offset = 0;
            task.buffer.clear();
            continue_task(task);
        }
        Ok(false) => done(task, Ok(())),
        Err(e) => {
            // A failed write must not leave partial content behind.
            task.ctx.clean_up();
            fail(task, e);
        }
    }
}

/// Returns true while more chunks are expected.
fn write_step(task: &mut DioTask, stats: &DioStats) -> Result<bool> {
    let ctx = &mut task.ctx;

    if !ctx.is_open() {
        before_open(ctx, stats)?;
        ctx.ensure_open(stats)?;
    }

    let data = task.buffer.get(ctx.buff_offset..).unwrap_or_default();
    ctx.write_chunk(data, stats)?;

    if ctx.offset < ctx.end {
        return Ok(true);
    }

    ctx.finalize_digests();
    before_close(ctx)?;
    ctx.close_file();
    Ok(false)
}

fn truncate_file(mut task: DioTask, stats: &DioStats) {
    match truncate_step(&mut task.ctx, stats) {
        Ok(()) => done(task, Ok(())),
        Err(e) => {
            task.ctx.clean_up();
            fail(task, e);
        }
    }
}

fn truncate_step(ctx: &mut FileContext, stats: &DioStats) -> Result<()> {
    if !ctx.is_open() {
        before_open(ctx, stats)?;
        ctx.ensure_open(stats)?;
    }

    let offset = ctx.offset;
    ctx.file_mut()
        .set_len(offset)
        .context(TruncateFileSnafu {
            path: &ctx.filename,
        })?;

    before_close(ctx)?;
    ctx.close_file();
    Ok(())
}

fn delete_normal_file(task: DioTask) {
    match std::fs::remove_file(&task.ctx.filename).context(DeleteFileSnafu {
        path: &task.ctx.filename,
    }) {
        Ok(()) => done(task, Ok(())),
        Err(e) => fail(task, e),
    }
}

/// Deleting a logical file inside a trunk only reclaims its slot; the
/// physical trunk file stays.
fn delete_trunk_file(task: DioTask) {
    let trunk_info = task.ctx.upload.as_ref().and_then(|u| u.trunk_info);
    let result = match trunk_info {
        Some(info) => {
            trunk_file::delete_slot(&task.ctx.filename, &info).context(TrunkSnafu)
        }
        None => MissingTrunkInfoSnafu.fail(),
    };
    match result {
        Ok(()) => done(task, Ok(())),
        Err(e) => fail(task, e),
    }
}

fn discard_file(mut task: DioTask) {
    task.ctx.offset += task.buffer.len().saturating_sub(task.ctx.buff_offset) as u64;
    if task.ctx.offset >= task.ctx.end {
        done(task, Ok(()));
    } else {
        task.ctx.buff_offset = 0;
        task.buffer.clear();
        continue_task(task);
    }
}

fn before_open(ctx: &mut FileContext, stats: &DioStats) -> Result<()> {
    match ctx.before_open {
        BeforeOpenHook::None => Ok(()),
        BeforeOpenHook::CheckTrunkFile => check_trunk_file(ctx, stats),
    }
}

fn before_close(ctx: &mut FileContext) -> Result<()> {
    match ctx.before_close {
        BeforeCloseHook::None => Ok(()),
        BeforeCloseHook::WriteTrunkHeader => write_trunk_header(ctx),
    }
}

/// Guard against the allocator and the disk disagreeing: the slot we are
/// about to write must still carry the free sentinel. A mismatch reports
/// Occupied (EEXIST) so the space is recycled elsewhere instead of
/// corrupting another file's bytes.
fn check_trunk_file(ctx: &mut FileContext, stats: &DioStats) -> Result<()> {
    let trunk_file_size = ctx
        .upload
        .as_ref()
        .map(|u| u.trunk_file_size)
        .unwrap_or_default();
    if trunk_file_size > 0 {
        trunk_file::check_and_init_file(&ctx.filename, trunk_file_size).context(TrunkSnafu)?;
    }

    ctx.ensure_open(stats)?;
    let header_offset = ctx
        .start
        .checked_sub(TRUNK_HEADER_SIZE as u64)
        .ok_or_else(|| InvalidSlotOffsetSnafu { start: ctx.start }.build())?;
    let filename = ctx.filename.clone();
    let file = ctx.file_mut();
    file.seek(SeekFrom::Current(-(TRUNK_HEADER_SIZE as i64)))
        .context(SeekFileSnafu { path: &filename })?;

    let mut buff = [0u8; TRUNK_HEADER_SIZE];
    std::io::Read::read_exact(file, &mut buff).context(ReadFileSnafu { path: &filename })?;

    if !is_free_slot(&buff) {
        return SlotOccupiedSnafu {
            path: filename,
            offset: header_offset,
        }
        .fail();
    }
    Ok(())
}

/// Stamp the slot header in front of the payload just written.
fn write_trunk_header(ctx: &mut FileContext) -> Result<()> {
    let Some(upload) = ctx.upload.as_ref() else {
        return Ok(());
    };
    let Some(trunk_info) = upload.trunk_info else {
        return Ok(());
    };

    let mut header = TrunkHeader {
        file_type: upload.file_type,
        alloc_size: trunk_info.file.size,
        file_size: (ctx.end - ctx.start) as u32,
        crc32: ctx.crc32.unwrap_or_default(),
        mtime: upload.start_time,
        ..Default::default()
    };
    header.set_ext_name(&upload.ext_name);

    let header_offset = ctx
        .start
        .checked_sub(TRUNK_HEADER_SIZE as u64)
        .ok_or_else(|| InvalidSlotOffsetSnafu { start: ctx.start }.build())?;
    let filename = ctx.filename.clone();
    let file = ctx.file_mut();
    file.seek(SeekFrom::Start(header_offset))
        .context(SeekFileSnafu { path: &filename })?;
    file.write_all(&header.pack())
        .context(WriteFileSnafu { path: &filename })?;
    Ok(())
}
