//! The trunk allocator: a per-store-path, size-indexed free-space index
//! with binlog-backed persistence. Allocation carves slots out of large
//! pre-sized trunk files, splitting remainders back into the index;
//! every mutation appends an ADD_SPACE/DEL_SPACE record so the index is
//! reconstructible after a crash.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use tracing::{debug, error, info, warn};
use trunkfs_common::{
    StorePathIndex, STORE_DATA_DIR, TRUNK_BINLOG_FILENAME, TRUNK_BINLOG_ROLLBACK_EXT,
    TRUNK_CHECKPOINT_FILENAME, TRUNK_COMPRESS_STAGE_FILENAME, TRUNK_DIR, TRUNK_STATE_FILENAME,
};
use trunkfs_types::{
    trunk::{sub_path_for, TrunkPathInfo},
    TrunkFileInfo, TrunkFullInfo, TrunkStatus,
};
use trunkfs_utils::align::align_up;

use crate::{
    arena::{NodeArena, NodeRef, TrunkNode},
    binlog::{binlog_size, BinlogOp, BinlogReader, BinlogRecord, BinlogWriter},
    checkpoint,
    compress::{merge_files, rollback_binlog_files, CompressStage, StageFile},
    config::TrunkConfig,
    err::{
        AllocatorDisabledSnafu, DuplicateSpaceSnafu, InvalidIdStateSnafu, IoSnafu,
        NoStorePathSnafu, Result, SpaceNotFoundSnafu, SpaceTooLargeSnafu,
    },
    occupancy::{InsertCheck, OccupancyIndex},
    trunk_file,
};

/// Store-path selection policy. The allocator consults it only when it
/// has to create a trunk file without a caller-chosen store path; the
/// policy itself (round robin, most-free-space, tracker-driven) is
/// external.
pub trait StorePathSelector: Send + Sync {
    fn select_store_path(&self) -> Option<StorePathIndex>;
}

/// Simple rotating selector, enough for tests and single-policy setups.
pub struct RoundRobinSelector {
    count: usize,
    next: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            next: AtomicUsize::new(0),
        }
    }
}

impl StorePathSelector for RoundRobinSelector {
    fn select_store_path(&self) -> Option<StorePathIndex> {
        if self.count == 0 {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Some((n % self.count) as StorePathIndex)
    }
}

/// Outcome the disk layer reports back for a reserved slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocConfirmStatus {
    /// The write went through; the reservation is consumed for good.
    Ok,
    /// The slot turned out to be occupied on disk; drop the reservation
    /// so the space is never handed out twice.
    Occupied,
    /// The write failed; put the reservation back into the free index.
    Failed,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedCounters {
    current_trunk_file_id: u32,
    last_compress_time: i64,
    binlog_size_at_last_compress: u64,
}

struct AllocatorState {
    /// Per store path: slot size -> nodes of exactly that size.
    by_size: Vec<BTreeMap<u32, Vec<NodeRef>>>,
    arena: NodeArena,
    occupancy: OccupancyIndex,
    binlog: BinlogWriter,
}

pub struct TrunkAllocator {
    config: TrunkConfig,
    selector: Box<dyn StorePathSelector>,

    state: Mutex<AllocatorState>,

    binlog_path: PathBuf,
    rollback_path: PathBuf,
    checkpoint_path: PathBuf,
    counters_path: PathBuf,
    stage_file: StageFile,

    /// FREE plus HOLD bytes across all store paths.
    total_free_space: AtomicI64,
    current_trunk_file_id: AtomicU32,
    /// Free-index inserts rejected as duplicate/overlapping.
    duplicate_inserts: AtomicU64,
    disabled: AtomicBool,
    last_compress_time: AtomicI64,
    binlog_size_at_last_compress: AtomicU64,
}

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl TrunkAllocator {
    pub fn open(config: TrunkConfig, selector: Box<dyn StorePathSelector>) -> Result<Self> {
        ensure!(!config.store_paths.is_empty(), NoStorePathSnafu);

        let trunk_dir = config.base_path.join(STORE_DATA_DIR).join(TRUNK_DIR);
        std::fs::create_dir_all(&trunk_dir).context(IoSnafu { path: &trunk_dir })?;

        let binlog_path = trunk_dir.join(TRUNK_BINLOG_FILENAME);
        let rollback_path =
            trunk_dir.join(format!("{}.{}", TRUNK_BINLOG_FILENAME, TRUNK_BINLOG_ROLLBACK_EXT));
        let checkpoint_path = config
            .base_path
            .join(STORE_DATA_DIR)
            .join(TRUNK_CHECKPOINT_FILENAME);
        let counters_path = trunk_dir.join(TRUNK_STATE_FILENAME);
        let stage_file = StageFile::new(trunk_dir.join(TRUNK_COMPRESS_STAGE_FILENAME));

        // A compaction that died mid-pipeline must be undone before the
        // binlog is replayed.
        let stage = stage_file.load()?;
        if !stage.is_terminal() {
            warn!(
                "found unfinished binlog compaction (stage {:?}), rolling back",
                stage
            );
            rollback_binlog_files(&binlog_path, &rollback_path, &checkpoint_path, &stage_file)?;
        }

        let counters = Self::load_counters(&counters_path)?;
        let binlog = BinlogWriter::open(&binlog_path)?;

        let store_path_count = config.store_paths.len();
        let allocator = Self {
            config,
            selector,
            state: Mutex::new(AllocatorState {
                by_size: (0..store_path_count).map(|_| BTreeMap::new()).collect(),
                arena: NodeArena::default(),
                occupancy: OccupancyIndex::default(),
                binlog,
            }),
            binlog_path,
            rollback_path,
            checkpoint_path,
            counters_path,
            stage_file,
            total_free_space: AtomicI64::new(0),
            current_trunk_file_id: AtomicU32::new(counters.current_trunk_file_id),
            duplicate_inserts: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
            last_compress_time: AtomicI64::new(counters.last_compress_time),
            binlog_size_at_last_compress: AtomicU64::new(counters.binlog_size_at_last_compress),
        };

        allocator.load()?;

        info!(
            "trunk allocator ready: {} free blocks, {} free bytes, current trunk file id {}",
            allocator.free_node_count(),
            allocator.total_free_space(),
            allocator.current_trunk_file_id.load(Ordering::Relaxed),
        );
        Ok(allocator)
    }

    /// Reserve `size` bytes on `store_path_index`. The returned range is
    /// exclusively held until `alloc_confirm` settles it.
    pub fn alloc_space(&self, store_path_index: StorePathIndex, size: u32) -> Result<TrunkFullInfo> {
        self.ensure_enabled()?;
        ensure!(
            (store_path_index as usize) < self.config.store_paths.len(),
            NoStorePathSnafu
        );

        let target = (align_up(size as u64, self.config.alignment_size.as_bytes()) as u32)
            .max(self.config.slot_min());
        ensure!(
            target <= self.config.trunk_file_bytes(),
            SpaceTooLargeSnafu { size: target }
        );

        let mut state = self.lock_state();
        let node_ref = match self.find_free_ge(&state, store_path_index, target) {
            Some(node_ref) => {
                self.unlink(&mut state, node_ref);
                node_ref
            }
            None => self.create_trunk_file(&mut state, store_path_index)?,
        };

        self.split(&mut state, node_ref, target)?;

        if let Some(node) = state.arena.get_mut(node_ref) {
            node.status = TrunkStatus::Hold;
        }
        let info = self.node_info(&state, node_ref);
        self.link(&mut state, node_ref)?;
        self.log_space_change(&mut state, BinlogOp::AddSpace, &info)?;
        Ok(info)
    }

    /// Settle a reservation according to how the disk write went.
    pub fn alloc_confirm(&self, info: &TrunkFullInfo, status: AllocConfirmStatus) -> Result<()> {
        self.ensure_enabled()?;
        let mut state = self.lock_state();
        match status {
            AllocConfirmStatus::Ok => {
                self.delete_space(&mut state, info, TrunkStatus::Hold, true)
            }
            AllocConfirmStatus::Occupied => {
                warn!(
                    "trunk space already occupied on disk, dropping reservation: {}",
                    info
                );
                self.delete_space(&mut state, info, TrunkStatus::Hold, true)
            }
            AllocConfirmStatus::Failed => self.restore_node(&mut state, info),
        }
    }

    /// Return a range to the free index. Sizes below the minimum slot are
    /// not worth tracking and are dropped.
    pub fn free_space(&self, info: &TrunkFullInfo, write_binlog: bool) -> Result<()> {
        self.ensure_enabled()?;
        let mut state = self.lock_state();
        self.insert_free(&mut state, *info, write_binlog, false)
    }

    /// Whether a file of `file_size` bytes is eligible for trunk storage.
    pub fn check_size(&self, file_size: u64) -> bool {
        file_size <= self.config.slot_max() as u64
    }

    /// Top the pool up to the configured pre-create threshold with fresh
    /// trunk files, store paths chosen by the external policy.
    pub fn create_trunk_files_in_advance(&self) -> Result<usize> {
        self.ensure_enabled()?;
        let threshold = self.config.pre_create_space_threshold.as_bytes() as i64;
        if threshold == 0 {
            return Ok(0);
        }
        let deficit = threshold - self.total_free_space();
        if deficit <= 0 {
            debug!("no need to create trunk files in advance");
            return Ok(0);
        }

        let file_count = deficit as u64 / self.config.trunk_file_size.as_bytes();
        let mut created = 0;
        for _ in 0..file_count {
            let store_path_index = self
                .selector
                .select_store_path()
                .ok_or_else(|| NoStorePathSnafu.build())?;
            let mut state = self.lock_state();
            let node_ref = self.create_trunk_file(&mut state, store_path_index)?;
            // The create already binlogged the ADD; just index the node.
            self.link(&mut state, node_ref)?;
            created += 1;
        }
        debug!("created {} trunk files in advance", created);
        Ok(created)
    }

    /// Checkpoint the free-space index, compacting the binlog first when
    /// it is due.
    pub fn save(&self) -> Result<()> {
        let interval = self.config.compress_binlog_min_interval.as_secs() as i64;
        let binlog_len = self.lock_state().binlog.offset();
        let due = interval > 0
            && now_ts() - self.last_compress_time.load(Ordering::Relaxed) > interval
            && binlog_len > self.binlog_size_at_last_compress.load(Ordering::Relaxed);
        if !due {
            return self.do_save();
        }
        self.compress_binlog()
    }

    /// Run the binlog compaction pipeline immediately.
    pub fn compress_binlog(&self) -> Result<()> {
        self.ensure_enabled()?;
        info!("start compress trunk binlog ...");
        match self.run_compress_pipeline() {
            Ok(()) => {
                self.last_compress_time.store(now_ts(), Ordering::Relaxed);
                let len = self.lock_state().binlog.offset();
                self.binlog_size_at_last_compress
                    .store(len, Ordering::Relaxed);
                self.persist_counters()?;
                info!("compress trunk binlog done");
                Ok(())
            }
            Err(e) => {
                warn!("compress trunk binlog failed: {}, rolling back", e);
                if let Err(rollback_err) = self.runtime_rollback() {
                    error!(
                        "binlog compaction rollback failed: {}, disabling trunk allocator",
                        rollback_err
                    );
                    self.disabled.store(true, Ordering::SeqCst);
                    return Err(rollback_err);
                }
                Err(e)
            }
        }
    }

    pub fn total_free_space(&self) -> i64 {
        self.total_free_space.load(Ordering::Relaxed)
    }

    /// Free-index inserts that were rejected as duplicate or overlapping.
    pub fn duplicate_inserts(&self) -> u64 {
        self.duplicate_inserts.load(Ordering::Relaxed)
    }

    pub fn free_node_count(&self) -> usize {
        self.lock_state().arena.len()
    }

    pub fn current_trunk_file_id(&self) -> u32 {
        self.current_trunk_file_id.load(Ordering::Relaxed)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &TrunkConfig {
        &self.config
    }

    /// Absolute path of the trunk file a range lives in.
    pub fn trunk_full_filename(&self, info: &TrunkFullInfo) -> Option<PathBuf> {
        self.config
            .store_paths
            .get(info.path.store_path_index as usize)
            .map(|root| root.join(info.rel_path()))
    }

    // ---- internals -------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, AllocatorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        ensure!(!self.disabled.load(Ordering::Relaxed), AllocatorDisabledSnafu);
        Ok(())
    }

    fn node_info(&self, state: &AllocatorState, node_ref: NodeRef) -> TrunkFullInfo {
        state
            .arena
            .get(node_ref)
            .map(|node| node.info)
            .unwrap_or_default()
    }

    /// Append a binlog record and keep the free-space counter in step.
    fn log_space_change(
        &self,
        state: &mut AllocatorState,
        op: BinlogOp,
        info: &TrunkFullInfo,
    ) -> Result<()> {
        match op {
            BinlogOp::AddSpace => {
                self.total_free_space
                    .fetch_add(info.file.size as i64, Ordering::Relaxed);
            }
            BinlogOp::DelSpace => {
                self.total_free_space
                    .fetch_sub(info.file.size as i64, Ordering::Relaxed);
            }
        }
        state.binlog.write(&BinlogRecord {
            timestamp: now_ts(),
            op,
            info: *info,
        })
    }

    /// Smallest bucket >= `target` that still holds a FREE node.
    fn find_free_ge(
        &self,
        state: &AllocatorState,
        store_path_index: StorePathIndex,
        target: u32,
    ) -> Option<NodeRef> {
        let by_size = &state.by_size[store_path_index as usize];
        for (_, bucket) in by_size.range(target..) {
            let free = bucket.iter().copied().find(|r| {
                state
                    .arena
                    .get(*r)
                    .map_or(false, |node| node.status == TrunkStatus::Free)
            });
            if free.is_some() {
                return free;
            }
        }
        None
    }

    /// Put an arena node into the size and occupancy indexes.
    fn link(&self, state: &mut AllocatorState, node_ref: NodeRef) -> Result<()> {
        let info = self.node_info(state, node_ref);
        let path_index = info.path.store_path_index as usize;
        ensure!(path_index < state.by_size.len(), NoStorePathSnafu);
        match state.occupancy.check(&info) {
            InsertCheck::Ok => {
                state.occupancy.insert(info);
                state.by_size[path_index]
                    .entry(info.file.size)
                    .or_default()
                    .push(node_ref);
                Ok(())
            }
            InsertCheck::Duplicate => {
                self.duplicate_inserts.fetch_add(1, Ordering::Relaxed);
                warn!("trunk space already tracked: {}", info);
                DuplicateSpaceSnafu {
                    info: info.to_string(),
                }
                .fail()
            }
            InsertCheck::Overlap(other) => {
                self.duplicate_inserts.fetch_add(1, Ordering::Relaxed);
                warn!("trunk space {} overlaps tracked space {}", info, other);
                DuplicateSpaceSnafu {
                    info: info.to_string(),
                }
                .fail()
            }
        }
    }

    /// Take an arena node out of the size and occupancy indexes; the
    /// arena slot itself stays live.
    fn unlink(&self, state: &mut AllocatorState, node_ref: NodeRef) {
        let info = self.node_info(state, node_ref);
        if let Some(by_size) = state.by_size.get_mut(info.path.store_path_index as usize) {
            if let Some(bucket) = by_size.get_mut(&info.file.size) {
                if let Some(pos) = bucket.iter().position(|r| *r == node_ref) {
                    bucket.remove(pos);
                }
                if bucket.is_empty() {
                    by_size.remove(&info.file.size);
                }
            }
        }
        state.occupancy.remove(&info);
    }

    /// Create a FREE node for `info` and index it. `write_binlog` false
    /// still keeps the counter in step (checkpoint/recovery paths).
    fn insert_free(
        &self,
        state: &mut AllocatorState,
        info: TrunkFullInfo,
        write_binlog: bool,
        tolerate_duplicate: bool,
    ) -> Result<()> {
        if info.file.size < self.config.slot_min() {
            debug!("space {} too small, not worth tracking", info.file.size);
            return Ok(());
        }

        let node_ref = state.arena.insert(TrunkNode {
            info,
            status: TrunkStatus::Free,
        });
        if let Err(e) = self.link(state, node_ref) {
            state.arena.remove(node_ref);
            return if tolerate_duplicate { Ok(()) } else { Err(e) };
        }

        if write_binlog {
            self.log_space_change(state, BinlogOp::AddSpace, &info)
        } else {
            self.total_free_space
                .fetch_add(info.file.size as i64, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Remove the node matching `info` with the expected status.
    fn delete_space(
        &self,
        state: &mut AllocatorState,
        info: &TrunkFullInfo,
        expected_status: TrunkStatus,
        write_binlog: bool,
    ) -> Result<()> {
        let node_ref = self.find_node(state, info, expected_status).ok_or_else(|| {
            SpaceNotFoundSnafu {
                info: info.to_string(),
            }
            .build()
        })?;

        self.unlink(state, node_ref);
        state.arena.remove(node_ref);

        if write_binlog {
            self.log_space_change(state, BinlogOp::DelSpace, info)
        } else {
            self.total_free_space
                .fetch_sub(info.file.size as i64, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Flip a held reservation back to FREE after a failed disk write.
    fn restore_node(&self, state: &mut AllocatorState, info: &TrunkFullInfo) -> Result<()> {
        let node_ref = self
            .find_node(state, info, TrunkStatus::Hold)
            .ok_or_else(|| {
                SpaceNotFoundSnafu {
                    info: info.to_string(),
                }
                .build()
            })?;
        if let Some(node) = state.arena.get_mut(node_ref) {
            node.status = TrunkStatus::Free;
        }
        Ok(())
    }

    fn find_node(
        &self,
        state: &AllocatorState,
        info: &TrunkFullInfo,
        status: TrunkStatus,
    ) -> Option<NodeRef> {
        let bucket = state
            .by_size
            .get(info.path.store_path_index as usize)?
            .get(&info.file.size)?;
        bucket.iter().copied().find(|r| {
            state
                .arena
                .get(*r)
                .map_or(false, |node| node.info == *info && node.status == status)
        })
    }

    /// Carve `size` bytes off the front of the node, returning the rest
    /// to the free index. A remainder below the minimum slot is not worth
    /// tracking; the caller keeps the whole node.
    fn split(&self, state: &mut AllocatorState, node_ref: NodeRef, size: u32) -> Result<()> {
        let info = self.node_info(state, node_ref);
        self.log_space_change(state, BinlogOp::DelSpace, &info)?;

        if info.file.size - size < self.config.slot_min() {
            return Ok(());
        }

        let remainder = TrunkFullInfo {
            path: info.path,
            file: TrunkFileInfo {
                id: info.file.id,
                offset: info.file.offset + size,
                size: info.file.size - size,
            },
        };
        self.insert_free(state, remainder, true, false)?;

        if let Some(node) = state.arena.get_mut(node_ref) {
            node.info.file.size = size;
        }
        Ok(())
    }

    /// Create and pre-size the next trunk file. The incremented file id
    /// is persisted before the file is touched, so a crash can skip an id
    /// but never reuse one.
    fn create_trunk_file(
        &self,
        state: &mut AllocatorState,
        store_path_index: StorePathIndex,
    ) -> Result<NodeRef> {
        let (info, path) = loop {
            let id = self.current_trunk_file_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.persist_counters()?;

            let (sub_path_high, sub_path_low) = sub_path_for(id, self.config.subdir_count);
            let info = TrunkFullInfo {
                path: TrunkPathInfo {
                    store_path_index,
                    sub_path_high,
                    sub_path_low,
                },
                file: TrunkFileInfo {
                    id,
                    offset: 0,
                    size: self.config.trunk_file_bytes(),
                },
            };
            let path = self
                .trunk_full_filename(&info)
                .ok_or_else(|| NoStorePathSnafu.build())?;
            if !path.exists() {
                break (info, path);
            }
        };

        trunk_file::init_file(&path, self.config.trunk_file_size.as_bytes())?;
        self.log_space_change(state, BinlogOp::AddSpace, &info)?;
        Ok(state.arena.insert(TrunkNode {
            info,
            status: TrunkStatus::Free,
        }))
    }

    // ---- persistence -----------------------------------------------------

    fn load_counters(path: &Path) -> Result<PersistedCounters> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).context(InvalidIdStateSnafu { path }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedCounters::default()),
            Err(e) => Err(e).context(IoSnafu { path }),
        }
    }

    fn persist_counters(&self) -> Result<()> {
        let counters = PersistedCounters {
            current_trunk_file_id: self.current_trunk_file_id.load(Ordering::SeqCst),
            last_compress_time: self.last_compress_time.load(Ordering::Relaxed),
            binlog_size_at_last_compress: self.binlog_size_at_last_compress.load(Ordering::Relaxed),
        };
        let temp_path = self.counters_path.with_extension("tmp");
        let json = serde_json::to_vec(&counters).context(InvalidIdStateSnafu {
            path: &self.counters_path,
        })?;
        std::fs::write(&temp_path, json).context(IoSnafu { path: &temp_path })?;
        std::fs::rename(&temp_path, &self.counters_path).context(IoSnafu {
            path: &self.counters_path,
        })
    }

    /// Plain checkpoint: serialize every indexed node plus the covered
    /// binlog offset, then rename into place.
    fn do_save(&self) -> Result<()> {
        let mut state = self.lock_state();
        if self.config.merge_free_space_on_save {
            self.merge_free_ranges(&mut state);
        }
        state.binlog.sync()?;

        let records: Vec<TrunkFullInfo> = state
            .by_size
            .iter()
            .flat_map(|by_size| by_size.values())
            .flat_map(|bucket| bucket.iter())
            .filter_map(|r| state.arena.get(*r).map(|node| node.info))
            .collect();
        checkpoint::save(
            &self.checkpoint_path,
            state.binlog.offset(),
            now_ts(),
            records.iter(),
        )
    }

    /// Coalesce adjacent FREE ranges per trunk file; a trunk file that
    /// becomes entirely free is unlinked and its bytes leave the pool.
    fn merge_free_ranges(&self, state: &mut AllocatorState) {
        let mut by_file: BTreeMap<(StorePathIndex, u32), Vec<(NodeRef, TrunkFullInfo)>> =
            BTreeMap::new();
        for by_size in &state.by_size {
            for bucket in by_size.values() {
                for r in bucket {
                    if let Some(node) = state.arena.get(*r) {
                        if node.status == TrunkStatus::Free {
                            by_file
                                .entry(node.info.file_key())
                                .or_default()
                                .push((*r, node.info));
                        }
                    }
                }
            }
        }

        for (_, mut nodes) in by_file {
            nodes.sort_by_key(|(_, info)| info.file.offset);

            let mut run: Vec<(NodeRef, TrunkFullInfo)> = Vec::new();
            let mut runs: Vec<Vec<(NodeRef, TrunkFullInfo)>> = Vec::new();
            for (r, info) in nodes {
                match run.last() {
                    Some((_, prev)) if prev.end() == info.file.offset => run.push((r, info)),
                    _ => {
                        if run.len() > 1 {
                            runs.push(std::mem::take(&mut run));
                        } else {
                            run.clear();
                        }
                        run.push((r, info));
                    }
                }
            }
            if run.len() > 1 {
                runs.push(run);
            }

            for run in runs {
                let first = run[0].1;
                let merged = TrunkFullInfo {
                    path: first.path,
                    file: TrunkFileInfo {
                        id: first.file.id,
                        offset: first.file.offset,
                        size: run.iter().map(|(_, info)| info.file.size).sum(),
                    },
                };
                for (r, _) in &run {
                    self.unlink(state, *r);
                    state.arena.remove(*r);
                }

                let whole_file = merged.file.offset == 0
                    && merged.file.size == self.config.trunk_file_bytes();
                if whole_file {
                    if let Some(path) = self.trunk_full_filename(&merged) {
                        match std::fs::remove_file(&path) {
                            Ok(()) => {
                                debug!("unlinked all-free trunk file {}", path.display());
                                self.total_free_space
                                    .fetch_sub(merged.file.size as i64, Ordering::Relaxed);
                                continue;
                            }
                            Err(e) => {
                                warn!(
                                    "unlink all-free trunk file {} fail: {}, keeping its space",
                                    path.display(),
                                    e
                                );
                            }
                        }
                    }
                }

                let node_ref = state.arena.insert(TrunkNode {
                    info: merged,
                    status: TrunkStatus::Free,
                });
                if self.link(state, node_ref).is_err() {
                    state.arena.remove(node_ref);
                }
            }
        }
    }

    /// Rebuild the in-memory index from the checkpoint plus the binlog
    /// tail past it.
    fn load(&self) -> Result<()> {
        let mut restore_offset = 0;
        let mut had_checkpoint = false;

        if let Some(cp) = checkpoint::load(&self.checkpoint_path)? {
            had_checkpoint = true;
            restore_offset = cp.binlog_offset;
            let mut state = self.lock_state();
            for info in cp.records {
                self.insert_free(&mut state, info, false, true)?;
            }
        }

        self.restore(restore_offset, had_checkpoint)
    }

    fn restore(&self, restore_offset: u64, had_checkpoint: bool) -> Result<()> {
        let binlog_len = binlog_size(&self.binlog_path)?;
        if restore_offset == binlog_len {
            return Ok(());
        }
        if restore_offset > binlog_len {
            warn!(
                "checkpoint binlog offset {} > binlog size {}, checkpointing afresh",
                restore_offset, binlog_len
            );
            return self.do_save();
        }

        debug!(
            "trunk metadata recovering, start offset {}, {} binlog bytes to replay",
            restore_offset,
            binlog_len - restore_offset
        );

        // Only a full rebuild gets the transient offset-ordered pass that
        // pairs up ADDs and DELs before touching the size index.
        if restore_offset == 0 && !had_checkpoint {
            self.replay_full(restore_offset)?;
        } else {
            self.replay_incremental(restore_offset)?;
        }

        debug!("trunk metadata recovery done");
        self.do_save()
    }

    fn replay_full(&self, restore_offset: u64) -> Result<()> {
        let mut reader = BinlogReader::open(&self.binlog_path, restore_offset)?;
        let mut pending: BTreeMap<(TrunkPathInfo, u32, u32), TrunkFullInfo> = BTreeMap::new();
        while let Some(record) = reader.next_record()? {
            let key = (
                record.info.path,
                record.info.file.id,
                record.info.file.offset,
            );
            match record.op {
                BinlogOp::AddSpace => {
                    if pending.insert(key, record.info).is_some() {
                        self.duplicate_inserts.fetch_add(1, Ordering::Relaxed);
                        warn!("binlog replay: trunk space already exists: {}", record.info);
                    }
                }
                BinlogOp::DelSpace => {
                    if pending.remove(&key).is_none() {
                        warn!("binlog replay: trunk node not exist: {}", record.info);
                    }
                }
            }
        }

        let mut state = self.lock_state();
        for info in pending.into_values() {
            self.insert_free(&mut state, info, false, true)?;
        }
        Ok(())
    }

    fn replay_incremental(&self, restore_offset: u64) -> Result<()> {
        let mut reader = BinlogReader::open(&self.binlog_path, restore_offset)?;
        let mut state = self.lock_state();
        while let Some(record) = reader.next_record()? {
            match record.op {
                BinlogOp::AddSpace => {
                    self.insert_free(&mut state, record.info, false, true)?;
                }
                BinlogOp::DelSpace => {
                    match self.delete_space(&mut state, &record.info, TrunkStatus::Free, false) {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {
                            // Legitimate after a crash: the binlog can be
                            // ahead of the checkpoint it follows.
                            debug!("binlog del for unknown space: {}", record.info);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    // ---- binlog compaction ----------------------------------------------

    fn run_compress_pipeline(&self) -> Result<()> {
        self.stage_file.store(CompressStage::Begin)?;
        self.compress_apply()?;
        self.do_save()?;
        self.stage_file.store(CompressStage::SaveDone)?;
        self.compress_commit()
    }

    /// Rotate the binlog aside and start a fresh one; new records keep
    /// flowing while the snapshot is taken.
    fn compress_apply(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.binlog.sync()?;
        if self.binlog_path.exists() {
            std::fs::rename(&self.binlog_path, &self.rollback_path).context(IoSnafu {
                path: &self.binlog_path,
            })?;
        }
        match BinlogWriter::open(&self.binlog_path) {
            Ok(writer) => {
                state.binlog = writer;
            }
            Err(e) => {
                let _ = std::fs::rename(&self.rollback_path, &self.binlog_path);
                return Err(e);
            }
        }
        drop(state);
        self.stage_file.store(CompressStage::ApplyDone)
    }

    /// Fold the checkpoint snapshot plus post-apply records into the new
    /// binlog, then drop the consumed artifacts.
    fn compress_commit(&self) -> Result<()> {
        self.stage_file.store(CompressStage::CommitMerging)?;
        let mut state = self.lock_state();
        state.binlog.sync()?;
        merge_files(
            Some(&self.checkpoint_path),
            true,
            Some(&self.binlog_path),
            &self.binlog_path,
        )?;
        state.binlog = BinlogWriter::open(&self.binlog_path)?;
        drop(state);

        // The checkpoint's offset described the pre-merge binlog.
        std::fs::remove_file(&self.checkpoint_path).context(IoSnafu {
            path: &self.checkpoint_path,
        })?;
        self.stage_file.store(CompressStage::CommitMergeDone)?;

        if let Err(e) = std::fs::remove_file(&self.rollback_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("unlink {} fail: {}", self.rollback_path.display(), e);
            }
        }
        self.stage_file.store(CompressStage::Success)?;

        // The merged binlog carries the snapshot; re-checkpoint so the
        // offset on disk matches it again.
        self.do_save()
    }

    fn runtime_rollback(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.binlog.sync()?;
        rollback_binlog_files(
            &self.binlog_path,
            &self.rollback_path,
            &self.checkpoint_path,
            &self.stage_file,
        )?;
        state.binlog = BinlogWriter::open(&self.binlog_path)?;
        Ok(())
    }
}
