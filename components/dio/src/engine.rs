//! Worker pool topology and dispatch. Per store path the engine runs
//! `reader + writer` threads, each owning one blocking FIFO queue. A
//! task's worker is picked by hashing its connection id into the proper
//! sub-pool, which pins all chunks of one connection's operation to one
//! worker: strict per-connection ordering with no global lock, while
//! different connections proceed on different workers concurrently.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};
use trunkfs_common::{ConnId, StorePathIndex};

use crate::{
    config::DioConfig,
    context::{DioTask, FileOpKind},
    err::{EngineStoppedSnafu, Result},
    ops,
    stats::DioStats,
};

enum QueueItem {
    Task(Box<DioTask>),
    Stop,
}

pub struct DioEngine {
    config: DioConfig,
    senders: Vec<Sender<QueueItem>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    live_workers: Arc<AtomicUsize>,
    stats: Arc<DioStats>,
}

impl DioEngine {
    pub fn start(config: DioConfig) -> Self {
        let total = config.total_threads();
        let running = Arc::new(AtomicBool::new(true));
        let live_workers = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(DioStats::default());

        let mut senders = Vec::with_capacity(total);
        let mut handles = Vec::with_capacity(total);
        for index in 0..total {
            let (sender, receiver) = crossbeam_channel::unbounded();
            senders.push(sender);

            let live = live_workers.clone();
            live.fetch_add(1, Ordering::SeqCst);
            let stats = stats.clone();
            let handle = std::thread::Builder::new()
                .name(format!("dio-{}", index))
                .spawn(move || worker_loop(index, receiver, live, stats))
                .unwrap_or_else(|e| panic!("spawn dio worker {}: {}", index, e));
            handles.push(handle);
        }

        info!("disk io engine started with {} workers", total);
        Self {
            config,
            senders,
            handles: Mutex::new(handles),
            running,
            live_workers,
            stats,
        }
    }

    /// Worker index for a connection's next operation. Separate reader
    /// and writer sub-pools get hashed independently when separation is
    /// on.
    pub fn get_thread_index(
        &self,
        store_path_index: StorePathIndex,
        conn_id: ConnId,
        op: FileOpKind,
    ) -> usize {
        let per_path = self.config.threads_per_path();
        let base = store_path_index as usize * per_path;
        if self.config.rw_separated {
            match op {
                FileOpKind::Read => {
                    base + (conn_id as usize) % self.config.reader_threads_per_path
                }
                FileOpKind::Write => {
                    base + self.config.reader_threads_per_path
                        + (conn_id as usize) % self.config.writer_threads_per_path
                }
            }
        } else {
            base + (conn_id as usize) % per_path
        }
    }

    /// Convenience wrapper deriving the index from the task itself.
    pub fn thread_index_for(&self, store_path_index: StorePathIndex, task: &DioTask) -> usize {
        self.get_thread_index(store_path_index, task.conn_id, task.op.kind())
    }

    /// Enqueue a task on the worker at `index`. On failure the task's
    /// listener is told before the error returns, so no task ever
    /// vanishes without a completion event.
    pub fn queue_push(&self, index: usize, task: DioTask) -> Result<()> {
        if !self.running.load(Ordering::Relaxed) || index >= self.senders.len() {
            task.listener
                .clone()
                .on_done(task, EngineStoppedSnafu.fail());
            return EngineStoppedSnafu.fail();
        }

        if let Err(send_err) = self.senders[index].send(QueueItem::Task(Box::new(task))) {
            if let QueueItem::Task(task) = send_err.0 {
                warn!("dio worker {} queue is closed", index);
                task.listener
                    .clone()
                    .on_done(*task, EngineStoppedSnafu.fail());
            }
            return EngineStoppedSnafu.fail();
        }
        Ok(())
    }

    /// Stop accepting work and wait for every worker to drain its queue
    /// and exit. In-flight operations are never interrupted.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for sender in &self.senders {
            let _ = sender.send(QueueItem::Stop);
        }
        let handles = {
            let mut guard = match self.handles.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
        info!("disk io engine stopped");
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    pub fn stats(&self) -> &DioStats {
        &self.stats
    }
}

fn worker_loop(
    index: usize,
    receiver: Receiver<QueueItem>,
    live_workers: Arc<AtomicUsize>,
    stats: Arc<DioStats>,
) {
    scopeguard::defer! {
        let left = live_workers.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("dio worker {} exited, {} workers left", index, left);
    }

    loop {
        match receiver.recv() {
            Ok(QueueItem::Task(task)) => ops::execute(*task, &stats),
            Ok(QueueItem::Stop) | Err(_) => break,
        }
    }

    // Anything enqueued before the Stop sentinel was already handled in
    // FIFO order; drain stragglers from racing pushes anyway.
    while let Ok(QueueItem::Task(task)) = receiver.try_recv() {
        ops::execute(*task, &stats);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::mpsc,
        time::{Duration, Instant},
    };

    use bytes::BytesMut;
    use rand::Rng;
    use trunkfs_storage::trunk_file;
    use trunkfs_types::{
        header::is_free_slot, TrunkFileInfo, TrunkFileType, TrunkFullInfo, TrunkHeader,
        TrunkPathInfo, TRUNK_HEADER_SIZE,
    };

    use super::*;
    use crate::{
        context::{
            BeforeCloseHook, BeforeOpenHook, CleanupKind, DioListener, DioOpCode, FileContext,
            OpenFlags, UploadMeta,
        },
        err::Error,
    };

    fn engine(readers: usize, writers: usize) -> Arc<DioEngine> {
        Arc::new(DioEngine::start(DioConfig {
            store_path_count: 1,
            reader_threads_per_path: readers,
            writer_threads_per_path: writers,
            rw_separated: true,
        }))
    }

    /// Network-layer stand-in: drains read chunks into `collected`,
    /// feeds pending write chunks back in, re-enqueues on continue, and
    /// reports completion over an mpsc channel.
    struct TestListener {
        engine: Arc<DioEngine>,
        index: usize,
        collected: Mutex<Vec<u8>>,
        pending_chunks: Mutex<Vec<Vec<u8>>>,
        abort_after_first_chunk: bool,
        done_tx: mpsc::Sender<Result<()>>,
    }

    impl TestListener {
        fn new(
            engine: Arc<DioEngine>,
            index: usize,
            done_tx: mpsc::Sender<Result<()>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                engine,
                index,
                collected: Mutex::new(Vec::new()),
                pending_chunks: Mutex::new(Vec::new()),
                abort_after_first_chunk: false,
                done_tx,
            })
        }
    }

    impl DioListener for TestListener {
        fn on_continue(&self, mut task: DioTask) {
            match task.op {
                DioOpCode::Read => {
                    self.collected.lock().unwrap().extend_from_slice(&task.buffer);
                    task.buffer.clear();
                }
                DioOpCode::Write => {
                    if self.abort_after_first_chunk {
                        // Connection dropped mid-transfer.
                        task.ctx.clean_up();
                        let _ = self.done_tx.send(Ok(()));
                        return;
                    }
                    let next = self.pending_chunks.lock().unwrap().remove(0);
                    task.buffer.extend_from_slice(&next);
                }
                _ => {}
            }
            self.engine.queue_push(self.index, task).unwrap();
        }

        fn on_done(&self, task: DioTask, result: Result<()>) {
            if task.op == DioOpCode::Read {
                self.collected.lock().unwrap().extend_from_slice(&task.buffer);
            }
            let _ = self.done_tx.send(result);
        }
    }

    fn recv_done(rx: &mpsc::Receiver<Result<()>>) -> Result<()> {
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    fn write_trunk_task(
        filename: PathBuf,
        listener: Arc<dyn DioListener>,
        info: TrunkFullInfo,
        trunk_file_size: u64,
        payload_len: u64,
        first_chunk: &[u8],
    ) -> DioTask {
        let mut ctx = FileContext::new(filename, OpenFlags::write_only());
        ctx.start = info.file.offset as u64 + TRUNK_HEADER_SIZE as u64;
        ctx.offset = ctx.start;
        ctx.end = ctx.start + payload_len;
        ctx.calc_crc32 = true;
        ctx.before_open = BeforeOpenHook::CheckTrunkFile;
        ctx.before_close = BeforeCloseHook::WriteTrunkHeader;
        ctx.cleanup = CleanupKind::DeleteTrunkSlot;
        ctx.upload = Some(UploadMeta {
            file_type: TrunkFileType::Regular,
            ext_name: "bin".to_string(),
            start_time: 1_700_000_000,
            trunk_info: Some(info),
            trunk_file_size,
        });

        let mut buffer = BytesMut::with_capacity(64 * 1024);
        buffer.extend_from_slice(first_chunk);
        DioTask {
            conn_id: 1,
            op: DioOpCode::Write,
            ctx,
            buffer,
            listener,
        }
    }

    fn slot_info(offset: u32, size: u32) -> TrunkFullInfo {
        TrunkFullInfo {
            path: TrunkPathInfo::default(),
            file: TrunkFileInfo {
                id: 1,
                offset,
                size,
            },
        }
    }

    #[test]
    fn read_streams_in_order_with_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let engine = engine(2, 1);
        let index = engine.get_thread_index(0, 42, FileOpKind::Read);
        let (done_tx, done_rx) = mpsc::channel();
        let listener = TestListener::new(engine.clone(), index, done_tx);

        let mut ctx = FileContext::new(&path, OpenFlags::read_only());
        ctx.end = content.len() as u64;
        ctx.calc_crc32 = true;
        let task = DioTask {
            conn_id: 42,
            op: DioOpCode::Read,
            ctx,
            // Small capacity forces many chunks.
            buffer: BytesMut::with_capacity(4096),
            listener: listener.clone(),
        };

        engine.queue_push(index, task).unwrap();
        recv_done(&done_rx).unwrap();

        let collected = listener.collected.lock().unwrap();
        assert_eq!(*collected, content);
        let stats = engine.stats().snapshot();
        assert!(stats.total_file_read_count >= (content.len() / 4096) as u64);
        assert_eq!(stats.total_file_open_count, 1);
        engine.shutdown();
    }

    #[test]
    fn chunked_write_lands_gap_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload");

        let chunks: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 1000]).collect();
        let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        let expected: Vec<u8> = chunks.concat();

        let engine = engine(1, 2);
        let index = engine.get_thread_index(0, 7, FileOpKind::Write);
        let (done_tx, done_rx) = mpsc::channel();
        let listener = TestListener::new(engine.clone(), index, done_tx);
        *listener.pending_chunks.lock().unwrap() = chunks[1..].to_vec();

        let mut ctx = FileContext::new(&path, OpenFlags::write_create());
        ctx.end = total;
        ctx.calc_crc32 = true;
        ctx.calc_signature = true;
        ctx.cleanup = CleanupKind::DeleteOnAbort;
        let mut buffer = BytesMut::with_capacity(4096);
        buffer.extend_from_slice(&chunks[0]);
        let task = DioTask {
            conn_id: 7,
            op: DioOpCode::Write,
            ctx,
            buffer,
            listener: listener.clone(),
        };

        engine.queue_push(index, task).unwrap();
        recv_done(&done_rx).unwrap();

        // Bytes landed at strictly increasing, gap-free offsets.
        assert_eq!(std::fs::read(&path).unwrap(), expected);
        engine.shutdown();
    }

    #[test]
    fn aborted_fresh_upload_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half");

        let engine = engine(1, 1);
        let index = engine.get_thread_index(0, 9, FileOpKind::Write);
        let (done_tx, done_rx) = mpsc::channel();
        let mut listener = TestListener::new(engine.clone(), index, done_tx);
        Arc::get_mut(&mut listener).unwrap().abort_after_first_chunk = true;

        let mut ctx = FileContext::new(&path, OpenFlags::write_create());
        ctx.end = 5000;
        ctx.cleanup = CleanupKind::DeleteOnAbort;
        let mut buffer = BytesMut::with_capacity(4096);
        buffer.extend_from_slice(&[0x55; 1000]);
        let task = DioTask {
            conn_id: 9,
            op: DioOpCode::Write,
            ctx,
            buffer,
            listener: listener.clone(),
        };

        engine.queue_push(index, task).unwrap();
        recv_done(&done_rx).unwrap();
        // No partial content is ever visible.
        assert!(!path.exists());
        engine.shutdown();
    }

    #[test]
    fn aborted_append_truncates_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appender");
        std::fs::write(&path, vec![0xAA; 2000]).unwrap();

        let engine = engine(1, 1);
        let index = engine.get_thread_index(0, 3, FileOpKind::Write);
        let (done_tx, done_rx) = mpsc::channel();
        let mut listener = TestListener::new(engine.clone(), index, done_tx);
        Arc::get_mut(&mut listener).unwrap().abort_after_first_chunk = true;

        let mut ctx = FileContext::new(&path, OpenFlags::write_only());
        ctx.start = 2000;
        ctx.offset = 2000;
        ctx.end = 2000 + 5000;
        ctx.cleanup = CleanupKind::TruncateToStart;
        let mut buffer = BytesMut::with_capacity(4096);
        buffer.extend_from_slice(&[0xBB; 1000]);
        let task = DioTask {
            conn_id: 3,
            op: DioOpCode::Write,
            ctx,
            buffer,
            listener: listener.clone(),
        };

        engine.queue_push(index, task).unwrap();
        recv_done(&done_rx).unwrap();
        // Appended bytes rolled back, original content intact.
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xAA; 2000]);
        engine.shutdown();
    }

    #[test]
    fn trunk_write_stamps_header_and_guards_occupied_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001");
        let trunk_size = 1 << 20;
        let slot = slot_info(4096, 8192);
        let payload = vec![0x42u8; 3000];

        let engine = engine(1, 1);
        let index = engine.get_thread_index(0, 5, FileOpKind::Write);
        let (done_tx, done_rx) = mpsc::channel();
        let listener = TestListener::new(engine.clone(), index, done_tx);

        let task = write_trunk_task(
            path.clone(),
            listener.clone(),
            slot,
            trunk_size,
            payload.len() as u64,
            &payload,
        );
        engine.queue_push(index, task).unwrap();
        recv_done(&done_rx).unwrap();

        // The guard created and pre-sized the trunk file.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), trunk_size);
        let content = std::fs::read(&path).unwrap();
        let mut header_buff = [0u8; TRUNK_HEADER_SIZE];
        header_buff.copy_from_slice(&content[4096..4096 + TRUNK_HEADER_SIZE]);
        let header = TrunkHeader::unpack(&header_buff);
        assert_eq!(header.file_type, TrunkFileType::Regular);
        assert_eq!(header.alloc_size, 8192);
        assert_eq!(header.file_size, payload.len() as u32);
        assert_eq!(header.crc32, crc32fast::hash(&payload));
        let payload_at = 4096 + TRUNK_HEADER_SIZE;
        assert_eq!(&content[payload_at..payload_at + payload.len()], &payload[..]);

        // A second upload into the same slot must hit the guard.
        let (done_tx2, done_rx2) = mpsc::channel();
        let listener2 = TestListener::new(engine.clone(), index, done_tx2);
        let task = write_trunk_task(
            path.clone(),
            listener2,
            slot,
            trunk_size,
            100,
            &[0u8; 100],
        );
        engine.queue_push(index, task).unwrap();
        let err = recv_done(&done_rx2).unwrap_err();
        assert!(err.is_occupied());
        assert_eq!(err.os_error(), Some(17));
        engine.shutdown();
    }

    #[test]
    fn delete_trunk_reclaims_only_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000002");
        trunk_file::init_file(&path, 1 << 20).unwrap();

        // Occupy two slots; delete the first.
        let keep = slot_info(0, 4096);
        let gone = slot_info(8192, 4096);
        for slot in [&keep, &gone] {
            let mut header = TrunkHeader {
                file_type: TrunkFileType::Regular,
                alloc_size: slot.file.size,
                file_size: 100,
                crc32: 1,
                mtime: 1,
                ..Default::default()
            };
            header.set_ext_name("dat");
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(slot.file.offset as u64))
                .unwrap();
            std::io::Write::write_all(&mut file, &header.pack()).unwrap();
        }

        let engine = engine(1, 1);
        let index = engine.get_thread_index(0, 11, FileOpKind::Write);
        let (done_tx, done_rx) = mpsc::channel();
        let listener = TestListener::new(engine.clone(), index, done_tx);

        let mut ctx = FileContext::new(&path, OpenFlags::write_only());
        ctx.upload = Some(UploadMeta {
            trunk_info: Some(gone),
            ..Default::default()
        });
        let task = DioTask {
            conn_id: 11,
            op: DioOpCode::DeleteTrunk,
            ctx,
            buffer: BytesMut::new(),
            listener,
        };
        engine.queue_push(index, task).unwrap();
        recv_done(&done_rx).unwrap();

        let content = std::fs::read(&path).unwrap();
        let mut buff = [0u8; TRUNK_HEADER_SIZE];
        buff.copy_from_slice(&content[8192..8192 + TRUNK_HEADER_SIZE]);
        assert!(is_free_slot(&buff));
        buff.copy_from_slice(&content[0..TRUNK_HEADER_SIZE]);
        assert!(!is_free_slot(&buff));
        // The physical trunk file itself stays.
        assert_eq!(content.len() as u64, 1 << 20);
        engine.shutdown();
    }

    #[test]
    fn per_connection_reads_stay_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(4, 1);

        let mut rng = rand::thread_rng();
        let mut expected = Vec::new();
        let mut receivers = Vec::new();
        for conn in 0..50u64 {
            let len = rng.gen_range(10_000..50_000);
            let content: Vec<u8> = (0..len).map(|i| ((i as u64 * 31 + conn) % 255) as u8).collect();
            let path = dir.path().join(format!("conn-{}", conn));
            std::fs::write(&path, &content).unwrap();

            let index = engine.get_thread_index(0, conn, FileOpKind::Read);
            let (done_tx, done_rx) = mpsc::channel();
            let listener = TestListener::new(engine.clone(), index, done_tx);

            let mut ctx = FileContext::new(&path, OpenFlags::read_only());
            ctx.end = content.len() as u64;
            let task = DioTask {
                conn_id: conn,
                op: DioOpCode::Read,
                ctx,
                buffer: BytesMut::with_capacity(4096),
                listener: listener.clone(),
            };
            engine.queue_push(index, task).unwrap();

            expected.push(content);
            receivers.push((done_rx, listener));
        }

        for (conn, (done_rx, listener)) in receivers.into_iter().enumerate() {
            recv_done(&done_rx).unwrap();
            assert_eq!(
                *listener.collected.lock().unwrap(),
                expected[conn],
                "connection {} bytes out of order",
                conn
            );
        }
        engine.shutdown();
    }

    #[test]
    fn dispatch_is_stable_and_pools_are_disjoint() {
        let engine = Arc::new(DioEngine::start(DioConfig {
            store_path_count: 2,
            reader_threads_per_path: 3,
            writer_threads_per_path: 2,
            rw_separated: true,
        }));
        assert_eq!(engine.worker_count(), 10);

        for conn in 0..100u64 {
            for path in 0..2u8 {
                let read = engine.get_thread_index(path, conn, FileOpKind::Read);
                let write = engine.get_thread_index(path, conn, FileOpKind::Write);
                // Same inputs, same worker.
                assert_eq!(read, engine.get_thread_index(path, conn, FileOpKind::Read));

                let base = path as usize * 5;
                assert!((base..base + 3).contains(&read));
                assert!((base + 3..base + 5).contains(&write));
            }
        }
        engine.shutdown();
    }

    #[test]
    fn shutdown_drains_and_workers_exit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(2, 2);
        assert_eq!(engine.live_workers(), 4);

        // A pile of single-shot deletes queued right before shutdown.
        let (done_tx, done_rx) = mpsc::channel();
        let mut paths = Vec::new();
        for i in 0..40 {
            let path = dir.path().join(format!("victim-{}", i));
            std::fs::write(&path, b"x").unwrap();
            let index = engine.get_thread_index(0, i as u64, FileOpKind::Write);
            let listener = TestListener::new(engine.clone(), index, done_tx.clone());
            let task = DioTask {
                conn_id: i as u64,
                op: DioOpCode::DeleteNormal,
                ctx: FileContext::new(&path, OpenFlags::write_only()),
                buffer: BytesMut::new(),
                listener,
            };
            engine.queue_push(index, task).unwrap();
            paths.push(path);
        }

        engine.shutdown();
        // Every queued task ran before its worker exited.
        for _ in 0..40 {
            recv_done(&done_rx).unwrap();
        }
        for path in paths {
            assert!(!path.exists());
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.live_workers() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.live_workers(), 0);

        // Pushes after shutdown are refused and the listener is told.
        let (done_tx, done_rx) = mpsc::channel();
        let listener = TestListener::new(engine.clone(), 0, done_tx);
        let task = DioTask {
            conn_id: 0,
            op: DioOpCode::DeleteNormal,
            ctx: FileContext::new(dir.path().join("never"), OpenFlags::write_only()),
            buffer: BytesMut::new(),
            listener,
        };
        assert!(engine.queue_push(0, task).is_err());
        assert!(matches!(recv_done(&done_rx), Err(Error::EngineStopped { .. })));
    }
}
