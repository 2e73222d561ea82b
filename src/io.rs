//! The I/O executor.
//!
//! One dedicated thread owns the write stream and applies write requests in
//! submission order, which is the drain discipline that makes recovery
//! trivial: a reader can never observe write N+1 without write N. Reads of
//! already-written data carry no ordering constraint, so they run on a small
//! worker pool, bounded by a registered-buffer pool that doubles as
//! backpressure: when every buffer is borrowed, the next read parks until one
//! returns.
//!
//! Operations are a plain sum type with one initiate and one complete per
//! variant; completions are delivered over rendezvous channels, the
//! language-native stand-in for receiver callbacks.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use dashmap::DashMap;
use tracing::trace;

use crate::node::{Node, VirtualOffset, MAX_NODE_PAGES, PAGE_SIZE};
use crate::pool::{ChunkPool, ListKind, CHUNK_HEADER_SIZE};
use crate::{DbError, DbResult};

/// Tuning knobs for the executor.
#[derive(Clone, Debug)]
pub struct IoConfig {
    /// Registered read buffers; also the maximum concurrent-read count.
    pub read_buffers: usize,
    /// Read worker threads.
    pub read_workers: usize,
    /// Bytes buffered per write frontier before a flush is forced.
    pub write_buffer_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            read_buffers: 64,
            read_workers: 4,
            write_buffer_size: 128 * 1024,
        }
    }
}

enum WriteOp {
    Write {
        device: u32,
        offset: u64,
        data: Vec<u8>,
    },
    /// Ack once every previously submitted write has completed, carrying the
    /// first sticky write error if any.
    Barrier { done: Sender<Option<DbError>> },
    Shutdown,
}

struct ReadOp {
    device: u32,
    offset: u64,
    len: usize,
    buf: Box<[u8]>,
    reply: Sender<DbResult<Box<[u8]>>>,
}

enum ReadMsg {
    Read(ReadOp),
    Shutdown,
}

/// Submits reads and writes against the pool and dispatches completions.
pub struct IoExecutor {
    pool: Arc<ChunkPool>,
    write_tx: Sender<WriteOp>,
    read_tx: Sender<ReadMsg>,
    buffers: (Sender<Box<[u8]>>, Receiver<Box<[u8]>>),
    buffer_len: usize,
    write_handle: Mutex<Option<JoinHandle<()>>>,
    read_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for IoExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoExecutor").finish_non_exhaustive()
    }
}

impl IoExecutor {
    pub fn new(pool: Arc<ChunkPool>, config: &IoConfig) -> Self {
        let buffer_len = MAX_NODE_PAGES as usize * PAGE_SIZE as usize;
        let buffers = bounded(config.read_buffers);
        for _ in 0..config.read_buffers {
            buffers
                .0
                .send(vec![0u8; buffer_len].into_boxed_slice())
                .unwrap();
        }

        let (write_tx, write_rx) = unbounded::<WriteOp>();
        let write_pool = pool.clone();
        let write_handle = std::thread::Builder::new()
            .name("triedb-io-write".into())
            .spawn(move || write_loop(write_pool, write_rx))
            .expect("spawn i/o write thread");

        let (read_tx, read_rx) = unbounded::<ReadMsg>();
        let mut read_handles = Vec::new();
        for i in 0..config.read_workers.max(1) {
            let rx = read_rx.clone();
            let p = pool.clone();
            read_handles.push(
                std::thread::Builder::new()
                    .name(format!("triedb-io-read-{i}"))
                    .spawn(move || read_loop(p, rx))
                    .expect("spawn i/o read thread"),
            );
        }

        Self {
            pool,
            write_tx,
            read_tx,
            buffers,
            buffer_len,
            write_handle: Mutex::new(Some(write_handle)),
            read_handles: Mutex::new(read_handles),
        }
    }

    /// Queue a write. Writes are applied in submission order.
    pub fn submit_write(&self, device: u32, offset: u64, data: Vec<u8>) {
        self.write_tx
            .send(WriteOp::Write {
                device,
                offset,
                data,
            })
            .expect("i/o write thread gone");
    }

    /// Block until every submitted write has completed at the device, and
    /// surface the first write error encountered since the last barrier.
    pub fn wait_until_done(&self) -> DbResult<()> {
        let (tx, rx) = bounded(1);
        self.write_tx
            .send(WriteOp::Barrier { done: tx })
            .expect("i/o write thread gone");
        match rx.recv().expect("i/o write thread gone") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Read and decode the node record at `offset`. Borrows one registered
    /// buffer for the duration; parks when none is available.
    pub fn read_node(&self, offset: VirtualOffset) -> DbResult<Node> {
        let (device, base) = self.pool.resolve_chunk(offset.chunk_id()).ok_or(
            DbError::Corruption {
                offset: Some(offset),
                reason: "reference into reclaimed chunk",
            },
        )?;
        let span = offset.spare_pages();
        if span == 0 || span > MAX_NODE_PAGES {
            return Err(DbError::Corruption {
                offset: Some(offset),
                reason: "page span out of range for read buffer",
            });
        }
        let len = span as usize * PAGE_SIZE as usize;
        debug_assert!(len <= self.buffer_len);
        let page_start = offset.offset() / PAGE_SIZE * PAGE_SIZE;
        let delta = (offset.offset() - page_start) as usize;

        let buf = self.buffers.1.recv().expect("buffer pool closed");
        let (reply_tx, reply_rx) = bounded(1);
        self.read_tx
            .send(ReadMsg::Read(ReadOp {
                device,
                offset: base + page_start,
                len,
                buf,
                reply: reply_tx,
            }))
            .expect("i/o read threads gone");
        let buf = reply_rx.recv().expect("i/o read threads gone")?;

        let result = if delta + 2 > len {
            Err(DbError::Corruption {
                offset: Some(offset),
                reason: "record header past read window",
            })
        } else {
            let record_len =
                u16::from_le_bytes(buf[delta..delta + 2].try_into().unwrap()) as usize;
            if delta + record_len > len {
                Err(DbError::Corruption {
                    offset: Some(offset),
                    reason: "record overruns its page span",
                })
            } else {
                Node::decode(&buf[delta..delta + record_len], offset)
            }
        };
        self.buffers.0.send(buf).expect("buffer pool closed");
        result
    }
}

impl Drop for IoExecutor {
    fn drop(&mut self) {
        // No per-operation cancel: drain in-flight work, then join.
        let _ = self.write_tx.send(WriteOp::Shutdown);
        if let Some(handle) = self.write_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut handles = self.read_handles.lock().unwrap();
        for _ in handles.iter() {
            let _ = self.read_tx.send(ReadMsg::Shutdown);
        }
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn write_loop(pool: Arc<ChunkPool>, rx: Receiver<WriteOp>) {
    let mut sticky: Option<DbError> = None;
    while let Ok(op) = rx.recv() {
        match op {
            WriteOp::Write {
                device,
                offset,
                data,
            } => {
                trace!(target: "triedb::io", device, offset, len = data.len(), "write");
                if sticky.is_none() {
                    if let Err(err) = pool.device(device).write_at(offset, &data) {
                        sticky = Some(DbError::io(err));
                    }
                }
            }
            WriteOp::Barrier { done } => {
                let _ = done.send(sticky.take());
            }
            WriteOp::Shutdown => break,
        }
    }
}

fn read_loop(pool: Arc<ChunkPool>, rx: Receiver<ReadMsg>) {
    while let Ok(ReadMsg::Read(mut op)) = rx.recv() {
        let result = pool
            .device(op.device)
            .read_at(op.offset, &mut op.buf[..op.len])
            .map_err(DbError::io)
            .map(|()| op.buf);
        let _ = op.reply.send(result);
    }
}

// ---- node writer ------------------------------------------------------

/// Append stream for one write frontier (fast or slow).
///
/// A node record never straddles a chunk boundary: when the tail of the
/// current chunk cannot hold the record, the tail is zero-padded, the chunk
/// sealed, and the record lands at the start of the next chunk taken from
/// the free list tail.
#[derive(Debug)]
pub struct NodeWriter {
    list: ListKind,
    chunk: Option<u32>,
    offset: u64,
    buf: Vec<u8>,
    buf_start: u64,
    write_buffer_size: usize,
}

impl NodeWriter {
    pub fn from_frontier(pool: &ChunkPool, list: ListKind, config: &IoConfig) -> Self {
        let frontier = pool.frontier(list);
        let (chunk, offset) = if frontier.is_valid() {
            (Some(frontier.chunk_id()), frontier.offset())
        } else {
            (None, CHUNK_HEADER_SIZE)
        };
        Self {
            list,
            chunk,
            offset,
            buf: Vec::new(),
            buf_start: offset,
            write_buffer_size: config.write_buffer_size,
        }
    }

    pub fn list(&self) -> ListKind {
        self.list
    }

    /// Packed offset below which nothing more will ever be appended by this
    /// writer. Used as the "frontier at upsert start" marker.
    pub fn frontier_raw(&self) -> u64 {
        match self.chunk {
            Some(chunk) => VirtualOffset::new(chunk, self.offset, 0).raw(),
            None => 0,
        }
    }

    /// Append one node record, returning where it will live.
    pub fn append(
        &mut self,
        pool: &ChunkPool,
        io: &IoExecutor,
        record: &[u8],
    ) -> DbResult<VirtualOffset> {
        let chunk_size = pool.chunk_size();
        if record.len() as u64 > chunk_size - CHUNK_HEADER_SIZE {
            return Err(DbError::Corruption {
                offset: None,
                reason: "node record larger than a chunk",
            });
        }
        if self.chunk.is_none() {
            self.open_chunk(pool)?;
        }
        if self.offset + record.len() as u64 > chunk_size {
            // Zero-pad the tail so the next recovery scan sees no torn record,
            // flush, and continue in a fresh chunk.
            let pad = (chunk_size - self.offset) as usize;
            self.buf.extend(std::iter::repeat(0u8).take(pad));
            self.offset = chunk_size;
            self.flush(pool, io)?;
            pool.seal_chunk(self.chunk.unwrap(), chunk_size)?;
            self.open_chunk(pool)?;
        }
        let chunk = self.chunk.unwrap();
        let at = VirtualOffset::new(
            chunk,
            self.offset,
            VirtualOffset::page_span(self.offset, record.len()),
        );
        self.buf.extend_from_slice(record);
        self.offset += record.len() as u64;
        if self.buf.len() >= self.write_buffer_size {
            self.flush(pool, io)?;
        }
        Ok(at)
    }

    /// Submit the buffered tail and advance the persistent frontier.
    pub fn flush(&mut self, pool: &ChunkPool, io: &IoExecutor) -> DbResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.chunk.expect("buffered data without a chunk");
        let (device, base) = pool.resolve_chunk(chunk).ok_or(DbError::Corruption {
            offset: None,
            reason: "write frontier chunk reclaimed",
        })?;
        let data = std::mem::take(&mut self.buf);
        io.submit_write(device, base + self.buf_start, data);
        self.buf_start = self.offset;
        pool.set_frontier(self.list, VirtualOffset::new(chunk, self.offset, 0));
        Ok(())
    }

    fn open_chunk(&mut self, pool: &ChunkPool) -> DbResult<()> {
        debug_assert!(self.buf.is_empty(), "unflushed data across chunk switch");
        let chunk = pool.allocate_chunk(self.list)?;
        self.chunk = Some(chunk);
        self.offset = CHUNK_HEADER_SIZE;
        self.buf_start = self.offset;
        pool.set_frontier(self.list, VirtualOffset::new(chunk, self.offset, 0));
        Ok(())
    }
}

// ---- node store -------------------------------------------------------

/// Shared node cache with in-flight read coalescing.
///
/// If two concurrent lookups miss on the same offset, exactly one issues the
/// disk read and the other parks on its completion. Cache entries have the
/// same logical content as their on-disk image; eviction is driven
/// explicitly by the upsert engine at commit boundaries and only drops
/// entries nobody else still references.
pub struct NodeStore {
    cache: DashMap<u64, Arc<Node>>,
    inflight: DashMap<u64, Vec<Sender<DbResult<Arc<Node>>>>>,
    order: Mutex<std::collections::VecDeque<u64>>,
    capacity: usize,
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("len", &self.cache.len())
            .finish()
    }
}

impl NodeStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: DashMap::new(),
            inflight: DashMap::new(),
            order: Mutex::new(std::collections::VecDeque::new()),
            capacity,
        }
    }

    /// Fetch the node at `offset`, from cache or disk.
    pub fn get(&self, io: &IoExecutor, offset: VirtualOffset) -> DbResult<Arc<Node>> {
        let key = offset.raw();
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }

        // Either become the reader or attach to the in-flight one.
        let waiter = {
            match self.inflight.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                    let (tx, rx) = bounded(1);
                    entry.get_mut().push(tx);
                    Some(rx)
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert(Vec::new());
                    None
                }
            }
        };
        if let Some(rx) = waiter {
            return rx.recv().expect("in-flight reader vanished");
        }

        let result = io.read_node(offset).map(Arc::new);
        if let Ok(node) = &result {
            self.insert(offset, node.clone());
        }
        if let Some((_, waiters)) = self.inflight.remove(&key) {
            for tx in waiters {
                let _ = tx.send(result.clone());
            }
        }
        result
    }

    /// Prime the cache with a node we just built or wrote.
    pub fn insert(&self, offset: VirtualOffset, node: Arc<Node>) {
        if self.cache.insert(offset.raw(), node).is_none() {
            self.order.lock().unwrap().push_back(offset.raw());
        }
    }

    pub fn remove(&self, offset: VirtualOffset) {
        self.cache.remove(&offset.raw());
    }

    /// Shrink toward capacity, oldest first, skipping entries still
    /// referenced elsewhere.
    pub fn evict(&self) {
        let mut order = self.order.lock().unwrap();
        let mut scanned = 0;
        let budget = order.len();
        while self.cache.len() > self.capacity && scanned < budget {
            scanned += 1;
            let Some(key) = order.pop_front() else { break };
            let keep = match self.cache.get(&key) {
                Some(entry) => Arc::strong_count(entry.value()) > 1,
                None => false,
            };
            if keep {
                order.push_back(key);
            } else {
                self.cache.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nibbles::Nibbles;
    use crate::pool::OpenMode;

    fn setup() -> (Arc<ChunkPool>, IoExecutor) {
        let pool = Arc::new(
            ChunkPool::open(&[], 1 << 22, 1 << 16, OpenMode::Truncate).unwrap(),
        );
        let io = IoExecutor::new(pool.clone(), &IoConfig::default());
        (pool, io)
    }

    fn leaf(value: Vec<u8>) -> Node {
        Node {
            mask: 0,
            path: Nibbles::from_nibbles(&[1, 2, 3]),
            value: Some(value),
            children: Vec::new(),
        }
    }

    #[test]
    fn write_then_read_back() {
        let (pool, io) = setup();
        let mut writer =
            NodeWriter::from_frontier(&pool, ListKind::Fast, &IoConfig::default());
        let node = leaf(b"some value".to_vec());
        let record = node.encode();
        let at = writer.append(&pool, &io, &record).unwrap();
        writer.flush(&pool, &io).unwrap();
        io.wait_until_done().unwrap();

        let read = io.read_node(at).unwrap();
        assert_eq!(read.value, node.value);
        assert_eq!(read.path, node.path);
    }

    #[test]
    fn chunk_tail_is_padded() {
        let (pool, io) = setup();
        let mut writer =
            NodeWriter::from_frontier(&pool, ListKind::Fast, &IoConfig::default());
        // Fill most of one chunk, then append a record that cannot fit.
        let big = leaf(vec![7u8; 40_000]);
        let big_record = big.encode();
        let first = writer.append(&pool, &io, &big_record).unwrap();
        let second = writer.append(&pool, &io, &big_record).unwrap();
        assert_ne!(first.chunk_id(), second.chunk_id());
        assert_eq!(second.offset(), CHUNK_HEADER_SIZE);
        writer.flush(&pool, &io).unwrap();
        io.wait_until_done().unwrap();
        assert_eq!(io.read_node(second).unwrap().value, big.value);
    }

    #[test]
    fn oversized_span_is_corruption() {
        let (pool, io) = setup();
        let mut writer =
            NodeWriter::from_frontier(&pool, ListKind::Fast, &IoConfig::default());
        let record = leaf(b"x".to_vec()).encode();
        let at = writer.append(&pool, &io, &record).unwrap();
        writer.flush(&pool, &io).unwrap();
        io.wait_until_done().unwrap();
        let bad = VirtualOffset::new(at.chunk_id(), at.offset(), MAX_NODE_PAGES + 1);
        assert!(matches!(
            io.read_node(bad),
            Err(DbError::Corruption { .. })
        ));
    }

    #[test]
    fn store_coalesces_and_caches() {
        let (pool, io) = setup();
        let mut writer =
            NodeWriter::from_frontier(&pool, ListKind::Fast, &IoConfig::default());
        let record = leaf(b"cached".to_vec()).encode();
        let at = writer.append(&pool, &io, &record).unwrap();
        writer.flush(&pool, &io).unwrap();
        io.wait_until_done().unwrap();

        let store = NodeStore::new(16);
        let a = store.get(&io, at).unwrap();
        let b = store.get(&io, at).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }
}
