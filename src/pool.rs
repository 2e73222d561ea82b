//! The chunk pool.
//!
//! One or more backing devices (regular files, raw block devices, or
//! anonymous memory) are partitioned into fixed-size chunks. Chunks move
//! between four states: free, appended-to in the *fast* list, appended-to in
//! the *slow* list, or reserved for the front header. Everything on disk is
//! append-only except the front header, which is the single in-place mutable
//! region and is written as two alternating replicas.
//!
//! Chunk ids handed to upper layers are virtual and allocated monotonically;
//! the pool resolves them to physical slots. That indirection is what lets
//! compaction reclaim and reuse physical space while packed virtual offsets
//! keep ordering by age.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Mutex;

use ahash::AHashMap;
use alloy_primitives::keccak256;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::node::{VirtualOffset, CHUNK_ID_BITS};
use crate::{DbError, DbResult};

/// Reserved region at the front of device 0: two 12 KiB header replicas.
pub const FRONT_HEADER_SIZE: u64 = 24 * 1024;
const HEADER_REPLICA_SIZE: u64 = 12 * 1024;
const HEADER_MAGIC: [u8; 8] = *b"TRIEDB\x00\x01";
const FORMAT_VERSION: u32 = 1;

/// First 4 KiB of every chunk: list linkage and the sealed write offset.
pub const CHUNK_HEADER_SIZE: u64 = 4096;

const NO_LINK: u32 = u32::MAX;

/// Which append list a chunk (or a write frontier) belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ListKind {
    Fast,
    Slow,
}

impl ListKind {
    fn index(self) -> usize {
        match self {
            ListKind::Fast => 0,
            ListKind::Slow => 1,
        }
    }

    fn tag(self) -> u8 {
        match self {
            ListKind::Fast => 1,
            ListKind::Slow => 2,
        }
    }
}

/// How to open the pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenMode {
    /// Zero the header and every chunk header; start from an empty DB.
    Truncate,
    /// Recover the freelist and latest-root pointer from the front header.
    OpenExisting,
}

/// One backing device.
pub(crate) enum Device {
    File { file: File },
    Mem { data: Mutex<Vec<u8>> },
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::File { .. } => write!(f, "Device::File"),
            Device::Mem { .. } => write!(f, "Device::Mem"),
        }
    }
}

impl Device {
    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        match self {
            Device::File { file } => file.read_exact_at(buf, offset),
            Device::Mem { data } => {
                let data = data.lock().unwrap();
                let end = offset as usize + buf.len();
                if end > data.len() {
                    // Reads past the written frontier yield zeroes, the same
                    // as a freshly truncated file.
                    let have = data.len().saturating_sub(offset as usize);
                    buf[..have].copy_from_slice(&data[offset as usize..]);
                    buf[have..].fill(0);
                } else {
                    buf.copy_from_slice(&data[offset as usize..end]);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<()> {
        match self {
            Device::File { file } => file.write_all_at(src, offset),
            Device::Mem { data } => {
                let mut data = data.lock().unwrap();
                let end = offset as usize + src.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[offset as usize..end].copy_from_slice(src);
                Ok(())
            }
        }
    }
}

/// Physical location of a chunk: device index and slot within the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct PhysSlot {
    device: u32,
    slot: u32,
}

#[derive(Clone, Debug)]
struct ChunkInfo {
    phys: PhysSlot,
    list: ListKind,
    prev: Option<u32>,
    next: Option<u32>,
    write_offset: u64,
}

#[derive(Debug)]
struct ListMeta {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

#[derive(Debug)]
struct PoolState {
    chunks: AHashMap<u32, ChunkInfo>,
    lists: [ListMeta; 2],
    /// Free physical slots. Allocation pops the back (free list tail),
    /// reclaim pushes the front.
    free: std::collections::VecDeque<PhysSlot>,
    next_virtual: u32,
    generation: u64,
    latest_root: VirtualOffset,
    latest_version: u64,
    frontiers: [VirtualOffset; 2],
}

/// The pool of chunks across all backing devices.
pub struct ChunkPool {
    devices: Vec<Device>,
    chunk_size: u64,
    /// Chunks per device.
    slots_per_device: Vec<u32>,
    state: Mutex<PoolState>,
    /// Lock-free virtual-to-physical resolution for the read path:
    /// virtual chunk id -> (device index, byte base of the chunk).
    resolve: DashMap<u32, (u32, u64)>,
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("devices", &self.devices.len())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

fn device_base(device: u32, slot: u32, chunk_size: u64) -> u64 {
    let header = if device == 0 { FRONT_HEADER_SIZE } else { 0 };
    header + slot as u64 * chunk_size
}

impl ChunkPool {
    /// Open (or create) the pool. `paths` empty means a single in-memory
    /// device of `capacity` bytes.
    pub fn open(
        paths: &[PathBuf],
        capacity: u64,
        chunk_size: u64,
        mode: OpenMode,
    ) -> DbResult<Self> {
        assert!(chunk_size > CHUNK_HEADER_SIZE);
        let mut devices = Vec::new();
        if paths.is_empty() {
            devices.push(Device::Mem {
                data: Mutex::new(Vec::new()),
            });
        } else {
            for path in paths {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .map_err(DbError::io)?;
                let len = file.metadata().map_err(DbError::io)?.len();
                if len < capacity {
                    file.set_len(capacity).map_err(DbError::io)?;
                }
                devices.push(Device::File { file });
            }
        }
        let mut slots_per_device = Vec::with_capacity(devices.len());
        for (i, _) in devices.iter().enumerate() {
            let usable = if i == 0 {
                capacity.saturating_sub(FRONT_HEADER_SIZE)
            } else {
                capacity
            };
            let slots = (usable / chunk_size) as u32;
            if slots == 0 {
                return Err(DbError::Corruption {
                    offset: None,
                    reason: "device smaller than one chunk",
                });
            }
            slots_per_device.push(slots);
        }
        let total: u64 = slots_per_device.iter().map(|s| *s as u64).sum();
        if total >= (1 << CHUNK_ID_BITS) {
            return Err(DbError::Corruption {
                offset: None,
                reason: "more chunks than the id space admits",
            });
        }

        let pool = Self {
            devices,
            chunk_size,
            slots_per_device,
            state: Mutex::new(PoolState {
                chunks: AHashMap::new(),
                lists: [
                    ListMeta {
                        head: None,
                        tail: None,
                        len: 0,
                    },
                    ListMeta {
                        head: None,
                        tail: None,
                        len: 0,
                    },
                ],
                free: std::collections::VecDeque::new(),
                next_virtual: 0,
                generation: 0,
                latest_root: VirtualOffset::INVALID,
                latest_version: 0,
                frontiers: [VirtualOffset::INVALID; 2],
            }),
            resolve: DashMap::new(),
        };

        match mode {
            OpenMode::Truncate => pool.format()?,
            OpenMode::OpenExisting => pool.recover()?,
        }
        Ok(pool)
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Usable payload bytes of any chunk (the header page is reserved).
    pub fn chunk_capacity(&self) -> u64 {
        self.chunk_size - CHUNK_HEADER_SIZE
    }

    pub(crate) fn device(&self, index: u32) -> &Device {
        &self.devices[index as usize]
    }

    /// Resolve a virtual chunk id to `(device index, byte base)`. `None`
    /// means the chunk has been reclaimed, which a live reference never
    /// observes.
    pub fn resolve_chunk(&self, virtual_id: u32) -> Option<(u32, u64)> {
        self.resolve.get(&virtual_id).map(|r| *r.value())
    }

    fn phys_id(&self, phys: PhysSlot) -> u32 {
        let mut base = 0u32;
        for (i, n) in self.slots_per_device.iter().enumerate() {
            if i as u32 == phys.device {
                return base + phys.slot;
            }
            base += n;
        }
        unreachable!()
    }

    fn phys_from_id(&self, id: u32) -> PhysSlot {
        let mut rest = id;
        for (i, n) in self.slots_per_device.iter().enumerate() {
            if rest < *n {
                return PhysSlot {
                    device: i as u32,
                    slot: rest,
                };
            }
            rest -= n;
        }
        unreachable!("physical id out of range")
    }

    // ---- formatting & recovery ----------------------------------------

    fn format(&self) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        state.free.clear();
        for (d, n) in self.slots_per_device.iter().enumerate() {
            for slot in 0..*n {
                let phys = PhysSlot {
                    device: d as u32,
                    slot,
                };
                self.write_chunk_header_raw(phys, 0, NO_LINK, NO_LINK, 0, NO_LINK)?;
                state.free.push_back(phys);
            }
        }
        // Link the free chunks so recovery can walk them.
        self.link_free_headers(&state.free)?;
        drop(state);
        self.persist_header_sync()?;
        info!(target: "triedb::pool", "formatted pool");
        Ok(())
    }

    fn link_free_headers(
        &self,
        free: &std::collections::VecDeque<PhysSlot>,
    ) -> DbResult<()> {
        let ids: Vec<u32> = free.iter().map(|p| self.phys_id(*p)).collect();
        for (i, phys) in free.iter().enumerate() {
            let prev = if i == 0 { NO_LINK } else { ids[i - 1] };
            let next = if i + 1 == ids.len() {
                NO_LINK
            } else {
                ids[i + 1]
            };
            self.write_chunk_header_raw(*phys, 0, prev, next, 0, NO_LINK)?;
        }
        Ok(())
    }

    fn recover(&self) -> DbResult<()> {
        let record = self.read_front_header()?;
        let mut state = self.state.lock().unwrap();
        state.generation = record.generation;
        state.latest_root = record.latest_root;
        state.latest_version = record.latest_version;
        state.frontiers = record.frontiers;
        state.next_virtual = record.next_virtual;

        for (kind, head) in [
            (ListKind::Fast, record.heads[0]),
            (ListKind::Slow, record.heads[1]),
        ] {
            let mut phys_id = head;
            let mut prev_virt: Option<u32> = None;
            while phys_id != NO_LINK {
                let phys = self.phys_from_id(phys_id);
                let hdr = self.read_chunk_header(phys)?;
                if hdr.list_tag != kind.tag() {
                    return Err(DbError::Corruption {
                        offset: None,
                        reason: "list linkage points at chunk of another list",
                    });
                }
                let virt = hdr.virtual_id;
                let base = device_base(phys.device, phys.slot, self.chunk_size);
                self.resolve.insert(virt, (phys.device, base));
                state.chunks.insert(
                    virt,
                    ChunkInfo {
                        phys,
                        list: kind,
                        prev: prev_virt,
                        next: None,
                        write_offset: hdr.write_offset,
                    },
                );
                if let Some(p) = prev_virt {
                    state.chunks.get_mut(&p).unwrap().next = Some(virt);
                }
                let meta = &mut state.lists[kind.index()];
                if meta.head.is_none() {
                    meta.head = Some(virt);
                }
                meta.tail = Some(virt);
                meta.len += 1;
                prev_virt = Some(virt);
                phys_id = hdr.next;
            }
        }

        let mut phys_id = record.free_head;
        while phys_id != NO_LINK {
            let phys = self.phys_from_id(phys_id);
            let hdr = self.read_chunk_header(phys)?;
            if hdr.list_tag != 0 {
                return Err(DbError::Corruption {
                    offset: None,
                    reason: "free linkage points at listed chunk",
                });
            }
            state.free.push_back(phys);
            phys_id = hdr.next;
        }
        info!(
            target: "triedb::pool",
            generation = state.generation,
            version = state.latest_version,
            fast = state.lists[0].len,
            slow = state.lists[1].len,
            free = state.free.len(),
            "recovered pool"
        );
        Ok(())
    }

    // ---- chunk allocation & list maintenance --------------------------

    /// Take a chunk off the free list tail, append it to `list`, and return
    /// its fresh virtual id. Single-writer: only the upsert thread calls
    /// this.
    pub fn allocate_chunk(&self, list: ListKind) -> DbResult<u32> {
        let mut state = self.state.lock().unwrap();
        let phys = state.free.pop_back().ok_or(DbError::Corruption {
            offset: None,
            reason: "pool out of free chunks",
        })?;
        let virt = state.next_virtual;
        state.next_virtual = (state.next_virtual + 1) & ((1 << CHUNK_ID_BITS) - 1);
        let old_tail = state.lists[list.index()].tail;
        state.chunks.insert(
            virt,
            ChunkInfo {
                phys,
                list,
                prev: old_tail,
                next: None,
                write_offset: CHUNK_HEADER_SIZE,
            },
        );
        if let Some(t) = old_tail {
            state.chunks.get_mut(&t).unwrap().next = Some(virt);
        }
        let meta = &mut state.lists[list.index()];
        if meta.head.is_none() {
            meta.head = Some(virt);
        }
        meta.tail = Some(virt);
        meta.len += 1;
        let base = device_base(phys.device, phys.slot, self.chunk_size);
        self.resolve.insert(virt, (phys.device, base));
        // Persist linkage for recovery walks.
        let prev_phys = old_tail
            .map(|t| self.phys_id(state.chunks[&t].phys))
            .unwrap_or(NO_LINK);
        self.write_chunk_header_raw(phys, list.tag(), prev_phys, NO_LINK, CHUNK_HEADER_SIZE, virt)?;
        if let Some(t) = old_tail {
            let info = state.chunks[&t].clone();
            self.persist_chunk_header(&state, t, &info)?;
        }
        debug!(target: "triedb::pool", chunk = virt, list = ?list, "allocated chunk");
        Ok(virt)
    }

    /// Remove a (fully reclaimed) chunk from its list and return its
    /// physical slot to the free-list head.
    pub fn release_chunk(&self, virtual_id: u32) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        let info = state.chunks.remove(&virtual_id).ok_or(DbError::Corruption {
            offset: None,
            reason: "releasing unknown chunk",
        })?;
        self.resolve.remove(&virtual_id);
        if let Some(p) = info.prev {
            state.chunks.get_mut(&p).unwrap().next = info.next;
        }
        if let Some(n) = info.next {
            state.chunks.get_mut(&n).unwrap().prev = info.prev;
        }
        let meta = &mut state.lists[info.list.index()];
        if meta.head == Some(virtual_id) {
            meta.head = info.next;
        }
        if meta.tail == Some(virtual_id) {
            meta.tail = info.prev;
        }
        meta.len -= 1;
        state.free.push_front(info.phys);
        if let Some(p) = info.prev {
            let pi = state.chunks[&p].clone();
            self.persist_chunk_header(&state, p, &pi)?;
        }
        if let Some(n) = info.next {
            let ni = state.chunks[&n].clone();
            self.persist_chunk_header(&state, n, &ni)?;
        }
        // Freed chunk becomes the new free head.
        let next_free = state
            .free
            .get(1)
            .map(|p| self.phys_id(*p))
            .unwrap_or(NO_LINK);
        self.write_chunk_header_raw(info.phys, 0, NO_LINK, next_free, 0, NO_LINK)?;
        debug!(target: "triedb::pool", chunk = virtual_id, "released chunk");
        Ok(())
    }

    /// Virtual id at the head (oldest end) of `list`, with its sealed write
    /// offset. Compaction thresholds come from here.
    pub fn list_head(&self, list: ListKind) -> Option<(u32, u64)> {
        let state = self.state.lock().unwrap();
        let head = state.lists[list.index()].head?;
        Some((head, state.chunks[&head].write_offset))
    }

    pub fn list_len(&self, list: ListKind) -> usize {
        self.state.lock().unwrap().lists[list.index()].len
    }

    pub fn free_chunks(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    /// Physical id at the free-list tail, where the next allocation comes
    /// from.
    pub fn free_list_end(&self) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.free.back().map(|p| self.phys_id(*p))
    }

    pub fn frontier(&self, list: ListKind) -> VirtualOffset {
        self.state.lock().unwrap().frontiers[list.index()]
    }

    pub fn set_frontier(&self, list: ListKind, at: VirtualOffset) {
        let mut state = self.state.lock().unwrap();
        state.frontiers[list.index()] = at;
        if at.is_valid() {
            if let Some(info) = state.chunks.get_mut(&at.chunk_id()) {
                info.write_offset = at.offset();
            }
        }
    }

    /// Seal the current chunk of `list` at `write_offset` (chunk is full).
    pub fn seal_chunk(&self, virtual_id: u32, write_offset: u64) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(info) = state.chunks.get_mut(&virtual_id) {
            info.write_offset = write_offset;
            let info = info.clone();
            self.persist_chunk_header(&state, virtual_id, &info)?;
        }
        Ok(())
    }

    pub fn latest_root(&self) -> (VirtualOffset, u64) {
        let state = self.state.lock().unwrap();
        (state.latest_root, state.latest_version)
    }

    pub fn set_latest_root(&self, root: VirtualOffset, version: u64) {
        let mut state = self.state.lock().unwrap();
        state.latest_root = root;
        state.latest_version = version;
    }

    // ---- header persistence -------------------------------------------

    /// Serialize the current metadata record and write it to the replica
    /// slot selected by the bumped generation. The caller sequences this
    /// behind a write barrier.
    pub fn persist_header_sync(&self) -> DbResult<()> {
        let (bytes, replica) = {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            let bytes = self.encode_header(&state);
            (bytes, (state.generation % 2) * HEADER_REPLICA_SIZE)
        };
        self.devices[0]
            .write_at(replica, &bytes)
            .map_err(DbError::io)
    }

    fn encode_header(&self, state: &PoolState) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(&HEADER_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&state.generation.to_le_bytes());
        encode_offset16(&mut out, state.latest_root);
        encode_offset16(&mut out, state.frontiers[0]);
        encode_offset16(&mut out, state.frontiers[1]);
        for kind in [ListKind::Fast, ListKind::Slow] {
            let meta = &state.lists[kind.index()];
            for end in [meta.head, meta.tail] {
                let phys = end
                    .map(|v| self.phys_id(state.chunks[&v].phys))
                    .unwrap_or(NO_LINK);
                out.extend_from_slice(&phys.to_le_bytes());
            }
        }
        let free_head = state
            .free
            .front()
            .map(|p| self.phys_id(*p))
            .unwrap_or(NO_LINK);
        let free_tail = state
            .free
            .back()
            .map(|p| self.phys_id(*p))
            .unwrap_or(NO_LINK);
        out.extend_from_slice(&free_head.to_le_bytes());
        out.extend_from_slice(&free_tail.to_le_bytes());
        out.extend_from_slice(&state.next_virtual.to_le_bytes());
        out.extend_from_slice(&state.latest_version.to_le_bytes());
        let checksum = keccak256(&out);
        out.extend_from_slice(&checksum[..8]);
        out
    }

    fn read_front_header(&self) -> DbResult<HeaderRecord> {
        let mut best: Option<HeaderRecord> = None;
        for replica in 0..2u64 {
            let mut buf = vec![0u8; 128];
            if self.devices[0]
                .read_at(replica * HEADER_REPLICA_SIZE, &mut buf)
                .is_err()
            {
                continue;
            }
            if let Some(rec) = decode_header(&buf) {
                if best.as_ref().map_or(true, |b| rec.generation > b.generation) {
                    best = Some(rec);
                }
            }
        }
        best.ok_or(DbError::Corruption {
            offset: None,
            reason: "no valid front header replica",
        })
    }

    // ---- chunk headers ------------------------------------------------

    fn persist_chunk_header(
        &self,
        state: &PoolState,
        virt: u32,
        info: &ChunkInfo,
    ) -> DbResult<()> {
        let prev = info
            .prev
            .map(|v| self.phys_id(state.chunks[&v].phys))
            .unwrap_or(NO_LINK);
        let next = info
            .next
            .map(|v| self.phys_id(state.chunks[&v].phys))
            .unwrap_or(NO_LINK);
        self.write_chunk_header_raw(
            info.phys,
            info.list.tag(),
            prev,
            next,
            info.write_offset,
            virt,
        )
    }

    fn write_chunk_header_raw(
        &self,
        phys: PhysSlot,
        list_tag: u8,
        prev: u32,
        next: u32,
        write_offset: u64,
        virtual_id: u32,
    ) -> DbResult<()> {
        let mut out = Vec::with_capacity(32);
        out.push(list_tag);
        out.extend_from_slice(&prev.to_le_bytes());
        out.extend_from_slice(&next.to_le_bytes());
        out.extend_from_slice(&write_offset.to_le_bytes());
        out.extend_from_slice(&virtual_id.to_le_bytes());
        let checksum = keccak256(&out);
        out.extend_from_slice(&checksum[..8]);
        let base = device_base(phys.device, phys.slot, self.chunk_size);
        self.devices[phys.device as usize]
            .write_at(base, &out)
            .map_err(DbError::io)
    }

    fn read_chunk_header(&self, phys: PhysSlot) -> DbResult<ChunkHeader> {
        let base = device_base(phys.device, phys.slot, self.chunk_size);
        let mut buf = [0u8; 29];
        self.devices[phys.device as usize]
            .read_at(base, &mut buf)
            .map_err(DbError::io)?;
        let checksum = keccak256(&buf[..21]);
        if checksum[..8] != buf[21..29] {
            return Err(DbError::Corruption {
                offset: None,
                reason: "chunk header checksum mismatch",
            });
        }
        Ok(ChunkHeader {
            list_tag: buf[0],
            next: u32::from_le_bytes(buf[5..9].try_into().unwrap()),
            write_offset: u64::from_le_bytes(buf[9..17].try_into().unwrap()),
            virtual_id: u32::from_le_bytes(buf[17..21].try_into().unwrap()),
        })
    }
}

struct ChunkHeader {
    list_tag: u8,
    next: u32,
    write_offset: u64,
    virtual_id: u32,
}

struct HeaderRecord {
    generation: u64,
    latest_root: VirtualOffset,
    latest_version: u64,
    frontiers: [VirtualOffset; 2],
    heads: [u32; 2],
    free_head: u32,
    next_virtual: u32,
}

fn encode_offset16(out: &mut Vec<u8>, off: VirtualOffset) {
    if !off.is_valid() {
        // All-ones chunk id marks the absent offset.
        out.extend_from_slice(&u32::MAX.to_le_bytes());
        out.extend_from_slice(&[0u8; 12]);
        return;
    }
    out.extend_from_slice(&off.chunk_id().to_le_bytes());
    out.extend_from_slice(&off.offset().to_le_bytes());
    out.extend_from_slice(&off.spare_pages().to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);
}

fn decode_offset16(buf: &[u8]) -> VirtualOffset {
    let chunk = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let offset = u64::from_le_bytes(buf[4..12].try_into().unwrap());
    let spare = u16::from_le_bytes(buf[12..14].try_into().unwrap());
    if chunk == u32::MAX {
        VirtualOffset::INVALID
    } else {
        VirtualOffset::new(chunk, offset, spare)
    }
}

fn decode_header(buf: &[u8]) -> Option<HeaderRecord> {
    // magic 8 + version 4 + generation 8 + 3*offset16 + 6*list links 4
    // + next_virtual 4 + latest_version 8 + checksum 8
    const LEN: usize = 8 + 4 + 8 + 48 + 24 + 4 + 8 + 8;
    if buf.len() < LEN || buf[..8] != HEADER_MAGIC {
        return None;
    }
    let body = &buf[..LEN - 8];
    let checksum = keccak256(body);
    if checksum[..8] != buf[LEN - 8..LEN] {
        return None;
    }
    let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if version != FORMAT_VERSION {
        return None;
    }
    let generation = u64::from_le_bytes(buf[12..20].try_into().unwrap());
    let latest_root = decode_offset16(&buf[20..36]);
    let fast = decode_offset16(&buf[36..52]);
    let slow = decode_offset16(&buf[52..68]);
    let fast_head = u32::from_le_bytes(buf[68..72].try_into().unwrap());
    let slow_head = u32::from_le_bytes(buf[76..80].try_into().unwrap());
    let free_head = u32::from_le_bytes(buf[84..88].try_into().unwrap());
    let next_virtual = u32::from_le_bytes(buf[92..96].try_into().unwrap());
    let latest_version = u64::from_le_bytes(buf[96..104].try_into().unwrap());
    Some(HeaderRecord {
        generation,
        latest_root,
        latest_version,
        frontiers: [fast, slow],
        heads: [fast_head, slow_head],
        free_head,
        next_virtual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_pool() -> ChunkPool {
        ChunkPool::open(&[], 1 << 22, 1 << 16, OpenMode::Truncate).unwrap()
    }

    #[test]
    fn allocate_and_release() {
        let pool = mem_pool();
        let free_before = pool.free_chunks();
        let a = pool.allocate_chunk(ListKind::Fast).unwrap();
        let b = pool.allocate_chunk(ListKind::Fast).unwrap();
        assert_eq!(pool.list_len(ListKind::Fast), 2);
        assert_eq!(pool.free_chunks(), free_before - 2);
        assert_eq!(pool.list_head(ListKind::Fast).unwrap().0, a);
        pool.release_chunk(a).unwrap();
        assert_eq!(pool.list_head(ListKind::Fast).unwrap().0, b);
        assert_eq!(pool.free_chunks(), free_before - 1);
        // Reclaimed chunks go to the head; allocation keeps coming from the
        // far end.
        assert!(pool.free_list_end().is_some());
        // Virtual ids are never reused by the next allocation.
        let c = pool.allocate_chunk(ListKind::Slow).unwrap();
        assert!(c > b);
    }

    #[test]
    fn header_survives_reopen() {
        let dir = std::env::temp_dir().join(format!(
            "triedb-pool-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dev0");
        {
            let pool = ChunkPool::open(
                &[path.clone()],
                1 << 22,
                1 << 16,
                OpenMode::Truncate,
            )
            .unwrap();
            let chunk = pool.allocate_chunk(ListKind::Fast).unwrap();
            let root = VirtualOffset::new(chunk, CHUNK_HEADER_SIZE, 1);
            pool.set_frontier(ListKind::Fast, VirtualOffset::new(chunk, 8192, 0));
            pool.set_latest_root(root, 42);
            pool.persist_header_sync().unwrap();
        }
        {
            let pool = ChunkPool::open(
                &[path.clone()],
                1 << 22,
                1 << 16,
                OpenMode::OpenExisting,
            )
            .unwrap();
            let (root, version) = pool.latest_root();
            assert_eq!(version, 42);
            assert!(root.is_valid());
            assert_eq!(pool.list_len(ListKind::Fast), 1);
            assert_eq!(pool.frontier(ListKind::Fast).offset(), 8192);
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
