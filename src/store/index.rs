//! The index store: maps log index to the byte position of the item frame
//! in the log segment stream. Slots are fixed-width (position, CRC32C over
//! index and position, padding) in fixed-size hex-named segment files with
//! the same header discipline as the log. Slot writes lag log writes; the
//! flush fiber batches them to disk, and the appender applies backpressure
//! via wait_flush once too many slots are pending. The persisted commit
//! index never runs ahead of flushed slots, so restart recovery can resolve
//! every index at or below it from disk.

use super::segment::{allocate_file, SEGMENT_HEADER_SIZE};
use crate::errdata;
use crate::error::{Error, Result};
use crate::fiber::{Condition, Ctx, FiberFuture, Frame, Input, IoHandle, Step};
use crate::raft::item::Index;

use log::{debug, warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// The fixed slot width: position(8) | crc32c(4) | padding(4).
pub const SLOT_SIZE: u64 = 16;

/// How many slots may lag on disk before the appender is backpressured.
const MAX_PENDING_SLOTS: u64 = 16384;

/// How many slots a single flush writes at most.
const FLUSH_BATCH_SLOTS: u64 = 4096;

/// How long to wait before retrying a failed slot write.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

struct IdxFile {
    /// The first slot ordinal stored in this file.
    first_slot: u64,
    path: PathBuf,
    file: Arc<std::fs::File>,
}

/// The index store. Positions since startup are mirrored in memory (ring
/// buffer with base index); older lookups fall back to positioned slot
/// reads, which hit the page cache in practice.
pub struct IdxOps {
    dir: PathBuf,
    segment_size: u64,
    slots_per_segment: u64,
    files: VecDeque<IdxFile>,
    io: IoHandle,
    mem_base: Index,
    mem: VecDeque<u64>,
    /// The last index whose slot is durably on disk.
    flushed: Index,
    pub work: Condition,
    pub flushed_cond: Condition,
    closed: bool,
}

impl IdxOps {
    /// Opens the index directory, scanning existing slot segments. The
    /// given flushed index is the persisted commit index: every slot at or
    /// below it is durable from the previous run.
    pub fn open(
        dir: impl Into<PathBuf>,
        segment_size: u64,
        flushed: Index,
        io: IoHandle,
    ) -> Result<Self> {
        assert!(segment_size.is_power_of_two(), "index segment size must be a power of two");
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let slots_per_segment = (segment_size - SEGMENT_HEADER_SIZE) / SLOT_SIZE;

        let mut starts = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(hex) = name.strip_suffix(".if") else { continue };
            let Ok(start) = u64::from_str_radix(hex, 16) else {
                return errdata!("unexpected file {name} in index dir");
            };
            starts.push(start);
        }
        starts.sort_unstable();

        let mut files = VecDeque::new();
        for start in starts {
            let path = dir.join(format!("{start:016x}.if"));
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            if file.metadata()?.len() != segment_size {
                return errdata!("index segment {path:?} has wrong length");
            }
            let ordinal = start / segment_size;
            files.push_back(IdxFile {
                first_slot: ordinal * slots_per_segment,
                path,
                file: Arc::new(file),
            });
            debug!("opened index segment {start:016x}.if");
        }

        Ok(Self {
            dir,
            segment_size,
            slots_per_segment,
            files,
            io,
            mem_base: 0,
            mem: VecDeque::new(),
            flushed,
            work: Condition::new("idx-work"),
            flushed_cond: Condition::new("idx-flushed"),
            closed: false,
        })
    }

    /// The slot ordinal of a log index. Index 1 is slot 0.
    fn slot_of(index: Index) -> u64 {
        index - 1
    }

    /// Records the byte position of an item. Positions arrive in index
    /// order; re-putting an index at or below the last one truncates the
    /// in-memory tail first (conflict overwrite).
    pub fn put(&mut self, index: Index, pos: u64) {
        assert!(index > 0, "index must be > 0");
        if self.mem.is_empty() {
            self.mem_base = index;
            self.mem.push_back(pos);
            return;
        }
        let next = self.mem_base + self.mem.len() as u64;
        if index < next {
            assert!(index >= self.mem_base, "index put below memory base");
            self.truncate_from(index);
            if self.mem.is_empty() {
                self.mem_base = index;
            }
        } else {
            assert_eq!(index, next, "index put gap at {index}");
        }
        self.mem.push_back(pos);
    }

    /// Looks up the position of an index, from memory or from a durable
    /// slot. Returns None if unknown.
    pub fn lookup(&self, index: Index) -> Option<u64> {
        if index == 0 {
            return None;
        }
        if !self.mem.is_empty() && index >= self.mem_base {
            let offset = (index - self.mem_base) as usize;
            return self.mem.get(offset).copied();
        }
        self.read_slot(index).unwrap_or_else(|error| {
            warn!("index slot read failed for {index}: {error}");
            None
        })
    }

    fn read_slot(&self, index: Index) -> Result<Option<u64>> {
        let slot = Self::slot_of(index);
        let Some(file) = self.file_of_slot(slot) else { return Ok(None) };
        let offset = SEGMENT_HEADER_SIZE + (slot - file.first_slot) * SLOT_SIZE;
        let mut buf = [0u8; SLOT_SIZE as usize];
        file.file.read_exact_at(&mut buf, offset)?;
        if buf == [0u8; SLOT_SIZE as usize] {
            return Ok(None);
        }
        let pos = u64::from_be_bytes(buf[0..8].try_into().expect("sliced 8"));
        let crc = u32::from_be_bytes(buf[8..12].try_into().expect("sliced 4"));
        if crc != slot_crc(index, pos) {
            return errdata!("index slot crc mismatch at {index}");
        }
        Ok(Some(pos))
    }

    fn file_of_slot(&self, slot: u64) -> Option<&IdxFile> {
        self.files.iter().find(|f| slot >= f.first_slot && slot < f.first_slot + self.slots_per_segment)
    }

    /// Discards in-memory positions at and above the given index, after a
    /// log conflict truncation.
    pub fn truncate_from(&mut self, index: Index) {
        if self.mem.is_empty() || index < self.mem_base {
            self.mem.clear();
            self.mem_base = 0;
        } else {
            self.mem.truncate((index - self.mem_base) as usize);
        }
        self.flushed = self.flushed.min(index.saturating_sub(1));
    }

    /// The last index whose slot is durable.
    pub fn flushed(&self) -> Index {
        self.flushed
    }

    /// The last index recorded, durable or not. 0 if nothing is in memory.
    pub fn last_index(&self) -> Index {
        if self.mem.is_empty() {
            return self.flushed;
        }
        self.mem_base + self.mem.len() as u64 - 1
    }

    /// Returns whether the appender should wait for a flush before pushing
    /// more items.
    pub fn needs_flush(&self) -> bool {
        self.last_index().saturating_sub(self.flushed) > MAX_PENDING_SLOTS
    }

    /// Drops whole index segments whose slots all precede the first
    /// required index, after a snapshot truncates the log head.
    pub fn delete_to(&mut self, first_required: Index) -> Result<()> {
        let required_slot = Self::slot_of(first_required.max(1));
        while let Some(first) = self.files.front() {
            if first.first_slot + self.slots_per_segment > required_slot {
                break;
            }
            let file = self.files.pop_front().expect("index file underflow");
            debug!("deleting index segment {:?}", file.path);
            std::fs::remove_file(&file.path)?;
        }
        Ok(())
    }

    pub fn close(&mut self, ctx: &mut Ctx) {
        self.closed = true;
        self.work.signal_all(ctx);
        self.flushed_cond.signal_all(ctx);
    }

    /// Collects the next batch of unflushed slots, bounded by the batch
    /// size and the owning segment's boundary so one write never spans
    /// segments. Returns (first index, encoded buffer) or None.
    fn next_batch(&self) -> Option<(Index, Vec<u8>)> {
        let last = self.last_index();
        if self.flushed >= last || self.mem.is_empty() {
            return None;
        }
        let first = (self.flushed + 1).max(self.mem_base);
        let first_slot = Self::slot_of(first);
        let segment_end_slot = (first_slot / self.slots_per_segment + 1) * self.slots_per_segment;
        let count = (last - first + 1)
            .min(FLUSH_BATCH_SLOTS)
            .min(segment_end_slot - first_slot);

        let mut buf = Vec::with_capacity((count * SLOT_SIZE) as usize);
        for index in first..first + count {
            let pos = self.mem[(index - self.mem_base) as usize];
            buf.extend_from_slice(&pos.to_be_bytes());
            buf.extend_from_slice(&slot_crc(index, pos).to_be_bytes());
            buf.extend_from_slice(&[0u8; 4]);
        }
        Some((first, buf))
    }

    /// The segment file start offset owning the given slot.
    fn segment_start_of_slot(&self, slot: u64) -> u64 {
        (slot / self.slots_per_segment) * self.segment_size
    }
}

fn slot_crc(index: Index, pos: u64) -> u32 {
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&index.to_be_bytes());
    bytes[8..16].copy_from_slice(&pos.to_be_bytes());
    crc32c::crc32c(&bytes)
}

/// The index flush fiber: waits for pending slots, ensures the owning
/// segment exists, writes the batch on the IO executor, and signals the
/// flushed condition for appender backpressure and commit persistence.
pub struct IdxFlushFiber {
    idx: Rc<RefCell<IdxOps>>,
    state: FlushState,
}

enum FlushState {
    Idle,
    Allocating { first: Index, buf: Vec<u8> },
    Writing { first: Index, count: u64 },
}

impl IdxFlushFiber {
    pub fn new(idx: Rc<RefCell<IdxOps>>) -> Self {
        Self { idx, state: FlushState::Idle }
    }

    /// Submits the batch write once the owning segment exists.
    fn write_batch(
        &mut self,
        ctx: &mut Ctx,
        first: Index,
        buf: Vec<u8>,
    ) -> Result<Step> {
        let idx = self.idx.borrow();
        let slot = IdxOps::slot_of(first);
        let file = idx.file_of_slot(slot).expect("missing index segment for flush");
        let offset = SEGMENT_HEADER_SIZE + (slot - file.first_slot) * SLOT_SIZE;
        let handle = file.file.clone();
        let count = buf.len() as u64 / SLOT_SIZE;

        let future = FiberFuture::<()>::new();
        drop(idx);
        let completer = future.completer(ctx);
        self.idx.borrow().io.execute(move || {
            let result = handle
                .write_all_at(&buf, offset)
                .and_then(|()| handle.sync_data())
                .map_err(Error::from);
            completer.complete(result);
        });
        self.state = FlushState::Writing { first, count };
        Ok(future.wait())
    }
}

impl Frame for IdxFlushFiber {
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step> {
        match std::mem::replace(&mut self.state, FlushState::Idle) {
            FlushState::Idle => {
                let idx = self.idx.borrow();
                if idx.closed || ctx.is_stopping() {
                    return Ok(Step::done());
                }
                match idx.next_batch() {
                    Some((first, buf)) => {
                        let slot = IdxOps::slot_of(first);
                        if idx.file_of_slot(slot).is_some() {
                            drop(idx);
                            self.write_batch(ctx, first, buf)
                        } else {
                            // Allocate the owning segment on the IO executor.
                            let start = idx.segment_start_of_slot(slot);
                            let path = idx.dir.join(format!("{start:016x}.if"));
                            let size = idx.segment_size;
                            let io = idx.io.clone();
                            drop(idx);
                            let future = FiberFuture::<Arc<std::fs::File>>::new();
                            let completer = future.completer(ctx);
                            io.submit(completer, move || allocate_file(&path, size));
                            self.state = FlushState::Allocating { first, buf };
                            Ok(future.wait())
                        }
                    }
                    None => {
                        let work = idx.work.clone();
                        drop(idx);
                        Ok(work.wait())
                    }
                }
            }
            FlushState::Allocating { first, buf } => {
                let file = input.take::<Arc<std::fs::File>>()?;
                let mut idx = self.idx.borrow_mut();
                let slot = IdxOps::slot_of(first);
                let start = idx.segment_start_of_slot(slot);
                let first_slot = (start / idx.segment_size) * idx.slots_per_segment;
                let path = idx.dir.join(format!("{start:016x}.if"));
                idx.files.push_back(IdxFile { first_slot, path, file });
                drop(idx);
                self.write_batch(ctx, first, buf)
            }
            FlushState::Writing { first, count } => {
                let mut idx = self.idx.borrow_mut();
                // The batch may have been truncated by a conflict while the
                // write was in flight; never advance past the current tail.
                let flushed = (first + count - 1).min(idx.last_index());
                if flushed > idx.flushed {
                    idx.flushed = flushed;
                }
                let cond = idx.flushed_cond.clone();
                drop(idx);
                cond.signal_all(ctx);
                Ok(Step::Again)
            }
        }
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(Step::done());
        }
        warn!("index flush failed, retrying in {RETRY_INTERVAL:?}: {error}");
        self.state = FlushState::Idle;
        Ok(Step::Sleep(RETRY_INTERVAL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::IoExecutor;

    fn idx(dir: &std::path::Path, flushed: Index) -> (IdxOps, IoExecutor) {
        let io = IoExecutor::new("test-io", 1);
        let ops = IdxOps::open(dir, 4096, flushed, io.handle()).expect("open failed");
        (ops, io)
    }

    #[test]
    fn put_lookup_truncate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ops, io) = idx(dir.path(), 0);

        ops.put(1, 64);
        ops.put(2, 100);
        ops.put(3, 200);
        assert_eq!(ops.lookup(2), Some(100));
        assert_eq!(ops.last_index(), 3);

        // Conflict overwrite truncates the tail.
        ops.put(2, 128);
        assert_eq!(ops.lookup(2), Some(128));
        assert_eq!(ops.lookup(3), None);
        assert_eq!(ops.last_index(), 2);

        io.stop();
    }

    #[test]
    fn slot_crc_covers_index_and_pos() {
        assert_ne!(slot_crc(1, 64), slot_crc(2, 64));
        assert_ne!(slot_crc(1, 64), slot_crc(1, 65));
    }

    #[test]
    fn durable_slot_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ops, io) = idx(dir.path(), 0);

        // Write a slot the way the flush fiber does, then read it back via
        // the disk path by clearing the memory mirror.
        ops.put(1, 4242);
        let (first, buf) = ops.next_batch().expect("batch");
        assert_eq!(first, 1);
        let path = dir.path().join(format!("{:016x}.if", 0));
        let file = allocate_file(&path, 4096)?;
        file.write_all_at(&buf, SEGMENT_HEADER_SIZE)?;
        drop(ops);
        drop(file);

        let (ops, io2) = idx(dir.path(), 1);
        assert_eq!(ops.lookup(1), Some(4242));
        assert_eq!(ops.lookup(2), None);
        io.stop();
        io2.stop();
        Ok(())
    }
}
