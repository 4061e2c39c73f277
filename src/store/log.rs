//! The Raft log facade over the segment store: open with crash recovery,
//! append via the tail cache and appender pipeline, batched reads for
//! apply and replication, tail truncation for conflict resolution, and
//! head garbage collection after snapshots.

use super::appender::{AppendCallback, LogAppender};
use super::frame::{self, ITEM_HEADER_SIZE};
use super::index::{IdxFlushFiber, IdxOps};
use super::restorer;
use super::segment::{SegmentQueue, SegmentSnapshot, SEGMENT_HEADER_SIZE};
use super::status::StatusValues;
use super::StoreOptions;
use crate::errinput;
use crate::error::Result;
use crate::fiber::{Ctx, FiberFuture, IoHandle};
use crate::raft::item::{Index, LogItem, TailCache, Term};

use log::info;
use std::cell::RefCell;
use std::rc::Rc;

/// The Raft log store for one group.
pub struct RaftLog {
    pub segs: Rc<RefCell<SegmentQueue>>,
    pub idx: Rc<RefCell<IdxOps>>,
    pub appender: Rc<RefCell<LogAppender>>,
    io: IoHandle,
    /// The first index still available in the log; earlier segments have
    /// been garbage collected after a snapshot.
    pub first_index: Index,
    /// The term of the entry preceding first_index (the snapshot
    /// boundary), or 0 when the log starts at 1.
    pub first_term: Term,
}

impl RaftLog {
    /// Opens the log, running crash recovery from the persisted commit
    /// position. Returns the log plus the restored (lastIndex, lastTerm).
    pub fn open(
        opts: Rc<StoreOptions>,
        io: IoHandle,
        cache: Rc<RefCell<TailCache>>,
        callback: AppendCallback,
        status: &StatusValues,
    ) -> Result<(Self, Index, Term)> {
        let first_index = status.first_index.max(1);
        let mut segs =
            SegmentQueue::open(opts.dir.join("log"), opts.segment_size, ".lf")?;
        let mut idx = IdxOps::open(
            opts.dir.join("idx"),
            opts.index_segment_size,
            status.commit_index,
            io.clone(),
        )?;
        let restored = restorer::restore(
            &mut segs,
            &mut idx,
            status.commit_index,
            status.commit_index_pos,
            first_index,
        )?;
        if restored.truncated {
            info!("log truncated during restore, resuming at {:#x}", restored.next_pos);
        }

        let segs = Rc::new(RefCell::new(segs));
        let idx = Rc::new(RefCell::new(idx));
        let mut appender = LogAppender::new(
            opts.clone(),
            segs.clone(),
            idx.clone(),
            cache,
            io.clone(),
            callback,
        );
        appender.set_next(restored.last_index + 1, restored.next_pos);

        let log = Self {
            segs,
            idx,
            appender: Rc::new(RefCell::new(appender)),
            io,
            first_index,
            first_term: status.first_term,
        };
        Ok((log, restored.last_index, restored.last_term))
    }

    /// Starts the store fibers: append, write-result, fsync, index flush.
    pub fn start(&self, ctx: &mut Ctx) {
        super::appender::start_fibers(ctx, &self.appender);
        ctx.spawn("idx-flush", Box::new(IdxFlushFiber::new(self.idx.clone())));
    }

    pub fn close(&self, ctx: &mut Ctx) {
        self.appender.borrow_mut().close(ctx);
        self.idx.borrow_mut().close(ctx);
    }

    /// Loads up to max_items (or max_bytes) contiguous items from the given
    /// index, bounded by the durable last index. Reads run on the IO
    /// executor; the future completes on the dispatcher.
    pub fn load(
        &self,
        ctx: &mut Ctx,
        from: Index,
        last: Index,
        max_items: usize,
        max_bytes: u64,
    ) -> Result<FiberFuture<Vec<LogItem>>> {
        let Some(pos) = self.idx.borrow().lookup(from) else {
            return errinput!("log index {from} is not available");
        };
        let snapshot = self.segs.borrow().snapshot();
        let future = FiberFuture::new();
        let completer = future.completer(ctx);
        self.io.submit(completer, move || {
            read_items(&snapshot, pos, from, last, max_items, max_bytes)
        });
        Ok(future)
    }

    /// Truncates the log tail so the next appended item lands at the given
    /// index. The write pipeline must be drained first (WaitWriteFinished).
    pub fn truncate_tail(&self, index: Index) -> Result<()> {
        assert!(index >= self.first_index, "truncating below first index");
        let mut appender = self.appender.borrow_mut();
        let mut idx = self.idx.borrow_mut();
        if index < appender.next_persist_index {
            let Some(pos) = idx.lookup(index) else {
                return errinput!("truncation index {index} has no position");
            };
            info!("truncating log tail from index {index} at {pos:#x}");
            appender.set_next(index, pos);
        }
        idx.truncate_from(index);
        Ok(())
    }

    /// Deletes whole segments whose items all precede the first required
    /// index, after a snapshot. Stops at the first retained or in-use
    /// segment.
    pub fn delete_to(&mut self, first_required: Index) -> Result<()> {
        loop {
            let segs = self.segs.borrow();
            // A segment's last index is bounded by the next segment's first
            // item; without a successor (or its metadata) it must stay.
            let (deletable, in_use) = match (segs.first(), segs.get(segs.first().map_or(0, |f| f.end_pos))) {
                (Some(first), Some(next)) => (
                    next.first_index != 0 && next.first_index <= first_required,
                    first.use_count > 0,
                ),
                _ => (false, false),
            };
            drop(segs);
            if !deletable || in_use {
                break;
            }
            self.segs.borrow_mut().delete_first()?;
        }
        self.idx.borrow_mut().delete_to(first_required)?;
        self.first_index = self.first_index.max(first_required);
        Ok(())
    }
}

/// Sequentially decodes items from a segment snapshot, following segment
/// rolls, until the index, item, or byte bound is hit.
fn read_items(
    snapshot: &SegmentSnapshot,
    start_pos: u64,
    from: Index,
    last: Index,
    max_items: usize,
    max_bytes: u64,
) -> Result<Vec<LogItem>> {
    let size = snapshot.segment_size();
    let mut items = Vec::new();
    let mut pos = start_pos;
    let mut bytes = 0;
    let mut next_index = from;

    while next_index <= last && items.len() < max_items && bytes < max_bytes {
        // Roll into the next segment when no header fits in this one, and
        // skip the reserved header region after an exact-fill boundary.
        let offset = pos & (size - 1);
        if offset < SEGMENT_HEADER_SIZE {
            pos = snapshot.base_of(pos) + SEGMENT_HEADER_SIZE;
        } else if offset + ITEM_HEADER_SIZE as u64 > size {
            pos = snapshot.base_of(pos) + size + SEGMENT_HEADER_SIZE;
        }
        if !snapshot.contains(pos) {
            break;
        }
        let mut header_buf = [0u8; ITEM_HEADER_SIZE];
        snapshot.read_at(pos, &mut header_buf)?;
        let header = frame::decode_header(&header_buf);
        if header.is_end_sentinel() {
            // Terminal zero header: the stream continues after the next
            // segment's reserved header.
            pos = snapshot.base_of(pos) + size + SEGMENT_HEADER_SIZE;
            continue;
        }
        if header.crc != frame::header_crc(&header_buf) {
            return crate::errdata!("log item header crc mismatch at {pos:#x}");
        }
        if header.index != next_index {
            return crate::errdata!("log item index {} != {next_index} at {pos:#x}", header.index);
        }
        frame::validate_header(&header)?;

        let mut rest = vec![0u8; header.total_len as usize - ITEM_HEADER_SIZE];
        snapshot.read_at(pos + ITEM_HEADER_SIZE as u64, &mut rest)?;
        items.push(frame::decode_sections(&header, &rest)?);

        bytes += header.total_len as u64;
        pos += header.total_len as u64;
        next_index += 1;
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{Dispatcher, IoExecutor};
    use crate::raft::item::{ItemType, RaftTask};

    use std::path::Path;
    use std::time::Duration;

    fn options(dir: &Path) -> Rc<StoreOptions> {
        let mut opts = StoreOptions::new(dir);
        opts.segment_size = 64 * 1024;
        opts.index_segment_size = 4096;
        Rc::new(opts)
    }

    fn item(index: Index, term: Term, prev: Term, body: &[u8]) -> LogItem {
        let mut item = LogItem::new(ItemType::Normal, index, term, prev);
        item.body = body.to_vec();
        item
    }

    /// Appends items through the full fiber pipeline, waiting for them to
    /// become durable, then stops the dispatcher.
    fn append_durably(dir: &Path, items: Vec<LogItem>) {
        let io = IoExecutor::new("test-io", 2);
        let dispatcher = Dispatcher::new("test-dispatcher");
        let (durable_tx, durable_rx) = crossbeam::channel::unbounded();
        let last = items.last().map(|i| i.index).expect("no items");

        let opts = (*options(dir)).clone();
        let io_handle = io.handle();
        dispatcher
            .create_group(1, "test-group", move |ctx| {
                let opts = Rc::new(opts);
                let cache = Rc::new(RefCell::new(TailCache::new()));
                let callback: AppendCallback = Rc::new(move |_: &mut Ctx, term, index| {
                    durable_tx.send((term, index)).expect("report failed");
                });
                let (log, last_index, _) = RaftLog::open(
                    opts,
                    io_handle,
                    cache.clone(),
                    callback,
                    &StatusValues::default(),
                )
                .expect("open failed");
                assert_eq!(last_index, 0);
                log.start(ctx);

                let mut cache = cache.borrow_mut();
                for item in items {
                    cache.push(RaftTask::new(item));
                }
                drop(cache);
                log.appender.borrow().signal_append(ctx);
                Ok(Box::new(log) as Box<dyn std::any::Any>)
            })
            .expect("group creation failed");

        // Wait until the last item is reported durable.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (_, index) = durable_rx
                .recv_timeout(deadline.saturating_duration_since(std::time::Instant::now()))
                .expect("append never became durable");
            if index >= last {
                break;
            }
        }
        dispatcher.stop();
        io.stop();
    }

    fn reopen(dir: &Path) -> (RaftLog, Index, Term, IoExecutor) {
        let io = IoExecutor::new("test-io", 1);
        let cache = Rc::new(RefCell::new(TailCache::new()));
        let callback: AppendCallback = Rc::new(|_: &mut Ctx, _, _| {});
        let (log, last_index, last_term) = RaftLog::open(
            options(dir),
            io.handle(),
            cache,
            callback,
            &StatusValues::default(),
        )
        .expect("reopen failed");
        (log, last_index, last_term, io)
    }

    #[test]
    fn append_restart_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let items = vec![
            item(1, 1, 0, b"first"),
            item(2, 1, 1, b"second"),
            item(3, 2, 1, b"third"),
        ];
        append_durably(dir.path(), items.clone());

        // Restart: recovery must reproduce the same index/term/payloads.
        let (log, last_index, last_term, io) = reopen(dir.path());
        assert_eq!((last_index, last_term), (3, 2));

        let pos = log.idx.borrow().lookup(1).expect("index 1 missing");
        let snapshot = log.segs.borrow().snapshot();
        let read = read_items(&snapshot, pos, 1, 3, 100, u64::MAX).expect("read failed");
        assert_eq!(read, items);
        io.stop();
    }

    #[test]
    fn crash_after_partial_write_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let items: Vec<LogItem> =
            (1..=10).map(|i| item(i, 1, if i == 1 { 0 } else { 1 }, b"payload")).collect();
        append_durably(dir.path(), items);

        // Simulate a crash mid-write of item 11: its header lands but the
        // body bytes don't.
        {
            let (log, last_index, _, io) = reopen(dir.path());
            assert_eq!(last_index, 10);
            let appender = log.appender.borrow();
            let next_pos = appender.next_persist_pos;
            let mut torn = Vec::new();
            frame::encode_item(&mut torn, &item(11, 1, 1, b"never fsynced")).expect("encode");
            torn.truncate(ITEM_HEADER_SIZE + 3);
            let segs = log.segs.borrow();
            let file = segs.get(next_pos).expect("no segment");
            use std::os::unix::fs::FileExt as _;
            file.file.write_all_at(&torn, next_pos & segs.offset_mask()).expect("write");
            io.stop();
        }

        // Restart restores through index 10 and reuses index 11's slot.
        let (log, last_index, last_term, io) = reopen(dir.path());
        assert_eq!((last_index, last_term), (10, 1));
        assert_eq!(log.appender.borrow().next_persist_index, 11);
        io.stop();
    }

    #[test]
    fn load_missing_index_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        append_durably(dir.path(), vec![item(1, 1, 0, b"only")]);
        let (log, _, _, io) = reopen(dir.path());
        assert_eq!(log.idx.borrow().lookup(2), None);
        io.stop();
    }

    #[test]
    fn truncate_tail_rewinds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let items: Vec<LogItem> =
            (1..=5).map(|i| item(i, 1, if i == 1 { 0 } else { 1 }, b"x")).collect();
        append_durably(dir.path(), items);

        let (log, last_index, _, io) = reopen(dir.path());
        assert_eq!(last_index, 5);
        let pos3 = log.idx.borrow().lookup(3).expect("index 3 missing");
        log.truncate_tail(3).expect("truncate failed");
        assert_eq!(log.appender.borrow().next_persist_index, 3);
        assert_eq!(log.appender.borrow().next_persist_pos, pos3);
        assert_eq!(log.idx.borrow().lookup(3), None);
        io.stop();
    }
}
