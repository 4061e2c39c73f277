//! The log append pipeline. Three fibers cooperate per group:
//!
//! - The append fiber wakes whenever the tail cache grows past
//!   nextPersistIndex, encodes items into write buffers (never splitting an
//!   item across segments, writing a terminal zero header when a segment
//!   can't fit another item header), and submits positioned writes to the
//!   IO executor. Writes within a segment must be byte-contiguous; a gap is
//!   a fatal usage error.
//! - The write-result fiber consumes write completions in submission order,
//!   retrying transient IO errors per the configured backoff vector, and
//!   hands finished writes to the force queue.
//! - The fsync fiber batches consecutive force-queue entries on the same
//!   file, issues one fdatasync via the IO executor while holding the
//!   segment's use count, and then reports (lastTerm, lastIndex) through
//!   the append callback, which advances the durable log position.

use super::frame;
use super::index::IdxOps;
use super::segment::{allocate_file, SegmentQueue};
use super::StoreOptions;
use crate::error::{Error, Result};
use crate::fiber::{Condition, Ctx, FiberFuture, Frame, Input, IoHandle, Step};
use crate::raft::item::{Index, TailCache, Term};

use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::rc::Rc;
use std::sync::Arc;

/// Invoked on the dispatcher when an fsync lands, with the term and index
/// of the last durable item. Advances the group's lastLogIndex/lastLogTerm
/// and may unblock quorum advancement.
pub type AppendCallback = Rc<dyn Fn(&mut Ctx, Term, Index)>;

struct WriteTask {
    file_start: u64,
    file: Arc<File>,
    pos_in_file: u64,
    buf: Arc<Vec<u8>>,
    /// The term/index of the last item completed by this write, or 0 if the
    /// write holds no item end (e.g. a terminal zero header).
    last_term: Term,
    last_index: Index,
    future: FiberFuture<()>,
}

struct ForceTask {
    file_start: u64,
    file: Arc<File>,
    last_term: Term,
    last_index: Index,
}

/// The shared appender state. Fibers hold it via Rc<RefCell>.
pub struct LogAppender {
    opts: Rc<StoreOptions>,
    segs: Rc<RefCell<SegmentQueue>>,
    idx: Rc<RefCell<IdxOps>>,
    cache: Rc<RefCell<TailCache>>,
    io: IoHandle,
    pub next_persist_index: Index,
    pub next_persist_pos: u64,
    write_queue: VecDeque<WriteTask>,
    force_queue: VecDeque<ForceTask>,
    /// Per-file write contiguity check: (file start, expected next offset).
    expect_next: Option<(u64, u64)>,
    pub need_append: Condition,
    need_fsync: Condition,
    write_submitted: Condition,
    pub no_pending: Condition,
    callback: AppendCallback,
    closed: bool,
}

impl LogAppender {
    pub fn new(
        opts: Rc<StoreOptions>,
        segs: Rc<RefCell<SegmentQueue>>,
        idx: Rc<RefCell<IdxOps>>,
        cache: Rc<RefCell<TailCache>>,
        io: IoHandle,
        callback: AppendCallback,
    ) -> Self {
        Self {
            opts,
            segs,
            idx,
            cache,
            io,
            next_persist_index: 1,
            next_persist_pos: 0,
            write_queue: VecDeque::new(),
            force_queue: VecDeque::new(),
            expect_next: None,
            need_append: Condition::new("need-append"),
            need_fsync: Condition::new("need-fsync"),
            write_submitted: Condition::new("write-submitted"),
            no_pending: Condition::new("no-pending"),
            callback,
            closed: false,
        }
    }

    /// Positions the appender, at startup from restore or after a tail
    /// truncation. The write pipeline must be drained first.
    pub fn set_next(&mut self, index: Index, pos: u64) {
        assert!(self.write_queue.is_empty(), "write pipeline not drained");
        assert!(self.force_queue.is_empty(), "force pipeline not drained");
        self.next_persist_index = index;
        self.next_persist_pos = pos;
        self.expect_next = None;
    }

    /// Wakes the append fiber; called after tail cache inserts.
    pub fn signal_append(&self, ctx: &mut Ctx) {
        self.need_append.signal(ctx);
    }

    /// Returns whether all cached items have been submitted, written and
    /// forced.
    pub fn drained(&self) -> bool {
        let cache = self.cache.borrow();
        (cache.is_empty() || self.next_persist_index > cache.last_index())
            && self.write_queue.is_empty()
            && self.force_queue.is_empty()
    }

    pub fn close(&mut self, ctx: &mut Ctx) {
        self.closed = true;
        self.need_append.signal_all(ctx);
        self.need_fsync.signal_all(ctx);
        self.write_submitted.signal_all(ctx);
        self.no_pending.signal_all(ctx);
    }

    fn backoff(&self, attempt: usize) -> std::time::Duration {
        let intervals = &self.opts.io_retry_interval;
        intervals[attempt.min(intervals.len() - 1)]
    }
}

/// Spawns the three pipeline fibers on the current group.
pub fn start_fibers(ctx: &mut Ctx, appender: &Rc<RefCell<LogAppender>>) {
    ctx.spawn("log-append", Box::new(AppendFiber { appender: appender.clone(), state: AppendState::Run }));
    ctx.spawn(
        "log-write-result",
        Box::new(WriteResultFiber { appender: appender.clone(), state: WriteResultState::Idle }),
    );
    ctx.spawn("log-fsync", Box::new(FsyncFiber { appender: appender.clone(), state: FsyncState::Idle }));
}

enum AppendState {
    Run,
    /// Waiting for a fresh segment allocated on the IO executor.
    Installing,
}

struct AppendFiber {
    appender: Rc<RefCell<LogAppender>>,
    state: AppendState,
}

impl AppendFiber {
    /// Encodes and submits one contiguous write within the current segment.
    /// Returns whether anything was submitted.
    fn write_batch(&mut self, ctx: &mut Ctx) -> Result<bool> {
        let mut appender = self.appender.borrow_mut();
        let appender = &mut *appender;
        let segs = appender.segs.borrow();
        let mut idx = appender.idx.borrow_mut();
        let cache = appender.cache.borrow();

        let write_start = appender.next_persist_pos;
        let file = segs.get(write_start).expect("segment not ready");
        let (file_start, handle) = (file.start_pos, file.file.clone());
        let mut rest = file.end_pos - write_start;
        drop(segs);

        let mut buf = Vec::new();
        let (mut last_term, mut last_index) = (0, 0);
        let mut rolled = false;
        let mut first_meta = None;

        let cache_last = cache.last_index();
        while appender.next_persist_index <= cache_last {
            let task = cache
                .get(appender.next_persist_index)
                .expect("tail cache hole at nextPersistIndex");
            let item = &task.item;
            let len = frame::encoded_len(item);
            if len > rest {
                // The item doesn't fit; finish this segment. If a header
                // still fits, write the terminal zero header so recovery
                // sees a clean end of data.
                if rest >= frame::ITEM_HEADER_SIZE as u64 {
                    frame::write_end_header(&mut buf);
                }
                rolled = true;
                break;
            }
            if !buf.is_empty() && buf.len() as u64 + len > appender.opts.max_write_buffer as u64 {
                break; // flush this buffer first, continue in the next pass
            }
            if first_meta.is_none() {
                first_meta = Some((item.index, item.term, item.timestamp));
            }
            frame::encode_item(&mut buf, item)?;
            idx.put(item.index, appender.next_persist_pos);
            last_term = item.term;
            last_index = item.index;
            appender.next_persist_pos += len;
            appender.next_persist_index += 1;
            rest -= len;
        }
        drop(cache);
        idx.work.signal(ctx);
        drop(idx);

        // Record the file's first item metadata lazily on first append.
        if let Some((index, term, timestamp)) = first_meta {
            let mut segs = appender.segs.borrow_mut();
            if let Some(file) = segs.get_mut(write_start) {
                if file.first_index == 0 {
                    file.first_index = index;
                    file.first_term = term;
                    file.first_timestamp = timestamp;
                }
            }
        }

        if buf.is_empty() && !rolled {
            return Ok(false);
        }

        if !buf.is_empty() {
            // Writes within a segment must be contiguous.
            let pos_in_file = write_start & appender.segs.borrow().offset_mask();
            if let Some((expect_file, expect_off)) = appender.expect_next {
                if expect_file == file_start && expect_off != pos_in_file {
                    return Err(ctx.fatal(Error::InvalidData(format!(
                        "non-contiguous segment write: expected {expect_off:#x}, got {pos_in_file:#x}"
                    ))));
                }
            }
            appender.expect_next = Some((file_start, pos_in_file + buf.len() as u64));

            let buf = Arc::new(buf);
            let future = FiberFuture::<()>::new();
            let completer = future.completer(ctx);
            let job_buf = buf.clone();
            let job_file = handle.clone();
            appender.io.execute(move || {
                completer.complete(
                    job_file.write_all_at(&job_buf, pos_in_file).map_err(Error::from),
                );
            });
            appender.write_queue.push_back(WriteTask {
                file_start,
                file: handle,
                pos_in_file,
                buf,
                last_term,
                last_index,
                future,
            });
            appender.write_submitted.signal(ctx);
            debug!("submitted {last_index}@{last_term} write at {write_start:#x}");
        }

        if rolled {
            // The -1 keeps the anchor inside the current segment even when
            // the last item filled it exactly.
            let next = appender.segs.borrow().next_file_pos(appender.next_persist_pos - 1);
            info!(
                "segment at {file_start:#x} full, rolling to {next:#x} at index {}",
                appender.next_persist_index
            );
            appender.next_persist_pos = next;
            appender.expect_next = None;
        }
        Ok(true)
    }
}

impl Frame for AppendFiber {
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step> {
        match std::mem::replace(&mut self.state, AppendState::Run) {
            AppendState::Run => {
                let appender = self.appender.borrow();
                if appender.closed || ctx.is_stopping() {
                    return Ok(Step::done());
                }

                // Index-store backpressure.
                let idx = appender.idx.borrow();
                if idx.needs_flush() {
                    let cond = idx.flushed_cond.clone();
                    return Ok(cond.wait());
                }
                drop(idx);

                // Anything to persist?
                let cache = appender.cache.borrow();
                if cache.is_empty() || appender.next_persist_index > cache.last_index() {
                    let cond = appender.need_append.clone();
                    return Ok(cond.wait());
                }
                if appender.next_persist_index < cache.first_index() {
                    let (next, first) = (appender.next_persist_index, cache.first_index());
                    drop(cache);
                    drop(appender);
                    return Err(ctx.fatal(Error::InvalidData(format!(
                        "nextPersistIndex {next} below tail cache start {first}"
                    ))));
                }
                drop(cache);

                // Make sure the target segment exists.
                let pos = appender.next_persist_pos;
                if appender.segs.borrow().get(pos).is_none() {
                    let segs = appender.segs.borrow();
                    let path = segs.next_alloc_path(pos);
                    let size = segs.segment_size();
                    drop(segs);
                    let io = appender.io.clone();
                    drop(appender);
                    let future = FiberFuture::<Arc<File>>::new();
                    let completer = future.completer(ctx);
                    io.submit(completer, move || allocate_file(&path, size));
                    self.state = AppendState::Installing;
                    return Ok(future.wait());
                }
                drop(appender);

                self.write_batch(ctx)?;
                Ok(Step::Again)
            }
            AppendState::Installing => {
                let file = input.take::<Arc<File>>()?;
                let appender = self.appender.borrow();
                let pos = appender.next_persist_pos;
                appender.segs.borrow_mut().install(pos, file);
                drop(appender);
                Ok(Step::Again)
            }
        }
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(Step::done());
        }
        // Segment allocation failures and encode errors are not recoverable
        // in place; shut the group down.
        Err(ctx.fatal(error))
    }
}

enum WriteResultState {
    Idle,
    /// Awaiting the head write's completion.
    Waiting { attempts: usize },
    /// Backing off before resubmitting the failed head write.
    Backoff { attempts: usize },
}

struct WriteResultFiber {
    appender: Rc<RefCell<LogAppender>>,
    state: WriteResultState,
}

impl Frame for WriteResultFiber {
    fn resume(&mut self, ctx: &mut Ctx, _input: Input) -> Result<Step> {
        match std::mem::replace(&mut self.state, WriteResultState::Idle) {
            WriteResultState::Idle => {
                let appender = self.appender.borrow();
                if appender.closed || ctx.is_stopping() {
                    return Ok(Step::done());
                }
                let Some(head) = appender.write_queue.front() else {
                    let cond = appender.write_submitted.clone();
                    return Ok(cond.wait());
                };
                let future = head.future.clone();
                drop(appender);
                self.state = WriteResultState::Waiting { attempts: 0 };
                Ok(future.wait())
            }
            WriteResultState::Waiting { .. } => {
                // The head write landed: move it to the force queue.
                let mut appender = self.appender.borrow_mut();
                let task = appender.write_queue.pop_front().expect("write queue empty");
                if task.last_term > 0 {
                    appender.force_queue.push_back(ForceTask {
                        file_start: task.file_start,
                        file: task.file,
                        last_term: task.last_term,
                        last_index: task.last_index,
                    });
                    appender.need_fsync.signal(ctx);
                }
                Ok(Step::Again)
            }
            WriteResultState::Backoff { attempts } => {
                // Resubmit the head write after backoff.
                let appender = self.appender.borrow();
                if appender.closed || ctx.is_stopping() {
                    return Ok(Step::done());
                }
                let Some(head) = appender.write_queue.front() else {
                    return Ok(Step::Again);
                };
                let future = FiberFuture::<()>::new();
                let completer = future.completer(ctx);
                let buf = head.buf.clone();
                let file = head.file.clone();
                let pos = head.pos_in_file;
                appender.io.execute(move || {
                    completer.complete(file.write_all_at(&buf, pos).map_err(Error::from));
                });
                drop(appender);
                self.appender.borrow_mut().write_queue.front_mut().expect("write queue empty").future =
                    future.clone();
                self.state = WriteResultState::Waiting { attempts };
                Ok(future.wait())
            }
        }
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(Step::done());
        }
        let attempts = match self.state {
            WriteResultState::Waiting { attempts } => attempts,
            _ => return Err(ctx.fatal(error)),
        };
        if !error.is_retryable() {
            return Err(ctx.fatal(error));
        }
        // Log writes retry indefinitely, clamped to the last interval, until
        // the store closes.
        let backoff = self.appender.borrow().backoff(attempts);
        warn!("log write failed (attempt {}), retrying in {backoff:?}: {error}", attempts + 1);
        self.state = WriteResultState::Backoff { attempts: attempts + 1 };
        Ok(Step::Sleep(backoff))
    }
}

enum FsyncState {
    Idle,
    /// Awaiting the batched force; holds the batch tail's position.
    Forcing { file_start: u64, last_term: Term, last_index: Index, count: usize, attempts: usize },
    /// Backing off before re-issuing a failed force.
    Retry { file_start: u64, last_term: Term, last_index: Index, count: usize, attempts: usize },
}

struct FsyncFiber {
    appender: Rc<RefCell<LogAppender>>,
    state: FsyncState,
}

impl FsyncFiber {
    fn submit_force(
        &mut self,
        ctx: &mut Ctx,
        file: Arc<File>,
        file_start: u64,
        last_term: Term,
        last_index: Index,
        count: usize,
        attempts: usize,
    ) -> Step {
        let future = FiberFuture::<()>::new();
        let completer = future.completer(ctx);
        let io = self.appender.borrow().io.clone();
        io.execute(move || {
            completer.complete(file.sync_data().map_err(Error::from));
        });
        self.state = FsyncState::Forcing { file_start, last_term, last_index, count, attempts };
        future.wait()
    }
}

impl Frame for FsyncFiber {
    fn resume(&mut self, ctx: &mut Ctx, _input: Input) -> Result<Step> {
        match std::mem::replace(&mut self.state, FsyncState::Idle) {
            FsyncState::Idle => {
                let mut appender = self.appender.borrow_mut();
                if appender.force_queue.is_empty() {
                    if appender.closed || ctx.is_stopping() {
                        return Ok(Step::done());
                    }
                    let cond = appender.need_fsync.clone();
                    return Ok(cond.wait());
                }

                // Batch consecutive entries on the same file; one force
                // covers them all.
                let file_start = appender.force_queue.front().expect("force queue empty").file_start;
                let mut count = 0;
                let (mut last_term, mut last_index) = (0, 0);
                let mut file = None;
                for task in appender.force_queue.iter() {
                    if task.file_start != file_start {
                        break;
                    }
                    count += 1;
                    last_term = task.last_term;
                    last_index = task.last_index;
                    file = Some(task.file.clone());
                }
                let file = file.expect("empty force batch");

                // Hold the segment against deletion while forcing.
                if let Some(segment) = appender.segs.borrow_mut().get_mut(file_start) {
                    segment.use_count += 1;
                }
                drop(appender);
                Ok(self.submit_force(ctx, file, file_start, last_term, last_index, count, 0))
            }
            FsyncState::Forcing { file_start, last_term, last_index, count, .. } => {
                let mut appender = self.appender.borrow_mut();
                if let Some(segment) = appender.segs.borrow_mut().get_mut(file_start) {
                    segment.use_count -= 1;
                }
                for _ in 0..count {
                    appender.force_queue.pop_front();
                }
                let drained = appender.drained();
                let no_pending = appender.no_pending.clone();
                let callback = appender.callback.clone();
                drop(appender);

                debug!("forced through {last_index}@{last_term}");
                callback(ctx, last_term, last_index);
                if drained {
                    no_pending.signal_all(ctx);
                }
                Ok(Step::Again)
            }
            FsyncState::Retry { file_start, last_term, last_index, count, attempts } => {
                // Re-issue the force for the still-queued batch.
                let appender = self.appender.borrow();
                if appender.closed || ctx.is_stopping() {
                    return Ok(Step::done());
                }
                let Some(head) = appender.force_queue.front() else {
                    return Ok(Step::Again);
                };
                let file = head.file.clone();
                drop(appender);
                Ok(self.submit_force(ctx, file, file_start, last_term, last_index, count, attempts))
            }
        }
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(Step::done());
        }
        let (file_start, last_term, last_index, count, attempts) = match self.state {
            FsyncState::Forcing { file_start, last_term, last_index, count, attempts } => {
                (file_start, last_term, last_index, count, attempts)
            }
            _ => return Err(ctx.fatal(error)),
        };
        let appender = self.appender.borrow();
        if !error.is_retryable() || attempts >= appender.opts.io_retry_interval.len() {
            drop(appender);
            // Release the use count taken for this batch before failing.
            if let Some(segment) = self.appender.borrow().segs.borrow_mut().get_mut(file_start) {
                segment.use_count -= 1;
            }
            return Err(ctx.fatal(error));
        }
        let backoff = appender.backoff(attempts);
        drop(appender);
        warn!("log force failed (attempt {}), retrying in {backoff:?}: {error}", attempts + 1);
        self.state =
            FsyncState::Retry { file_start, last_term, last_index, count, attempts: attempts + 1 };
        Ok(Step::Sleep(backoff))
    }
}

/// A frame that waits until the write pipeline has fully drained, used
/// before elections and tail truncation.
pub struct WaitWriteFinished {
    appender: Rc<RefCell<LogAppender>>,
}

impl WaitWriteFinished {
    pub fn new(appender: Rc<RefCell<LogAppender>>) -> Self {
        Self { appender }
    }
}

impl Frame for WaitWriteFinished {
    fn resume(&mut self, ctx: &mut Ctx, _input: Input) -> Result<Step> {
        let appender = self.appender.borrow();
        if appender.closed || ctx.is_stopping() || appender.drained() {
            return Ok(Step::done());
        }
        let cond = appender.no_pending.clone();
        Ok(cond.wait_timeout(std::time::Duration::from_secs(1)))
    }

    fn handle(&mut self, _ctx: &mut Ctx, error: Error) -> Result<Step> {
        match error {
            // Re-check the predicate on timeout.
            Error::Timeout => Ok(Step::Again),
            error => Err(error),
        }
    }
}
