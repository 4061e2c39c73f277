//! The apply loop: walks lastApplied+1..=commitIndex strictly in order,
//! calling the state machine for normal entries and completing pending
//! client replies. Pending tail-cache tasks are applied directly (leader
//! path); anything older is batch-loaded from the log store (follower and
//! restart path). Linearized reads attach to an index and run right after
//! it applies; reads past their deadline complete with Error::Timeout
//! without touching the state machine. Write-path state machine errors
//! break replica determinism and shut the group down; read-path errors are
//! only surfaced to the caller.

use super::item::{Index, ItemType, LogItem, RaftInput, RaftOutput, RaftTask, ReadTask, TailCache};
use super::state::StateMachine;
use super::status::RaftStatus;
use crate::error::{Error, Result};
use crate::fiber::{Condition, Ctx, Frame, Input, Step};
use crate::store::RaftLog;

use log::debug;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Batch-load bounds for the follower/restart path.
const APPLY_BATCH_ITEMS: usize = 100;
const APPLY_BATCH_BYTES: u64 = 16 * 1024 * 1024;

pub struct ApplyManager {
    status: Rc<RefCell<RaftStatus>>,
    cache: Rc<RefCell<TailCache>>,
    log: Rc<RefCell<RaftLog>>,
    state_machine: Rc<RefCell<Box<dyn StateMachine>>>,
    /// Signaled whenever the commit index advances.
    pub apply_cond: Condition,
    /// Linearized reads waiting for their attach index to apply.
    pending_reads: BTreeMap<Index, Vec<ReadTask>>,
    /// In-progress inbound snapshot chunks, in offset order.
    snapshot_buffer: Vec<u8>,
}

impl ApplyManager {
    pub fn new(
        status: Rc<RefCell<RaftStatus>>,
        cache: Rc<RefCell<TailCache>>,
        log: Rc<RefCell<RaftLog>>,
        state_machine: Rc<RefCell<Box<dyn StateMachine>>>,
    ) -> Self {
        Self {
            status,
            cache,
            log,
            state_machine,
            apply_cond: Condition::new("apply"),
            pending_reads: BTreeMap::new(),
            snapshot_buffer: Vec::new(),
        }
    }

    /// Buffers an inbound snapshot chunk. Chunks must arrive in offset
    /// order; a restart from offset 0 discards the partial buffer. Returns
    /// the full snapshot once the final chunk lands.
    pub fn buffer_snapshot_chunk(
        &mut self,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    ) -> Result<Option<Vec<u8>>> {
        if offset as usize != self.snapshot_buffer.len() {
            self.snapshot_buffer.clear();
            if offset != 0 {
                return crate::errinput!("snapshot chunk at offset {offset} out of order");
            }
        }
        self.snapshot_buffer.extend_from_slice(&data);
        if done {
            return Ok(Some(std::mem::take(&mut self.snapshot_buffer)));
        }
        Ok(None)
    }

    /// Attaches a linearized read at the given index: onto the pending
    /// tail-cache task when the entry hasn't applied yet (leader path),
    /// immediately when it already has. Entries persisted but not yet
    /// applied with no cache record (the restart gap) wait in
    /// pending_reads until the apply loop reaches them.
    pub fn attach_read(&mut self, ctx: &mut Ctx, index: Index, read: ReadTask) {
        let applied = self.status.borrow().last_applied;
        if index <= applied {
            self.exec_read(ctx, applied, read);
            return;
        }
        if let Some(task) = self.cache.borrow_mut().get_mut(index) {
            task.next_readers.push(read);
            return;
        }
        self.pending_reads.entry(index).or_default().push(read);
    }

    /// Aborts all pending reads, on leadership loss or shutdown.
    pub fn abort_reads(&mut self) {
        for (_, reads) in std::mem::take(&mut self.pending_reads) {
            for read in reads {
                (read.reply)(Err(Error::Abort));
            }
        }
    }

    /// Runs a read against the state machine, reporting the index whose
    /// application the read observed. Expired deadlines complete with a
    /// timeout without invoking the state machine; read errors are
    /// client-visible only.
    fn exec_read(&mut self, ctx: &mut Ctx, index: Index, read: ReadTask) {
        if read.input.deadline.is_some_and(|deadline| deadline <= ctx.now()) {
            (read.reply)(Err(Error::Timeout));
            return;
        }
        let result = self.state_machine.borrow_mut().exec(index, &read.input);
        (read.reply)(result.map(|result| RaftOutput { index, result }));
    }

    /// Applies one pending task from the tail cache. Write errors are
    /// fatal.
    fn exec_task(&mut self, ctx: &mut Ctx, index: Index, task: RaftTask) -> Result<()> {
        if task.item.item_type == ItemType::Normal {
            let input = match task.input {
                Some(input) => input,
                None => self.decode_input(&task.item)?,
            };
            let result = self.state_machine.borrow_mut().exec(index, &input);
            match result {
                Ok(result) => {
                    if let Some(reply) = task.reply {
                        reply(Ok(RaftOutput { index, result }));
                    }
                }
                // A write-path error diverges replicas; don't reply, fail
                // the group instead.
                Err(error) => return Err(error),
            }
        } else if let Some(reply) = task.reply {
            // Non-normal entries don't touch the state machine, but their
            // submitters still learn the assigned index.
            reply(Ok(RaftOutput { index, result: Box::new(()) }));
        }

        // Reads attached at this index observe its application and report
        // it as theirs.
        for read in task.next_readers {
            self.exec_read(ctx, index, read);
        }
        if let Some(reads) = self.pending_reads.remove(&index) {
            for read in reads {
                self.exec_read(ctx, index, read);
            }
        }
        Ok(())
    }

    /// Applies a batch-loaded item (follower/restart path).
    fn exec_item(&mut self, ctx: &mut Ctx, item: LogItem) -> Result<()> {
        let index = item.index;
        let task = RaftTask::new(item);
        self.exec_task(ctx, index, task)
    }

    fn decode_input(&self, item: &LogItem) -> Result<RaftInput> {
        let decoded = self.state_machine.borrow().decode(item.biz_type, &item.body)?;
        Ok(RaftInput {
            biz_type: item.biz_type,
            header: item.header.clone(),
            body: item.body.clone(),
            decoded: Some(decoded),
            read_only: false,
            deadline: None,
        })
    }
}

enum ApplyState {
    Run,
    /// Awaiting a batch load from the log store.
    Loading,
}

/// The apply fiber: one per group.
pub struct ApplyFiber {
    manager: Rc<RefCell<ApplyManager>>,
    state: ApplyState,
}

impl ApplyFiber {
    pub fn new(manager: Rc<RefCell<ApplyManager>>) -> Self {
        Self { manager, state: ApplyState::Run }
    }
}

impl Frame for ApplyFiber {
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step> {
        match std::mem::replace(&mut self.state, ApplyState::Run) {
            ApplyState::Run => {
                let mut manager = self.manager.borrow_mut();
                if ctx.is_stopping() {
                    manager.abort_reads();
                    return Ok(Step::done());
                }

                let status = manager.status.borrow();
                if status.last_applied >= status.commit_index {
                    drop(status);
                    let cond = manager.apply_cond.clone();
                    return Ok(cond.wait());
                }
                let index = status.last_applied + 1;
                let commit = status.commit_index;
                let durable_last = status.last_log_index;
                drop(status);

                let mut cache = manager.cache.borrow_mut();
                if cache.first_index() != 0 && cache.first_index() < index {
                    // Entries already applied linger after a restart race;
                    // evict them before looking at the front.
                    cache.evict_to(index - 1);
                }
                if cache.first_index() == index {
                    let task = cache.pop_front().expect("tail cache underflow");
                    drop(cache);
                    manager.exec_task(ctx, index, task)?;
                    manager.status.borrow_mut().last_applied = index;
                    debug!("applied {index} from tail cache");
                    return Ok(Step::Again);
                }
                let cache_first = cache.first_index();
                drop(cache);

                // Batch-load from the log store, up to the tail cache start.
                let mut last = commit.min(durable_last);
                if cache_first != 0 {
                    last = last.min(cache_first - 1);
                }
                let log = manager.log.borrow();
                let future =
                    log.load(ctx, index, last, APPLY_BATCH_ITEMS, APPLY_BATCH_BYTES)?;
                drop(log);
                self.state = ApplyState::Loading;
                Ok(future.wait())
            }
            ApplyState::Loading => {
                let items = input.take::<Vec<LogItem>>()?;
                if items.is_empty() {
                    return Err(Error::InvalidData(
                        "committed log entries missing from store".to_string(),
                    ));
                }
                let mut manager = self.manager.borrow_mut();
                for item in items {
                    let index = item.index;
                    manager.exec_item(ctx, item)?;
                    manager.status.borrow_mut().last_applied = index;
                    debug!("applied {index} from log store");
                }
                Ok(Step::Again)
            }
        }
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            self.manager.borrow_mut().abort_reads();
            return Ok(Step::done());
        }
        // Apply failures (state machine write errors, missing committed
        // entries) are fatal.
        Err(ctx.fatal(error))
    }
}
