//! The linear task runner: the single entry point for client submissions.
//! Requests arrive through a fiber channel and are processed one at a time
//! on the dispatcher, which makes index assignment race-free by
//! construction. The leader assigns (index, term), places the entry in the
//! tail cache under a pending record, wakes the log appender, and nudges
//! replication. Linearized reads attach to the current effective log end
//! and execute once it applies. Submissions to a non-leader fail with
//! Error::NotLeader carrying the last known leader.

use super::apply::ApplyManager;
use super::item::{ItemType, LogItem, RaftInput, RaftTask, ReadTask, Reply};
use super::state::StateMachine;
use super::status::{RaftStatus, Role};
use super::Index;
use crate::error::{Error, Result};
use crate::fiber::{Channel, Condition, Ctx, Frame, Input, Step};
use crate::raft::item::TailCache;
use crate::store::LogAppender;

use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

/// A client submission: a write command or a linearized read, with its
/// reply callback.
pub struct ClientTask {
    pub input: RaftInput,
    pub reply: Reply,
}

pub struct LinearTaskRunner {
    status: Rc<RefCell<RaftStatus>>,
    cache: Rc<RefCell<TailCache>>,
    appender: Rc<RefCell<LogAppender>>,
    apply: Rc<RefCell<ApplyManager>>,
    state_machine: Rc<RefCell<Box<dyn StateMachine>>>,
    /// Wakes the replication fibers after an append; shared with the
    /// replication manager.
    repl_cond: Condition,
    /// The submission channel; cross-thread producers push via
    /// GroupHandle::submit.
    pub channel: Channel<ClientTask>,
}

impl LinearTaskRunner {
    pub fn new(
        status: Rc<RefCell<RaftStatus>>,
        cache: Rc<RefCell<TailCache>>,
        appender: Rc<RefCell<LogAppender>>,
        apply: Rc<RefCell<ApplyManager>>,
        state_machine: Rc<RefCell<Box<dyn StateMachine>>>,
        repl_cond: Condition,
    ) -> Self {
        Self { status, cache, appender, apply, state_machine, repl_cond, channel: Channel::new() }
    }

    /// Submits a client task onto the runner channel.
    pub fn submit(&self, ctx: &mut Ctx, task: ClientTask) {
        self.channel.push(ctx, task);
    }

    /// Appends an item of the given type at the next index, wiring the
    /// reply into the tail cache record and kicking the persistence and
    /// replication pipelines. Leader only.
    pub fn append_task(
        &self,
        ctx: &mut Ctx,
        item_type: ItemType,
        biz_type: u16,
        header: Vec<u8>,
        body: Vec<u8>,
        input: Option<RaftInput>,
        reply: Option<Reply>,
    ) -> Index {
        let mut status = self.status.borrow_mut();
        let mut cache = self.cache.borrow_mut();
        assert_eq!(status.role, Role::Leader, "append_task on non-leader");

        let index = status.effective_last(cache.last_index()) + 1;
        let prev_log_term = match cache.last_index() {
            0 => status.last_log_term,
            last => cache.get(last).expect("tail cache hole").item.term,
        };
        let mut item = LogItem::new(item_type, index, status.current_term, prev_log_term);
        item.biz_type = biz_type;
        item.header = header;
        item.body = body;

        status.note_term_start(item.term, index);
        debug!("group {} appending {item_type:?} at {index}@{}", status.group_id, item.term);
        cache.push(RaftTask { item, input, reply, next_readers: Vec::new() });
        drop(cache);
        drop(status);

        self.appender.borrow().signal_append(ctx);
        self.repl_cond.signal_all(ctx);
        index
    }

    /// Aborts the client replies of all pending tail-cache tasks and
    /// attached reads, on leadership loss. The log entries themselves stay:
    /// they may still be persisting, and the new leader decides their fate.
    pub fn abort_pending(&self) {
        let mut cache = self.cache.borrow_mut();
        let mut aborted = 0;
        let mut index = cache.first_index();
        while index != 0 && index <= cache.last_index() {
            if let Some(task) = cache.get_mut(index) {
                if let Some(reply) = task.reply.take() {
                    reply(Err(Error::Abort));
                    aborted += 1;
                }
                for read in task.next_readers.drain(..) {
                    (read.reply)(Err(Error::Abort));
                    aborted += 1;
                }
            }
            index += 1;
        }
        drop(cache);
        self.apply.borrow_mut().abort_reads();
        if aborted > 0 {
            debug!("aborted {aborted} pending client tasks");
        }
    }

    fn process(&self, ctx: &mut Ctx, mut task: ClientTask) {
        let status = self.status.borrow();
        if status.role != Role::Leader {
            let leader = status.leader_id;
            drop(status);
            (task.reply)(Err(Error::NotLeader(leader)));
            return;
        }

        if task.input.read_only {
            // Attach the read behind everything currently in the log, so it
            // observes all writes accepted before it.
            let attach = status.effective_last(self.cache.borrow().last_index());
            drop(status);
            let read = ReadTask { input: task.input, reply: task.reply };
            self.apply.borrow_mut().attach_read(ctx, attach, read);
            return;
        }
        drop(status);

        // Decode up front so the apply fast path uses the decoded command
        // directly instead of re-parsing the entry body.
        if task.input.decoded.is_none() {
            match self.state_machine.borrow().decode(task.input.biz_type, &task.input.body) {
                Ok(decoded) => task.input.decoded = Some(decoded),
                Err(error) => {
                    (task.reply)(Err(error));
                    return;
                }
            }
        }

        let biz_type = task.input.biz_type;
        let header = task.input.header.clone();
        let body = task.input.body.clone();
        self.append_task(
            ctx,
            ItemType::Normal,
            biz_type,
            header,
            body,
            Some(task.input),
            Some(task.reply),
        );
    }
}

/// The runner fiber: drains the submission channel.
pub struct RunnerFiber {
    runner: Rc<RefCell<LinearTaskRunner>>,
    receiving: bool,
}

impl RunnerFiber {
    pub fn new(runner: Rc<RefCell<LinearTaskRunner>>) -> Self {
        Self { runner, receiving: false }
    }
}

impl Frame for RunnerFiber {
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step> {
        if ctx.is_stopping() {
            return Ok(Step::done());
        }
        if !self.receiving {
            self.receiving = true;
            let channel = self.runner.borrow().channel.clone();
            return Ok(channel.recv());
        }
        self.receiving = false;
        let task = input.take::<ClientTask>()?;
        self.runner.borrow().process(ctx, task);
        Ok(Step::Again)
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(Step::done());
        }
        Err(error)
    }
}
