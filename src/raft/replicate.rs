//! Log replication. On the leader, one replication fiber per peer sends
//! AppendEntries batches (or empty heartbeats) according to the peer's
//! nextIndex, regressing it on conflict hints and streaming a state
//! machine snapshot when the peer has fallen behind the log head. Commit
//! advancement requires a quorum of members and, during joint consensus, a
//! quorum of prepared members, and never commits an index from an earlier
//! term. On followers, the append processor validates continuity against
//! prevLogIndex/prevLogTerm, truncates divergent suffixes, appends through
//! the same tail cache and appender, and acknowledges only once the
//! entries are durable.

use super::apply::ApplyManager;
use super::item::{Index, LogItem, NodeId, RaftTask, TailCache, Term};
use super::member;
use super::message::{
    AppendEntriesReq, AppendEntriesResp, InstallSnapshotReq, InstallSnapshotResp,
};
use super::runner::LinearTaskRunner;
use super::state::StateMachine;
use super::status::{RaftStatus, Role};
use super::transport::{ReplyTo, Transport};
use super::vote::{status_values, VoteManager};
use super::{GroupComponents, GroupConfig};
use crate::error::{Error, Result};
use crate::fiber::{Channel, Condition, Ctx, FiberFuture, Frame, Input, Step};
use crate::store::{LogAppender, RaftLog, StatusManager, WaitWriteFinished};

use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

pub struct ReplicationManager {
    config: Rc<GroupConfig>,
    status: Rc<RefCell<RaftStatus>>,
    cache: Rc<RefCell<TailCache>>,
    log: Rc<RefCell<RaftLog>>,
    status_manager: Rc<RefCell<StatusManager>>,
    runner: Rc<RefCell<LinearTaskRunner>>,
    state_machine: Rc<RefCell<Box<dyn StateMachine>>>,
    transport: Arc<dyn Transport>,
    /// Wakes replication fibers when new entries are appended or become
    /// durable. Shared with the runner and the append callback.
    pub repl_cond: Condition,
    /// Signaled when the durable log position advances; append processors
    /// wait on it before acknowledging entries.
    pub persisted: Condition,
    /// Inbound AppendEntries requests, drained one at a time by the append
    /// loop fiber.
    pub append_queue: Channel<PendingAppend>,
    /// The apply manager's condition, signaled on commit advancement.
    apply_cond: Condition,
    /// The leadership session: replication fibers exit when it moves on.
    epoch: u64,
    /// Peers with a live replication fiber in the current epoch.
    active: HashSet<NodeId>,
}

impl ReplicationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Rc<GroupConfig>,
        status: Rc<RefCell<RaftStatus>>,
        cache: Rc<RefCell<TailCache>>,
        log: Rc<RefCell<RaftLog>>,
        status_manager: Rc<RefCell<StatusManager>>,
        runner: Rc<RefCell<LinearTaskRunner>>,
        state_machine: Rc<RefCell<Box<dyn StateMachine>>>,
        transport: Arc<dyn Transport>,
        repl_cond: Condition,
        apply_cond: Condition,
    ) -> Self {
        Self {
            config,
            status,
            cache,
            log,
            status_manager,
            runner,
            state_machine,
            transport,
            repl_cond,
            persisted: Condition::new("log-persisted"),
            append_queue: Channel::new(),
            apply_cond,
            epoch: 0,
            active: HashSet::new(),
        }
    }

    /// Starts a replication fiber per peer for a fresh leadership session.
    pub fn start_leader(this: &Rc<RefCell<Self>>, ctx: &mut Ctx) {
        let (epoch, peers) = {
            let mut repl = this.borrow_mut();
            repl.epoch += 1;
            repl.active.clear();
            let targets = repl.status.borrow().replication_targets();
            (repl.epoch, targets)
        };
        info!("starting replication epoch {epoch} to {peers:?}");
        for peer in peers {
            Self::start_peer(this, ctx, peer, epoch);
        }
    }

    /// Spawns replication fibers for peers added by a membership change.
    pub fn refresh_members(&self, ctx: &mut Ctx) {
        // Only meaningful on an active leader; new fibers join the current
        // epoch. Self-referencing spawn goes through the services bundle,
        // so this method is called with the manager borrowed; defer via the
        // repl condition instead when nothing is missing.
        let status = self.status.borrow();
        if status.role != Role::Leader {
            return;
        }
        drop(status);
        self.repl_cond.signal_all(ctx);
    }

    /// Spawns replication fibers for any targets missing one. Requires the
    /// shared handle, so it runs from fibers rather than &self methods.
    pub fn spawn_missing(this: &Rc<RefCell<Self>>, ctx: &mut Ctx) {
        let (epoch, missing) = {
            let repl = this.borrow();
            if repl.status.borrow().role != Role::Leader {
                return;
            }
            let missing: Vec<NodeId> = repl
                .status
                .borrow()
                .replication_targets()
                .into_iter()
                .filter(|peer| !repl.active.contains(peer))
                .collect();
            (repl.epoch, missing)
        };
        for peer in missing {
            Self::start_peer(this, ctx, peer, epoch);
        }
    }

    fn start_peer(this: &Rc<RefCell<Self>>, ctx: &mut Ctx, peer: NodeId, epoch: u64) {
        this.borrow_mut().active.insert(peer);
        ctx.spawn(
            format!("replicate-{peer}-e{epoch}"),
            Box::new(ReplFiber {
                repl: this.clone(),
                peer,
                epoch,
                state: ReplState::Run,
                prev_hint: None,
                heartbeat_due: true,
            }),
        );
    }

    /// Advances the commit index to the highest quorum-replicated index,
    /// never committing an entry from an earlier term (figure 8 in the
    /// Raft paper), and wakes the apply fiber.
    pub fn try_commit(&self, ctx: &mut Ctx) {
        let mut status = self.status.borrow_mut();
        if status.role != Role::Leader {
            return;
        }
        let quorum_index = status.quorum_match();
        if quorum_index <= status.commit_index {
            return;
        }
        match status.term_at(quorum_index) {
            Some(term) if term == status.current_term => {}
            _ => return,
        }
        debug!(
            "group {} commit index {} → {quorum_index}",
            status.group_id, status.commit_index
        );
        status.commit_index = quorum_index;
        drop(status);
        self.apply_cond.signal(ctx);
    }
}

/// Steps down into a higher term observed from a peer, aborting pending
/// leader work and persisting the new term asynchronously.
fn step_down_from_peer(
    status: &Rc<RefCell<RaftStatus>>,
    runner: &Rc<RefCell<LinearTaskRunner>>,
    status_manager: &Rc<RefCell<StatusManager>>,
    log: &Rc<RefCell<RaftLog>>,
    ctx: &mut Ctx,
    term: Term,
) {
    let was_active = {
        let mut status = status.borrow_mut();
        let was_active = status.role != Role::Follower;
        status.step_down(term, ctx.now());
        was_active
    };
    if was_active {
        runner.borrow().abort_pending();
    }
    let values = status_values(&status.borrow(), &log.borrow());
    status_manager.borrow_mut().persist(ctx, values);
}

enum ReplState {
    Run,
    /// Loading the previous entry's term from the store.
    LoadPrevTerm,
    /// Loading a batch of entries from the store.
    LoadEntries { prev_index: Index, prev_term: Term },
    /// Awaiting an AppendEntries response.
    AwaitResp { last_sent: Index, sent_at: Instant },
    /// Streaming a snapshot chunk and awaiting its ack.
    AwaitSnapshot { data: Rc<Vec<u8>>, offset: u64, last_included: Index, included_term: Term },
}

/// The per-peer replication fiber.
struct ReplFiber {
    repl: Rc<RefCell<ReplicationManager>>,
    peer: NodeId,
    epoch: u64,
    state: ReplState,
    /// The term of a previously loaded historical entry, keyed by index,
    /// so one disk read serves the next send without polluting the status
    /// term bookkeeping.
    prev_hint: Option<(Index, Term)>,
    /// Set when the idle wait timed out: the peer is due an empty
    /// AppendEntries as a heartbeat.
    heartbeat_due: bool,
}

impl ReplFiber {
    /// Returns whether this fiber's leadership session has ended.
    fn session_over(&self, ctx: &Ctx) -> bool {
        if ctx.is_stopping() {
            return true;
        }
        let repl = self.repl.borrow();
        let over = repl.epoch != self.epoch
            || repl.status.borrow().role != Role::Leader
            || repl.status.borrow().member(self.peer).is_none();
        over
    }

    fn exit(&self) -> Step {
        self.repl.borrow_mut().active.remove(&self.peer);
        Step::done()
    }

    /// Sends an AppendEntries request and transitions to awaiting its
    /// response.
    fn send_append(
        &mut self,
        ctx: &mut Ctx,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<LogItem>,
    ) -> Step {
        let repl = self.repl.borrow();
        let status = repl.status.borrow();
        let req = AppendEntriesReq {
            group_id: repl.config.group_id,
            term: status.current_term,
            leader_id: status.node_id,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            leader_commit: status.commit_index,
            entries,
        };
        let last_sent = req.entries.last().map_or(prev_index, |e| e.index);
        let rpc_timeout = repl.config.rpc_timeout;
        let transport = repl.transport.clone();
        drop(status);
        drop(repl);

        self.heartbeat_due = false;
        debug!(
            "replicating ({}..={last_sent}] to {} (prev {prev_index}@{prev_term})",
            prev_index, self.peer
        );
        let future = FiberFuture::<AppendEntriesResp>::new();
        let completer = future.completer(ctx);
        transport.append_entries(self.peer, req, Box::new(move |resp| completer.complete(resp)));
        self.state = ReplState::AwaitResp { last_sent, sent_at: ctx.now() };
        future.wait_timeout(rpc_timeout)
    }

    /// Takes a snapshot and starts streaming it to a peer that has fallen
    /// behind the log head.
    fn start_snapshot(&mut self, ctx: &mut Ctx) -> Result<Step> {
        let repl = self.repl.borrow();
        let status = repl.status.borrow();
        let last_included = status.last_applied;
        let included_term = status.term_at(last_included).unwrap_or(status.last_log_term);
        drop(status);
        let data = repl.state_machine.borrow().take_snapshot()?;
        drop(repl);
        info!(
            "streaming snapshot through {last_included}@{included_term} ({} bytes) to {}",
            data.len(),
            self.peer
        );
        self.send_snapshot_chunk(ctx, Rc::new(data), 0, last_included, included_term)
    }

    fn send_snapshot_chunk(
        &mut self,
        ctx: &mut Ctx,
        data: Rc<Vec<u8>>,
        offset: u64,
        last_included: Index,
        included_term: Term,
    ) -> Result<Step> {
        let repl = self.repl.borrow();
        let status = repl.status.borrow();
        let chunk_size = repl.config.snapshot_chunk_size;
        let end = (offset as usize + chunk_size).min(data.len());
        let done = end == data.len();
        let req = InstallSnapshotReq {
            group_id: repl.config.group_id,
            term: status.current_term,
            leader_id: status.node_id,
            last_included_index: last_included,
            last_included_term: included_term,
            offset,
            data: data[offset as usize..end].to_vec(),
            done,
        };
        let rpc_timeout = repl.config.rpc_timeout;
        let transport = repl.transport.clone();
        drop(status);
        drop(repl);

        let future = FiberFuture::<InstallSnapshotResp>::new();
        let completer = future.completer(ctx);
        transport.install_snapshot(self.peer, req, Box::new(move |resp| completer.complete(resp)));
        self.state = ReplState::AwaitSnapshot {
            data,
            offset: end as u64,
            last_included,
            included_term,
        };
        Ok(future.wait_timeout(rpc_timeout))
    }
}

impl Frame for ReplFiber {
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step> {
        match std::mem::replace(&mut self.state, ReplState::Run) {
            ReplState::Run => {
                if self.session_over(ctx) {
                    return Ok(self.exit());
                }
                // Membership changes may have added peers without fibers.
                ReplicationManager::spawn_missing(&self.repl, ctx);

                let repl = self.repl.borrow();
                let status = repl.status.borrow();
                let cache = repl.cache.borrow();
                let member = status.member(self.peer).expect("member vanished");
                let next = member.next_index;
                let effective_last = status.effective_last(cache.last_index());
                let first_available = repl.log.borrow().first_index;

                let caught_up = next > effective_last;
                if caught_up && !self.heartbeat_due {
                    // Idle until new entries arrive or a heartbeat is due.
                    let cond = repl.repl_cond.clone();
                    let interval = repl.config.heartbeat_interval;
                    drop(cache);
                    drop(status);
                    drop(repl);
                    return Ok(cond.wait_timeout(interval));
                }

                if next < first_available {
                    drop(cache);
                    drop(status);
                    drop(repl);
                    return self.start_snapshot(ctx);
                }

                // Resolve the previous entry's term.
                let prev_index = next - 1;
                let prev_term = if prev_index == 0 {
                    Some(0)
                } else if let Some(task) = cache.get(prev_index) {
                    Some(task.item.term)
                } else if prev_index == status.last_log_index {
                    Some(status.last_log_term)
                } else {
                    status.term_at(prev_index).or(self
                        .prev_hint
                        .filter(|(index, _)| *index == prev_index)
                        .map(|(_, term)| term))
                };

                // A due heartbeat on a caught-up peer: send an empty append
                // at the log end.
                if caught_up {
                    drop(cache);
                    drop(status);
                    drop(repl);
                    let Some(prev_term) = prev_term else {
                        self.state = ReplState::LoadPrevTerm;
                        return self.load_prev(ctx, prev_index);
                    };
                    return Ok(self.send_append(ctx, prev_index, prev_term, Vec::new()));
                }

                // Collect entries: from the tail cache when possible,
                // otherwise from the log store.
                let max_items = repl.config.max_replicate_items;
                let max_bytes = repl.config.max_replicate_bytes;
                if !cache.is_empty() && next >= cache.first_index() {
                    let mut entries = Vec::new();
                    let mut bytes = 0;
                    let mut index = next;
                    while index <= cache.last_index()
                        && entries.len() < max_items
                        && bytes < max_bytes
                    {
                        let item = cache.get(index).expect("tail cache hole").item.clone();
                        bytes += item.body.len() as u64;
                        entries.push(item);
                        index += 1;
                    }
                    drop(cache);
                    drop(status);
                    drop(repl);
                    let Some(prev_term) = prev_term else {
                        self.state = ReplState::LoadPrevTerm;
                        return self.load_prev(ctx, prev_index);
                    };
                    return Ok(self.send_append(ctx, prev_index, prev_term, entries));
                }

                // Load from the store, bounded by the durable last index
                // and the cache start.
                let mut last = status.last_log_index;
                if !cache.is_empty() {
                    last = last.min(cache.first_index() - 1);
                }
                drop(cache);
                drop(status);
                if last < next {
                    // The range isn't durable yet; wait for the appender.
                    let cond = repl.repl_cond.clone();
                    let interval = repl.config.heartbeat_interval;
                    drop(repl);
                    return Ok(cond.wait_timeout(interval));
                }
                match prev_term {
                    Some(prev_term) => {
                        let log = repl.log.borrow();
                        let future = log.load(ctx, next, last, max_items, max_bytes)?;
                        drop(log);
                        drop(repl);
                        self.state = ReplState::LoadEntries { prev_index, prev_term };
                        Ok(future.wait())
                    }
                    None => {
                        drop(repl);
                        self.state = ReplState::LoadPrevTerm;
                        self.load_prev(ctx, prev_index)
                    }
                }
            }
            ReplState::LoadPrevTerm => {
                // The previous entry's term arrived; remember it for the
                // next pass.
                let items = input.take::<Vec<LogItem>>()?;
                if let Some(item) = items.first() {
                    self.prev_hint = Some((item.index, item.term));
                }
                Ok(Step::Again)
            }
            ReplState::LoadEntries { prev_index, prev_term } => {
                let entries = input.take::<Vec<LogItem>>()?;
                if self.session_over(ctx) {
                    return Ok(self.exit());
                }
                if entries.is_empty() {
                    // The range moved under the load (truncation or not yet
                    // readable); back off and re-evaluate.
                    return Ok(Step::Sleep(self.repl.borrow().config.heartbeat_interval));
                }
                Ok(self.send_append(ctx, prev_index, prev_term, entries))
            }
            ReplState::AwaitResp { last_sent, sent_at } => {
                let resp = input.take::<AppendEntriesResp>()?;
                if self.session_over(ctx) {
                    return Ok(self.exit());
                }
                let repl = self.repl.borrow();
                let current_term = repl.status.borrow().current_term;
                if resp.term > current_term {
                    info!("peer {} is at higher term {}, stepping down", self.peer, resp.term);
                    let (status, runner, status_manager, log) = (
                        repl.status.clone(),
                        repl.runner.clone(),
                        repl.status_manager.clone(),
                        repl.log.clone(),
                    );
                    drop(repl);
                    step_down_from_peer(&status, &runner, &status_manager, &log, ctx, resp.term);
                    return Ok(self.exit());
                }

                let mut status = repl.status.borrow_mut();
                let Some(member) = status.member_mut(self.peer) else {
                    drop(status);
                    drop(repl);
                    return Ok(self.exit());
                };
                if resp.success {
                    member.last_confirm = Some(sent_at);
                    if last_sent > member.match_index {
                        member.match_index = last_sent;
                    }
                    member.next_index = member.next_index.max(member.match_index + 1);
                    drop(status);
                    repl.try_commit(ctx);
                    drop(repl);
                } else {
                    // Conflict hint: probe from the suggested index, never
                    // regressing below the confirmed match.
                    let floor = member.match_index + 1;
                    let suggested = resp.suggest_next_index.max(floor);
                    debug!(
                        "peer {} rejected append, nextIndex {} → {suggested} (term hint {})",
                        self.peer, member.next_index, resp.suggest_term
                    );
                    member.next_index = suggested.min(member.next_index);
                    if member.next_index < floor {
                        member.next_index = floor;
                    }
                    drop(status);
                    drop(repl);
                }
                Ok(Step::Again)
            }
            ReplState::AwaitSnapshot { data, offset, last_included, included_term } => {
                let resp = input.take::<InstallSnapshotResp>()?;
                if self.session_over(ctx) {
                    return Ok(self.exit());
                }
                let repl = self.repl.borrow();
                let current_term = repl.status.borrow().current_term;
                if resp.term > current_term {
                    let (status, runner, status_manager, log) = (
                        repl.status.clone(),
                        repl.runner.clone(),
                        repl.status_manager.clone(),
                        repl.log.clone(),
                    );
                    drop(repl);
                    step_down_from_peer(&status, &runner, &status_manager, &log, ctx, resp.term);
                    return Ok(self.exit());
                }
                if !resp.success {
                    drop(repl);
                    warn!("peer {} rejected snapshot chunk, retrying later", self.peer);
                    return Ok(Step::Sleep(self.repl.borrow().config.heartbeat_interval));
                }
                if (offset as usize) < data.len() {
                    drop(repl);
                    return self.send_snapshot_chunk(ctx, data, offset, last_included, included_term);
                }
                // Snapshot fully acknowledged: resume log replication just
                // past it.
                let mut status = repl.status.borrow_mut();
                if let Some(member) = status.member_mut(self.peer) {
                    member.match_index = member.match_index.max(last_included);
                    member.next_index = last_included + 1;
                }
                drop(status);
                drop(repl);
                info!("snapshot through {last_included} installed on {}", self.peer);
                Ok(Step::Again)
            }
        }
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(self.exit());
        }
        if self.session_over(ctx) {
            return Ok(self.exit());
        }
        // An idle wait that timed out means the peer is due a heartbeat.
        if matches!(error, Error::Timeout) && matches!(self.state, ReplState::Run) {
            self.heartbeat_due = true;
            return Ok(Step::Again);
        }
        // RPC failures and timeouts: back off for a heartbeat interval and
        // retry; the member manager tracks reachability separately.
        debug!("replication to {} failed: {error}", self.peer);
        self.state = ReplState::Run;
        Ok(Step::Sleep(self.repl.borrow().config.heartbeat_interval))
    }
}

impl ReplFiber {
    /// Loads the single entry preceding the replication window to learn
    /// its term.
    fn load_prev(&mut self, ctx: &mut Ctx, prev_index: Index) -> Result<Step> {
        let repl = self.repl.borrow();
        let log = repl.log.borrow();
        let future = log.load(ctx, prev_index, prev_index, 1, u64::MAX)?;
        drop(log);
        drop(repl);
        Ok(future.wait())
    }
}

/// An inbound AppendEntries awaiting processing.
pub struct PendingAppend {
    pub req: AppendEntriesReq,
    pub reply: ReplyTo<AppendEntriesResp>,
}

/// Enqueues an inbound AppendEntries request. Requests are processed one
/// at a time by the append loop fiber, so cache inserts and truncations
/// never interleave across suspension points.
pub fn process_append(
    comps: &GroupComponents,
    ctx: &mut Ctx,
    req: AppendEntriesReq,
    reply: ReplyTo<AppendEntriesResp>,
) {
    comps.repl.borrow().append_queue.push(ctx, PendingAppend { req, reply });
}

/// Starts the singleton append processing loop for a group.
pub fn start_append_loop(comps: &GroupComponents, ctx: &mut Ctx) {
    let deps = AppendDeps {
        status: comps.status.clone(),
        cache: comps.cache.clone(),
        log: comps.log.clone(),
        appender: comps.appender(),
        status_manager: comps.status_manager.clone(),
        runner: comps.runner.clone(),
        vote: comps.vote.clone(),
        repl: comps.repl.clone(),
        apply: comps.apply.clone(),
    };
    let queue = comps.repl.borrow().append_queue.clone();
    ctx.spawn("append-loop", Box::new(AppendLoopFiber { deps, queue, receiving: false }));
}

impl GroupComponents {
    /// The appender handle, reached through the log.
    pub fn appender(&self) -> Rc<RefCell<LogAppender>> {
        self.log.borrow().appender.clone()
    }
}

/// The shared handles the append processor needs.
#[derive(Clone)]
struct AppendDeps {
    status: Rc<RefCell<RaftStatus>>,
    cache: Rc<RefCell<TailCache>>,
    log: Rc<RefCell<RaftLog>>,
    appender: Rc<RefCell<LogAppender>>,
    status_manager: Rc<RefCell<StatusManager>>,
    runner: Rc<RefCell<LinearTaskRunner>>,
    vote: Rc<RefCell<VoteManager>>,
    repl: Rc<RefCell<ReplicationManager>>,
    apply: Rc<RefCell<ApplyManager>>,
}

/// Drains the append queue, running one processor sub-frame per request.
struct AppendLoopFiber {
    deps: AppendDeps,
    queue: Channel<PendingAppend>,
    receiving: bool,
}

impl Frame for AppendLoopFiber {
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step> {
        if ctx.is_stopping() {
            return Ok(Step::done());
        }
        if !self.receiving {
            self.receiving = true;
            return Ok(self.queue.recv());
        }
        self.receiving = false;
        if let Ok(pending) = input.take::<PendingAppend>() {
            let deps = self.deps.clone();
            return Ok(Step::Call(Box::new(AppendProcFiber {
                status: deps.status,
                cache: deps.cache,
                log: deps.log,
                appender: deps.appender,
                status_manager: deps.status_manager,
                runner: deps.runner,
                vote: deps.vote,
                repl: deps.repl,
                apply: deps.apply,
                req: Some(pending.req),
                reply: Some(pending.reply),
                state: AppendProcState::Check,
            })));
        }
        Ok(Step::Again)
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(Step::done());
        }
        warn!("append loop error: {error}");
        self.receiving = false;
        Ok(Step::Again)
    }
}

enum AppendProcState {
    Check,
    /// Waiting for an increased term to persist before any reply.
    AwaitTermPersist,
    /// Loading the term of the entry at prevLogIndex from the store.
    LoadPrevTerm,
    /// Waiting for the write pipeline to drain before truncating.
    AfterDrainTruncate { conflict: Index },
    /// Waiting for the appended entries to become durable.
    WaitDurable { target: Index },
}

struct AppendProcFiber {
    status: Rc<RefCell<RaftStatus>>,
    cache: Rc<RefCell<TailCache>>,
    log: Rc<RefCell<RaftLog>>,
    appender: Rc<RefCell<LogAppender>>,
    status_manager: Rc<RefCell<StatusManager>>,
    runner: Rc<RefCell<LinearTaskRunner>>,
    vote: Rc<RefCell<VoteManager>>,
    repl: Rc<RefCell<ReplicationManager>>,
    apply: Rc<RefCell<ApplyManager>>,
    req: Option<AppendEntriesReq>,
    reply: Option<ReplyTo<AppendEntriesResp>>,
    state: AppendProcState,
}

impl AppendProcFiber {
    fn reply(&mut self, term: Term, success: bool, suggest_next_index: Index, suggest_term: Term) {
        if let Some(reply) = self.reply.take() {
            reply(Ok(AppendEntriesResp { term, success, suggest_next_index, suggest_term }));
        }
    }

    /// The term of the entry at the given index, from the tail cache or
    /// the in-memory bookkeeping. None means it must be read from disk.
    fn known_term_at(&self, index: Index) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if let Some(task) = self.cache.borrow().get(index) {
            return Some(task.item.term);
        }
        let status = self.status.borrow();
        if index == status.last_log_index {
            return Some(status.last_log_term);
        }
        status.term_at(index)
    }

    /// Validates the request's continuity, then truncates, inserts, and
    /// acknowledges. Runs after any term persistence and prev-term load.
    fn process(&mut self, ctx: &mut Ctx, prev_term_loaded: Option<Term>) -> Result<Step> {
        let (req_prev_index, req_prev_term, entry_keys) = {
            let req = self.req.as_ref().expect("request consumed");
            let keys: Vec<(Index, Term)> =
                req.entries.iter().map(|e| (e.index, e.term)).collect();
            (req.prev_log_index, req.prev_log_term, keys)
        };
        let current_term = self.status.borrow().current_term;
        let effective_last = {
            let status = self.status.borrow();
            status.effective_last(self.cache.borrow().last_index())
        };

        // The previous entry must exist and match.
        if req_prev_index > effective_last {
            debug!("rejecting append: prev {req_prev_index} beyond log end {effective_last}");
            self.reply(current_term, false, effective_last + 1, 0);
            return Ok(Step::done());
        }
        let prev_term = match prev_term_loaded.or_else(|| self.known_term_at(req_prev_index)) {
            Some(term) => term,
            None => {
                // Read it from the store, unless it precedes the log head
                // (compacted away).
                let first = self.log.borrow().first_index;
                if req_prev_index < first {
                    self.reply(current_term, false, first, 0);
                    return Ok(Step::done());
                }
                let future = {
                    let log = self.log.borrow();
                    log.load(ctx, req_prev_index, req_prev_index, 1, u64::MAX)?
                };
                self.state = AppendProcState::LoadPrevTerm;
                return Ok(future.wait());
            }
        };
        if prev_term != req_prev_term {
            // Conflict hint: the first index of the conflicting term, so
            // the leader can skip the whole run.
            let suggest =
                self.status.borrow().first_index_of_term(prev_term).unwrap_or(req_prev_index);
            debug!(
                "rejecting append: prev {req_prev_index}@{req_prev_term} != {prev_term}, \
                 suggesting {suggest}"
            );
            self.reply(current_term, false, suggest, prev_term);
            return Ok(Step::done());
        }

        // Find the first conflicting or missing entry. Entries at or below
        // the commit index are identical by the Log Matching property, so
        // an unknown term there (e.g. right after a restart) is a match,
        // not a conflict.
        let commit_index = self.status.borrow().commit_index;
        let mut first_new = None;
        let mut conflict = None;
        for (index, term) in entry_keys {
            if index > effective_last {
                first_new = Some(index);
                break;
            }
            match self.known_term_at(index) {
                Some(existing) if existing == term => continue, // already present
                None if index <= commit_index => continue,
                _ => {
                    conflict = Some(index);
                    first_new = Some(index);
                    break;
                }
            }
        }

        if let Some(conflict) = conflict {
            assert!(
                conflict > self.status.borrow().commit_index,
                "append conflict below commit index"
            );
            // Abort the replies of truncated pending tasks.
            for task in self.cache.borrow_mut().truncate_from(conflict) {
                if let Some(reply) = task.reply {
                    reply(Err(Error::Abort));
                }
                for read in task.next_readers {
                    (read.reply)(Err(Error::Abort));
                }
            }
            self.status.borrow_mut().truncate_terms_from(conflict);
            if conflict <= self.status.borrow().last_log_index {
                // The divergent suffix is already on disk: drain the write
                // pipeline, then rewind it.
                info!("truncating divergent log suffix from {conflict}");
                self.state = AppendProcState::AfterDrainTruncate { conflict };
                return Ok(Step::call(WaitWriteFinished::new(self.appender.clone())));
            }
        }

        self.insert_and_ack(ctx, first_new)
    }

    /// Inserts the new entries (from first_new onward) into the tail cache
    /// and advances the commit index, then waits for durability.
    fn insert_and_ack(&mut self, ctx: &mut Ctx, first_new: Option<Index>) -> Result<Step> {
        let req = self.req.take().expect("request consumed");
        let current_term = self.status.borrow().current_term;
        let last_entry_index = req.entries.last().map_or(req.prev_log_index, |e| e.index);

        if let Some(first_new) = first_new {
            let mut status = self.status.borrow_mut();
            let mut cache = self.cache.borrow_mut();
            for entry in req.entries.into_iter().filter(|e| e.index >= first_new) {
                status.note_term_start(entry.term, entry.index);
                if entry.item_type.is_config_change() {
                    member::apply_config_change(&mut status, &entry)?;
                }
                cache.push(RaftTask::new(entry));
            }
            drop(cache);
            drop(status);
            self.appender.borrow().signal_append(ctx);
        }

        // Advance the commit index to what the leader reports, bounded by
        // what we now have.
        {
            let mut status = self.status.borrow_mut();
            let new_commit = req.leader_commit.min(last_entry_index);
            if new_commit > status.commit_index {
                status.commit_index = new_commit;
                drop(status);
                self.apply.borrow().apply_cond.signal(ctx);
            }
        }

        // Acknowledge once everything we accepted is durable.
        self.state = AppendProcState::WaitDurable { target: last_entry_index };
        Ok(Step::Again)
    }
}

impl Frame for AppendProcFiber {
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step> {
        match std::mem::replace(&mut self.state, AppendProcState::Check) {
            AppendProcState::Check => {
                let req = self.req.as_ref().expect("request consumed");
                let req_term = req.term;
                let leader_id = req.leader_id;
                let mut status = self.status.borrow_mut();
                let current = status.current_term;
                if req_term < current {
                    debug!("rejecting append from stale term {req_term}");
                    drop(status);
                    self.reply(current, false, 0, 0);
                    return Ok(Step::done());
                }

                let term_increased = req_term > current;
                let was_active = status.role != Role::Follower;
                if term_increased || was_active {
                    status.step_down(req_term, ctx.now());
                }
                status.leader_id = leader_id;
                status.reset_elect_time(ctx.now());
                drop(status);
                if was_active {
                    self.runner.borrow().abort_pending();
                }
                self.vote.borrow_mut().cancel_vote();

                if term_increased {
                    // Persist the new term before anything leaves the node.
                    let values = status_values(&self.status.borrow(), &self.log.borrow());
                    let future = self.status_manager.borrow_mut().persist(ctx, values);
                    self.state = AppendProcState::AwaitTermPersist;
                    return Ok(future.wait());
                }
                self.process(ctx, None)
            }
            AppendProcState::AwaitTermPersist => self.process(ctx, None),
            AppendProcState::LoadPrevTerm => {
                let items = input.take::<Vec<LogItem>>()?;
                let term = items.first().map(|item| item.term);
                match term {
                    Some(term) => self.process(ctx, Some(term)),
                    None => {
                        let current = self.status.borrow().current_term;
                        let first = self.log.borrow().first_index;
                        self.reply(current, false, first, 0);
                        Ok(Step::done())
                    }
                }
            }
            AppendProcState::AfterDrainTruncate { conflict } => {
                {
                    let log = self.log.borrow();
                    log.truncate_tail(conflict)?;
                }
                let mut status = self.status.borrow_mut();
                if conflict <= status.last_log_index {
                    status.last_log_index = conflict - 1;
                    let req = self.req.as_ref().expect("request consumed");
                    status.last_log_term = if conflict - 1 == req.prev_log_index {
                        req.prev_log_term
                    } else {
                        status.term_at(conflict - 1).unwrap_or(req.prev_log_term)
                    };
                }
                drop(status);
                let first_new = Some(conflict);
                self.insert_and_ack(ctx, first_new)
            }
            AppendProcState::WaitDurable { target } => {
                let status = self.status.borrow();
                if target == 0 || status.last_log_index >= target {
                    let term = status.current_term;
                    drop(status);
                    self.reply(term, true, 0, 0);
                    return Ok(Step::done());
                }
                drop(status);
                let cond = self.repl.borrow().persisted.clone();
                self.state = AppendProcState::WaitDurable { target };
                Ok(cond.wait())
            }
        }
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if let Some(reply) = self.reply.take() {
            reply(Err(error.clone()));
        }
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(Step::done());
        }
        warn!("append processing failed: {error}");
        Ok(Step::done())
    }
}

/// Handles an inbound InstallSnapshot chunk on a follower: buffers chunks,
/// installs the completed snapshot into the state machine, and resets the
/// log and status to the snapshot boundary.
pub fn process_install_snapshot(
    comps: &GroupComponents,
    ctx: &mut Ctx,
    req: InstallSnapshotReq,
    reply: ReplyTo<InstallSnapshotResp>,
) {
    let status = comps.status.clone();
    let state_machine = comps.state_machine.clone();
    let apply = comps.apply.clone();

    let mut st = status.borrow_mut();
    let current = st.current_term;
    if req.term < current {
        drop(st);
        reply(Ok(InstallSnapshotResp { term: current, success: false }));
        return;
    }
    if req.term > current || st.role != Role::Follower {
        st.step_down(req.term, ctx.now());
    }
    st.leader_id = req.leader_id;
    st.reset_elect_time(ctx.now());
    drop(st);

    // The final chunk repositions the log, which requires a drained write
    // pipeline; ask the leader to retry the chunk if it isn't.
    let appender = comps.appender();
    if req.done && !appender.borrow().drained() {
        let term = status.borrow().current_term;
        reply(Ok(InstallSnapshotResp { term, success: false }));
        return;
    }

    // Buffer the chunk; state lives in the apply manager across chunks.
    let complete = apply.borrow_mut().buffer_snapshot_chunk(req.offset, req.data.clone(), req.done);
    let term = status.borrow().current_term;
    match complete {
        Ok(None) => reply(Ok(InstallSnapshotResp { term, success: true })),
        Ok(Some(data)) => {
            let result = state_machine.borrow_mut().install_snapshot(
                req.last_included_index,
                req.last_included_term,
                &data,
            );
            match result.and_then(|()| reset_log_after_snapshot(comps, &req)) {
                Ok(()) => reply(Ok(InstallSnapshotResp { term, success: true })),
                Err(error) => {
                    warn!("snapshot install failed: {error}");
                    reply(Err(error));
                }
            }
        }
        Err(error) => reply(Err(error)),
    }
}

/// Discards the pre-snapshot log after a snapshot install: the old
/// segments and index slots describe entries the snapshot supersedes, and
/// must not survive into restart recovery. The log restarts in a fresh
/// segment; the next append lands at lastIncludedIndex + 1.
fn reset_log_after_snapshot(comps: &GroupComponents, req: &InstallSnapshotReq) -> Result<()> {
    let last = req.last_included_index;

    // Abort anything still pending; the snapshot supersedes the cached
    // tail.
    for task in comps.cache.borrow_mut().drain() {
        if let Some(reply) = task.reply {
            reply(Err(Error::Abort));
        }
    }

    let mut log = comps.log.borrow_mut();
    let fresh = {
        let mut segs = log.segs.borrow_mut();
        let anchor = log.appender.borrow().next_persist_pos;
        while !segs.is_empty() {
            segs.delete_first()?;
        }
        segs.base_of(anchor) + segs.segment_size() + crate::store::segment::SEGMENT_HEADER_SIZE
    };
    {
        let mut idx = log.idx.borrow_mut();
        idx.delete_to(Index::MAX)?;
        idx.truncate_from(1);
    }
    log.first_index = last + 1;
    log.first_term = req.last_included_term;
    log.appender.borrow_mut().set_next(last + 1, fresh);
    drop(log);

    let mut status = comps.status.borrow_mut();
    status.last_applied = last;
    status.commit_index = status.commit_index.max(last);
    status.last_log_index = last;
    status.last_log_term = req.last_included_term;
    status.term_starts.clear();
    status.note_term_start(req.last_included_term, last);
    info!(
        "group {} installed snapshot through {last}@{}",
        status.group_id, req.last_included_term
    );
    Ok(())
}
