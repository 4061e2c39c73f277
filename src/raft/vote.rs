//! Elections: the election timer, the speculative pre-vote round, the real
//! vote with synchronous term persistence, and the inbound vote processor.
//! Every voting round is tagged with a monotonically increasing vote ID;
//! responses from stale rounds are silently discarded. A candidate only
//! increments its term after a quorum grants the pre-vote, which prevents
//! disruptive term inflation from partitioned nodes.

use super::item::NodeId;
use super::message::{VoteReq, VoteResp};
use super::replicate::ReplicationManager;
use super::runner::LinearTaskRunner;
use super::status::{RaftStatus, Role};
use super::transport::{ReplyTo, Transport};
use super::{GroupComponents, GroupConfig, ItemType};
use crate::error::{Error, Result};
use crate::fiber::{Ctx, FiberFuture, Frame, Input, Step};
use crate::raft::item::TailCache;
use crate::store::{LogAppender, RaftLog, StatusManager, StatusValues, WaitWriteFinished};

use log::{debug, info, warn};
use rand::Rng as _;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

pub struct VoteManager {
    config: Rc<GroupConfig>,
    status: Rc<RefCell<RaftStatus>>,
    cache: Rc<RefCell<TailCache>>,
    log: Rc<RefCell<RaftLog>>,
    status_manager: Rc<RefCell<StatusManager>>,
    appender: Rc<RefCell<LogAppender>>,
    runner: Rc<RefCell<LinearTaskRunner>>,
    repl: Rc<RefCell<ReplicationManager>>,
    transport: Arc<dyn Transport>,
    voting: bool,
    votes: HashSet<NodeId>,
    current_vote_id: u64,
}

impl VoteManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Rc<GroupConfig>,
        status: Rc<RefCell<RaftStatus>>,
        cache: Rc<RefCell<TailCache>>,
        log: Rc<RefCell<RaftLog>>,
        status_manager: Rc<RefCell<StatusManager>>,
        appender: Rc<RefCell<LogAppender>>,
        runner: Rc<RefCell<LinearTaskRunner>>,
        repl: Rc<RefCell<ReplicationManager>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            status,
            cache,
            log,
            status_manager,
            appender,
            runner,
            repl,
            transport,
            voting: false,
            votes: HashSet::new(),
            current_vote_id: 0,
        }
    }

    /// Starts the election timer fiber.
    pub fn start(this: &Rc<RefCell<Self>>, ctx: &mut Ctx) {
        let interval =
            Duration::from_millis(150 + rand::thread_rng().gen_range(0..150));
        ctx.spawn_daemon(
            "vote-timer",
            Box::new(VoteTimerFiber { manager: this.clone(), interval, state: TimerState::Tick }),
        );
    }

    /// Invalidates the active voting round, if any.
    pub fn cancel_vote(&mut self) {
        if self.voting {
            debug!("cancelling voting round {}", self.current_vote_id);
            self.voting = false;
            self.votes.clear();
            self.current_vote_id += 1;
        }
    }

    fn init_voting(&mut self) {
        self.voting = true;
        self.current_vote_id += 1;
        self.votes = HashSet::new();
    }

    /// Returns whether enough peers are ready to reach quorum in every
    /// active member set.
    fn ready_nodes_enough(&self, status: &RaftStatus, pre_vote: bool) -> bool {
        let enough = |set: &[super::status::RaftMember]| {
            set.is_empty()
                || set.iter().filter(|m| m.ready).count() >= RaftStatus::elect_quorum(set.len())
        };
        let ok = enough(&status.members) && enough(&status.prepared_members);
        if !ok {
            warn!(
                "group {} has too few ready nodes for {}",
                status.group_id,
                if pre_vote { "pre-vote" } else { "vote" }
            );
        }
        ok
    }

    /// Sends vote requests to every ready voter, spawning a response
    /// processing fiber per request. The local node grants itself
    /// immediately.
    fn send_requests(
        this: &Rc<RefCell<Self>>,
        ctx: &mut Ctx,
        pre_vote: bool,
        lease_start: std::time::Instant,
    ) {
        let manager = this.borrow();
        let status = manager.status.borrow();
        let req = VoteReq {
            group_id: manager.config.group_id,
            term: status.current_term,
            candidate_id: manager.config.node_id,
            last_log_index: status.last_log_index,
            last_log_term: status.last_log_term,
            pre_vote,
        };
        let vote_id = manager.current_vote_id;
        let voters: Vec<NodeId> = status
            .voter_ids()
            .into_iter()
            .filter(|id| status.member(*id).is_some_and(|m| m.ready))
            .collect();
        let self_id = manager.config.node_id;
        let transport = manager.transport.clone();
        drop(status);
        drop(manager);

        info!(
            "sending {} requests for term {} (round {vote_id}) to {voters:?}",
            if pre_vote { "pre-vote" } else { "vote" },
            req.term
        );
        for peer in voters {
            let resp_fiber = if peer == self_id {
                // Implicit self-grant, processed through the same path.
                VoteRespFiber {
                    manager: this.clone(),
                    req: req.clone(),
                    peer,
                    vote_id,
                    lease_start,
                    future: None,
                    resp: Some(VoteResp { term: req.term, vote_granted: true }),
                    state: RespState::Start,
                }
            } else {
                let future = FiberFuture::<VoteResp>::new();
                let completer = future.completer(ctx);
                transport.vote(
                    peer,
                    req.clone(),
                    Box::new(move |resp| completer.complete(resp)),
                );
                VoteRespFiber {
                    manager: this.clone(),
                    req: req.clone(),
                    peer,
                    vote_id,
                    lease_start,
                    future: Some(future),
                    resp: None,
                    state: RespState::Start,
                }
            };
            ctx.spawn(
                format!("vote-resp-{vote_id}-{peer}"),
                Box::new(resp_fiber),
            );
        }
    }

    /// Starts a pre-vote round if this node is a valid candidate with
    /// enough ready peers.
    fn try_start_pre_vote(this: &Rc<RefCell<Self>>, ctx: &mut Ctx) {
        let mut manager = this.borrow_mut();
        let mut status = manager.status.borrow_mut();
        if !status.valid_candidate(manager.config.node_id) {
            debug!("group {} is not a valid candidate, skipping pre-vote", status.group_id);
            return;
        }
        if !manager.ready_nodes_enough(&status, true) {
            return;
        }
        status.reset_elect_time(ctx.now());
        let term = status.current_term;
        let last = status.last_log_index;
        drop(status);
        manager.init_voting();
        let vote_id = manager.current_vote_id;
        drop(manager);

        info!("starting pre-vote round {vote_id} at term {term}, lastIndex {last}");
        Self::send_requests(this, ctx, true, ctx.now());
    }

    /// Steps down into the given term, aborting leader-side pending work
    /// and scheduling a status persist. The returned future completes once
    /// the new term is durable.
    pub fn step_down(
        this: &Rc<RefCell<Self>>,
        ctx: &mut Ctx,
        term: super::Term,
    ) -> FiberFuture<()> {
        let manager = this.borrow();
        let was_active = {
            let mut status = manager.status.borrow_mut();
            let was_active = status.role != Role::Follower;
            status.step_down(term, ctx.now());
            was_active
        };
        if was_active {
            manager.runner.borrow().abort_pending();
        }
        drop(manager);
        this.borrow_mut().cancel_vote();

        let manager = this.borrow();
        let values = status_values(&manager.status.borrow(), &manager.log.borrow());
        let future = manager.status_manager.borrow_mut().persist(ctx, values);
        drop(manager);
        future
    }

    /// Assumes leadership after winning the vote.
    fn become_leader(&mut self, ctx: &mut Ctx) {
        {
            let mut status = self.status.borrow_mut();
            let status = &mut *status;
            info!(
                "group {} won election, becoming leader for term {}",
                status.group_id, status.current_term
            );
            status.role = Role::Leader;
            status.leader_id = status.node_id;
            // Replication starts after everything in the log, including
            // entries still pending persistence in the tail cache.
            let next_index = status.effective_last(self.cache.borrow().last_index()) + 1;
            let self_id = status.node_id;
            for member in status
                .members
                .iter_mut()
                .chain(status.prepared_members.iter_mut())
                .chain(status.observers.iter_mut())
            {
                if member.node_id != self_id {
                    member.next_index = next_index;
                    member.match_index = 0;
                }
            }
            status.reset_elect_time(ctx.now());
        }
        self.cancel_vote();

        // Propose a no-op to disambiguate previous-term entries (section 8
        // in the Raft paper), then start replicating; the first
        // AppendEntries doubles as the victory heartbeat.
        self.runner.borrow().append_task(
            ctx,
            ItemType::NoOp,
            0,
            Vec::new(),
            Vec::new(),
            None,
            None,
        );
        ReplicationManager::start_leader(&self.repl, ctx);
    }
}

/// Computes the status-file record for the current state. The persisted
/// commit index never runs ahead of the flushed index slots, so restart
/// recovery can always resolve it.
pub fn status_values(status: &RaftStatus, log: &RaftLog) -> StatusValues {
    let idx = log.idx.borrow();
    let commit = status.commit_index.min(idx.flushed());
    let pos = if commit >= log.first_index { idx.lookup(commit) } else { None };
    let (commit_index, commit_index_pos) = match pos {
        Some(pos) => (commit, pos),
        None => (0, 0),
    };
    StatusValues {
        term: status.current_term,
        voted_for: status.voted_for,
        commit_index,
        commit_index_pos,
        first_index: log.first_index,
        first_term: log.first_term,
    }
}

enum TimerState {
    Tick,
    /// Waiting for the write pipeline to drain before a pre-vote.
    AfterWriteWait,
}

/// The election timer: every 150 + rand[0,150) ms, checks whether the
/// election timeout has elapsed without leader contact, and whether a
/// leader has lost its quorum lease.
struct VoteTimerFiber {
    manager: Rc<RefCell<VoteManager>>,
    interval: Duration,
    state: TimerState,
}

impl Frame for VoteTimerFiber {
    fn resume(&mut self, ctx: &mut Ctx, _input: Input) -> Result<Step> {
        if ctx.is_stopping() {
            return Ok(Step::done());
        }
        match std::mem::replace(&mut self.state, TimerState::Tick) {
            TimerState::Tick => {
                let manager = self.manager.borrow();
                let mut status = manager.status.borrow_mut();
                let now = ctx.now();

                // A leader that can't confirm a quorum within the lease
                // horizon steps down.
                if status.role == Role::Leader {
                    let lease_lost = status.members.len() > 1
                        && status
                            .quorum_confirm(now)
                            .map_or(true, |t| now.duration_since(t) > status.elect_timeout);
                    drop(status);
                    drop(manager);
                    if lease_lost {
                        let term = self.manager.borrow().status.borrow().current_term;
                        warn!("leader lost quorum lease, stepping down");
                        VoteManager::step_down(&self.manager, ctx, term);
                    }
                    return Ok(Step::Sleep(self.interval));
                }

                let timeout =
                    now.duration_since(status.last_elect_time) > status.elect_timeout;
                drop(status);
                drop(manager);

                let mut manager = self.manager.borrow_mut();
                if manager.voting {
                    if timeout {
                        manager.cancel_vote();
                    } else {
                        return Ok(Step::Sleep(self.interval));
                    }
                }
                if !timeout {
                    return Ok(Step::Sleep(self.interval));
                }

                // Throttle failed pre-votes: push the timer forward a
                // second so a quiet failure doesn't retry every tick.
                manager.status.borrow_mut().last_elect_time += Duration::from_secs(1);

                // Don't campaign with writes in flight; the vote request
                // must advertise a settled log end.
                let drained = manager.appender.borrow().drained();
                let appender = manager.appender.clone();
                drop(manager);
                if !drained {
                    self.state = TimerState::AfterWriteWait;
                    return Ok(Step::call(WaitWriteFinished::new(appender)));
                }
                VoteManager::try_start_pre_vote(&self.manager, ctx);
                Ok(Step::Again)
            }
            TimerState::AfterWriteWait => {
                VoteManager::try_start_pre_vote(&self.manager, ctx);
                Ok(Step::Sleep(self.interval))
            }
        }
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(Step::done());
        }
        warn!("vote timer error: {error}");
        self.state = TimerState::Tick;
        Ok(Step::Sleep(self.interval))
    }
}

enum RespState {
    Start,
    Process,
    /// Waiting for the incremented term to hit disk before soliciting real
    /// votes.
    AwaitPersist,
}

/// Processes one vote (or pre-vote) response.
struct VoteRespFiber {
    manager: Rc<RefCell<VoteManager>>,
    req: VoteReq,
    peer: NodeId,
    vote_id: u64,
    lease_start: std::time::Instant,
    future: Option<FiberFuture<VoteResp>>,
    resp: Option<VoteResp>,
    state: RespState,
}

impl VoteRespFiber {
    /// Returns whether this response belongs to a stale round or the node
    /// is no longer a valid candidate.
    fn round_invalid(&self, manager: &mut VoteManager) -> bool {
        if self.vote_id != manager.current_vote_id {
            debug!("ignoring vote response from stale round {}", self.vote_id);
            return true;
        }
        let status = manager.status.borrow();
        if !status.valid_candidate(status.node_id) {
            drop(status);
            manager.cancel_vote();
            return true;
        }
        false
    }

    fn process(&mut self, ctx: &mut Ctx, resp: VoteResp) -> Result<Step> {
        let mut manager = self.manager.borrow_mut();
        if self.round_invalid(&mut manager) {
            return Ok(Step::done());
        }

        if self.req.pre_vote {
            let status = manager.status.borrow();
            let grants = resp.vote_granted
                && status.role == Role::Follower
                && resp.term == self.req.term;
            drop(status);
            if !grants {
                debug!("pre-vote not granted by {}", self.peer);
                return Ok(Step::done());
            }
            manager.votes.insert(self.peer);
            let elected = manager.status.borrow().votes_elected(&manager.votes);
            if !elected {
                return Ok(Step::done());
            }

            // Pre-vote quorum reached: increment the term, vote for self,
            // persist synchronously, then solicit real votes.
            info!("pre-vote succeeded, starting vote");
            let ready = {
                let status = manager.status.borrow();
                manager.ready_nodes_enough(&status, false)
            };
            if !ready {
                manager.cancel_vote();
                return Ok(Step::done());
            }
            manager.init_voting();
            self.vote_id = manager.current_vote_id;
            {
                let mut status = manager.status.borrow_mut();
                if status.role != Role::Candidate {
                    info!("group {} becoming candidate", status.group_id);
                    status.role = Role::Candidate;
                }
                status.current_term += 1;
                status.voted_for = status.node_id;
                status.leader_id = 0;
            }
            let values = status_values(&manager.status.borrow(), &manager.log.borrow());
            let future = manager.status_manager.borrow_mut().persist(ctx, values);
            drop(manager);
            self.state = RespState::AwaitPersist;
            return Ok(future.wait());
        }

        // A real vote response.
        let current_term = manager.status.borrow().current_term;
        if resp.term > current_term {
            info!("vote response carries higher term {}, stepping down", resp.term);
            drop(manager);
            VoteManager::step_down(&self.manager, ctx, resp.term);
            return Ok(Step::done());
        }
        if resp.term < current_term || !resp.vote_granted {
            return Ok(Step::done());
        }
        if manager.status.borrow().role != Role::Candidate {
            return Ok(Step::done());
        }
        if let Some(member) = manager.status.borrow_mut().member_mut(self.peer) {
            member.last_confirm = Some(self.lease_start);
        }
        manager.votes.insert(self.peer);
        let elected = manager.status.borrow().votes_elected(&manager.votes);
        if elected {
            manager.become_leader(ctx);
        }
        Ok(Step::done())
    }
}

impl Frame for VoteRespFiber {
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step> {
        match std::mem::replace(&mut self.state, RespState::Process) {
            RespState::Start => match (self.future.take(), self.resp.take()) {
                (Some(future), None) => {
                    let timeout = self.manager.borrow().config.rpc_timeout;
                    Ok(future.wait_timeout(timeout))
                }
                (None, Some(resp)) => self.process(ctx, resp),
                _ => unreachable!("vote response fiber needs a future or a response"),
            },
            RespState::Process => {
                let resp = input.take::<VoteResp>()?;
                self.process(ctx, resp)
            }
            RespState::AwaitPersist => {
                // The incremented term is durable; solicit real votes.
                let mut manager = self.manager.borrow_mut();
                if self.round_invalid(&mut manager) {
                    return Ok(Step::done());
                }
                let ready = {
                    let status = manager.status.borrow();
                    manager.ready_nodes_enough(&status, false)
                };
                if !ready {
                    manager.cancel_vote();
                    return Ok(Step::done());
                }
                let term = manager.status.borrow().current_term;
                drop(manager);
                info!("term {term} persisted, soliciting votes");
                VoteManager::send_requests(&self.manager, ctx, false, ctx.now());
                Ok(Step::done())
            }
        }
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(Step::done());
        }
        // RPC failures and timeouts just mean no grant from this peer.
        debug!("vote rpc to {} failed: {error}", self.peer);
        Ok(Step::done())
    }
}

/// Handles an inbound vote request. Pre-votes are answered from the
/// log-up-to-date rule alone and never persist; real votes persist the
/// term and vote before the reply leaves the node.
pub fn process_vote(comps: &GroupComponents, ctx: &mut Ctx, req: VoteReq, reply: ReplyTo<VoteResp>) {
    ctx.spawn(
        format!("vote-processor-{}", req.candidate_id),
        Box::new(VoteProcessFiber {
            status: comps.status.clone(),
            log: comps.log.clone(),
            status_manager: comps.status_manager.clone(),
            runner: comps.runner.clone(),
            vote: comps.vote.clone(),
            req,
            reply: Some(reply),
            state: ProcState::Check,
        }),
    );
}

enum ProcState {
    Check,
    AwaitPersist { granted: bool },
}

struct VoteProcessFiber {
    status: Rc<RefCell<RaftStatus>>,
    log: Rc<RefCell<RaftLog>>,
    status_manager: Rc<RefCell<StatusManager>>,
    runner: Rc<RefCell<LinearTaskRunner>>,
    vote: Rc<RefCell<VoteManager>>,
    req: VoteReq,
    reply: Option<ReplyTo<VoteResp>>,
    state: ProcState,
}

impl VoteProcessFiber {
    fn reply(&mut self, term: super::Term, vote_granted: bool) {
        if let Some(reply) = self.reply.take() {
            reply(Ok(VoteResp { term, vote_granted }));
        }
    }

    /// The log-up-to-date rule: the candidate's (lastLogTerm, lastLogIndex)
    /// must be lexicographically at or above ours.
    fn log_up_to_date(status: &RaftStatus, req: &VoteReq) -> bool {
        (req.last_log_term, req.last_log_index) >= (status.last_log_term, status.last_log_index)
    }
}

impl Frame for VoteProcessFiber {
    fn resume(&mut self, ctx: &mut Ctx, _input: Input) -> Result<Step> {
        match std::mem::replace(&mut self.state, ProcState::Check) {
            ProcState::Check => {
                let mut status = self.status.borrow_mut();
                let current = status.current_term;
                if self.req.term < current {
                    debug!(
                        "rejecting {} from {} at stale term {}",
                        if self.req.pre_vote { "pre-vote" } else { "vote" },
                        self.req.candidate_id,
                        self.req.term
                    );
                    drop(status);
                    self.reply(current, false);
                    return Ok(Step::done());
                }

                if self.req.pre_vote {
                    // Speculative: answered from the log rule alone,
                    // nothing persisted, term untouched.
                    let granted = Self::log_up_to_date(&status, &self.req);
                    drop(status);
                    self.reply(current, granted);
                    return Ok(Step::done());
                }

                let mut changed = false;
                if self.req.term > current {
                    let was_active = status.role != Role::Follower;
                    status.step_down(self.req.term, ctx.now());
                    drop(status);
                    if was_active {
                        self.runner.borrow().abort_pending();
                    }
                    self.vote.borrow_mut().cancel_vote();
                    status = self.status.borrow_mut();
                    changed = true;
                }

                let granted = (status.voted_for == 0
                    || status.voted_for == self.req.candidate_id)
                    && Self::log_up_to_date(&status, &self.req);
                if granted {
                    info!(
                        "group {} voting for {} in term {}",
                        status.group_id, self.req.candidate_id, self.req.term
                    );
                    status.voted_for = self.req.candidate_id;
                    status.reset_elect_time(ctx.now());
                    changed = true;
                }
                let term = status.current_term;
                drop(status);

                if !changed {
                    self.reply(term, false);
                    return Ok(Step::done());
                }

                // Persist the term/vote before the reply leaves this node.
                let values = status_values(&self.status.borrow(), &self.log.borrow());
                let future = self.status_manager.borrow_mut().persist(ctx, values);
                self.state = ProcState::AwaitPersist { granted };
                Ok(future.wait())
            }
            ProcState::AwaitPersist { granted } => {
                let term = self.status.borrow().current_term;
                self.reply(term, granted);
                Ok(Step::done())
            }
        }
    }

    fn handle(&mut self, _ctx: &mut Ctx, error: Error) -> Result<Step> {
        // Persist failure or shutdown: fail the reply rather than grant an
        // unpersisted vote.
        if let Some(reply) = self.reply.take() {
            reply(Err(error));
        }
        Ok(Step::done())
    }
}
