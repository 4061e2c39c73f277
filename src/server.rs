//! The multi-group server: owns the dispatcher pool and the blocking-IO
//! executor, creates one fiber group per raft group, wires the per-group
//! components, and routes inbound decoded requests to the owning group.

use crate::error::Result;
use crate::fiber::{Condition, Ctx, Dispatcher, GroupHandle, IoExecutor};
use crate::raft::{
    apply::ApplyFiber,
    member::MemberManager,
    message::{
        AppendEntriesReq, AppendEntriesResp, InstallSnapshotReq, InstallSnapshotResp, RaftPing,
        VoteReq, VoteResp,
    },
    replicate::{self, ReplicationManager},
    runner::{ClientTask, RunnerFiber},
    vote::{self, VoteManager},
    ApplyManager, GroupComponents, GroupConfig, LinearTaskRunner, RaftInput, RaftOutput,
    RaftStatus, StateMachine, TailCache, Transport,
};
use crate::store::{
    RaftLog, StatusFile, StatusManager, StatusPersistFiber, StoreOptions,
};

use log::info;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

/// Server-wide options.
pub struct ServerOptions {
    pub data_dir: PathBuf,
    /// The dispatcher pool size; groups are assigned round-robin.
    pub dispatchers: usize,
    /// The blocking-IO executor thread count.
    pub io_threads: usize,
}

impl ServerOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), dispatchers: 2, io_threads: 4 }
    }
}

/// A server node hosting one or more raft groups.
pub struct Server {
    opts: ServerOptions,
    dispatchers: Vec<Dispatcher>,
    io: IoExecutor,
    groups: HashMap<crate::fiber::GroupId, RaftGroup>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        let dispatchers =
            (0..opts.dispatchers.max(1)).map(|i| Dispatcher::new(&format!("dispatcher-{i}"))).collect();
        let io = IoExecutor::new("io-worker", opts.io_threads.max(1));
        Self { opts, dispatchers, io, groups: HashMap::new() }
    }

    /// Creates and starts a raft group on the next dispatcher. The store
    /// directory defaults to `<dataDir>/g<groupId>`.
    pub fn add_group(
        &mut self,
        config: GroupConfig,
        state_machine: Box<dyn StateMachine + Send>,
        transport: Arc<dyn Transport>,
    ) -> Result<RaftGroup> {
        let store_opts = StoreOptions::new(self.opts.data_dir.join(format!("g{}", config.group_id)));
        self.add_group_with(config, store_opts, state_machine, transport)
    }

    pub fn add_group_with(
        &mut self,
        config: GroupConfig,
        store_opts: StoreOptions,
        state_machine: Box<dyn StateMachine + Send>,
        transport: Arc<dyn Transport>,
    ) -> Result<RaftGroup> {
        let group_id = config.group_id;
        let dispatcher = &self.dispatchers[self.groups.len() % self.dispatchers.len()];
        let io = self.io.handle();
        let handle = dispatcher.create_group(
            group_id,
            &format!("raft-{group_id}"),
            move |ctx| {
                let components =
                    build_group(ctx, config, store_opts, state_machine, transport, io)?;
                Ok(Box::new(components) as Box<dyn Any>)
            },
        )?;
        let group = RaftGroup { handle };
        self.groups.insert(group_id, group.clone());
        info!("started raft group {group_id}");
        Ok(group)
    }

    pub fn group(&self, id: crate::fiber::GroupId) -> Option<RaftGroup> {
        self.groups.get(&id).cloned()
    }

    /// Shuts the server down: closes every group, drains the dispatchers,
    /// and stops the IO executor.
    pub fn shutdown(mut self) {
        for group in self.groups.values() {
            let _ = group.handle.submit(|ctx, services| {
                if let Some(comps) = services.downcast_ref::<GroupComponents>() {
                    comps.log.borrow().close(ctx);
                    comps.status_manager.borrow_mut().close(ctx);
                }
                ctx.request_shutdown();
            });
        }
        for dispatcher in self.dispatchers.drain(..) {
            dispatcher.stop();
        }
        self.io.stop();
        info!("server shut down");
    }
}

/// Builds and starts all components of one group on its dispatcher.
fn build_group(
    ctx: &mut Ctx,
    config: GroupConfig,
    store_opts: StoreOptions,
    state_machine: Box<dyn StateMachine + Send>,
    transport: Arc<dyn Transport>,
    io: crate::fiber::IoHandle,
) -> Result<GroupComponents> {
    let config = Rc::new(config);
    let store_opts = Rc::new(store_opts);

    // Durable status first: it seeds the term and the recovery scan origin.
    let (status_file, values) = StatusFile::open(store_opts.dir.join("status"))?;

    let cache = Rc::new(RefCell::new(TailCache::new()));
    let status = Rc::new(RefCell::new(RaftStatus::new(
        config.group_id,
        config.node_id,
        &config.member_ids,
        &config.observer_ids,
        config.elect_timeout,
        ctx.now(),
    )));
    status.borrow_mut().current_term = values.term;
    status.borrow_mut().voted_for = values.voted_for;

    // The append callback closes over a late-bound replication manager
    // slot: it advances the durable log position and wakes whoever waits
    // on it.
    let repl_slot: Rc<RefCell<Option<Rc<RefCell<ReplicationManager>>>>> =
        Rc::new(RefCell::new(None));
    let callback_status = status.clone();
    let callback_slot = repl_slot.clone();
    let callback: crate::store::AppendCallback = Rc::new(move |ctx: &mut Ctx, term, index| {
        {
            let mut status = callback_status.borrow_mut();
            if index > status.last_log_index {
                status.last_log_index = index;
                status.last_log_term = term;
            }
        }
        let repl = callback_slot.borrow().clone();
        if let Some(repl) = repl {
            {
                let repl = repl.borrow();
                repl.persisted.signal_all(ctx);
                repl.repl_cond.signal_all(ctx);
            }
            repl.borrow().try_commit(ctx);
        }
    });

    let (log, last_index, last_term) =
        RaftLog::open(store_opts.clone(), io.clone(), cache.clone(), callback, &values)?;
    let log = Rc::new(RefCell::new(log));
    {
        let mut status = status.borrow_mut();
        let (first, boundary_term) = {
            let log = log.borrow();
            (log.first_index, log.first_term)
        };
        // With a compacted head the log position can't fall below the
        // snapshot boundary, and apply resumes just past it; the embedding
        // state machine restores its own snapshot state through it.
        status.last_log_index = last_index.max(first - 1);
        status.last_log_term = if last_index >= first { last_term } else { boundary_term };
        status.commit_index = values.commit_index.min(status.last_log_index).max(first - 1);
        status.last_applied = first - 1;
        // Conservative term seeds: older terms are learned on demand.
        if first > 1 {
            status.note_term_start(boundary_term, first - 1);
        }
        if last_index >= first && last_index > 0 {
            status.note_term_start(last_term, last_index);
        }
    }

    let status_manager = Rc::new(RefCell::new(StatusManager::new(status_file, io.clone())));
    let state_machine: Rc<RefCell<Box<dyn StateMachine>>> =
        Rc::new(RefCell::new(state_machine as Box<dyn StateMachine>));
    let apply = Rc::new(RefCell::new(ApplyManager::new(
        status.clone(),
        cache.clone(),
        log.clone(),
        state_machine.clone(),
    )));
    let apply_cond = apply.borrow().apply_cond.clone();

    let repl_cond = Condition::new("repl-work");
    let appender = log.borrow().appender.clone();
    let runner = Rc::new(RefCell::new(LinearTaskRunner::new(
        status.clone(),
        cache.clone(),
        appender.clone(),
        apply.clone(),
        state_machine.clone(),
        repl_cond.clone(),
    )));

    let repl = Rc::new(RefCell::new(ReplicationManager::new(
        config.clone(),
        status.clone(),
        cache.clone(),
        log.clone(),
        status_manager.clone(),
        runner.clone(),
        state_machine.clone(),
        transport.clone(),
        repl_cond,
        apply_cond,
    )));
    *repl_slot.borrow_mut() = Some(repl.clone());

    let vote = Rc::new(RefCell::new(VoteManager::new(
        config.clone(),
        status.clone(),
        cache.clone(),
        log.clone(),
        status_manager.clone(),
        appender,
        runner.clone(),
        repl.clone(),
        transport.clone(),
    )));

    let members = Rc::new(RefCell::new(MemberManager::new(
        config.clone(),
        status.clone(),
        runner.clone(),
        repl.clone(),
        transport.clone(),
    )));

    // Start the fibers: store pipelines, status persistence, apply loop,
    // client runner, append processing, election timer, peer pings.
    log.borrow().start(ctx);
    ctx.spawn("status-persist", Box::new(StatusPersistFiber::new(status_manager.clone())));
    ctx.spawn("apply", Box::new(ApplyFiber::new(apply.clone())));
    ctx.spawn("task-runner", Box::new(RunnerFiber::new(runner.clone())));
    VoteManager::start(&vote, ctx);
    MemberManager::start(&members, ctx);

    let components = GroupComponents {
        config,
        status,
        cache,
        log,
        status_manager,
        members,
        vote,
        repl,
        apply,
        runner,
        state_machine,
        transport,
    };
    replicate::start_append_loop(&components, ctx);
    Ok(components)
}

/// An in-process network connecting raft groups across Server instances in
/// one process: the transport used by single-process deployments and the
/// cluster tests. Requests are routed straight onto the target group's
/// dispatcher; links can be cut to simulate partitions.
#[derive(Default)]
pub struct LoopbackNet {
    routes: std::sync::Mutex<HashMap<(crate::raft::NodeId, crate::fiber::GroupId), RaftGroup>>,
    cut: std::sync::Mutex<std::collections::HashSet<(crate::raft::NodeId, crate::raft::NodeId)>>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a group under its owning node.
    pub fn register(&self, node_id: crate::raft::NodeId, group: RaftGroup) {
        self.routes.lock().expect("poisoned").insert((node_id, group.id()), group);
    }

    /// Returns the transport for one node of this network.
    pub fn transport(self: &Arc<Self>, node_id: crate::raft::NodeId) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport { node_id, net: self.clone() })
    }

    /// Cuts the link between two nodes, both directions.
    pub fn disconnect(&self, a: crate::raft::NodeId, b: crate::raft::NodeId) {
        let mut cut = self.cut.lock().expect("poisoned");
        cut.insert((a, b));
        cut.insert((b, a));
    }

    /// Restores the link between two nodes.
    pub fn heal(&self, a: crate::raft::NodeId, b: crate::raft::NodeId) {
        let mut cut = self.cut.lock().expect("poisoned");
        cut.remove(&(a, b));
        cut.remove(&(b, a));
    }

    fn route(
        &self,
        from: crate::raft::NodeId,
        to: crate::raft::NodeId,
        group: crate::fiber::GroupId,
    ) -> Result<RaftGroup> {
        if self.cut.lock().expect("poisoned").contains(&(from, to)) {
            return Err(crate::error::Error::IO(format!("link {from} → {to} is down")));
        }
        self.routes
            .lock()
            .expect("poisoned")
            .get(&(to, group))
            .cloned()
            .ok_or_else(|| crate::error::Error::IO(format!("no route to group {group} on node {to}")))
    }
}

struct LoopbackTransport {
    node_id: crate::raft::NodeId,
    net: Arc<LoopbackNet>,
}

impl Transport for LoopbackTransport {
    fn vote(
        &self,
        to: crate::raft::NodeId,
        req: VoteReq,
        reply: crate::raft::ReplyTo<VoteResp>,
    ) {
        match self.net.route(self.node_id, to, req.group_id) {
            Ok(group) => {
                let _ = group.vote(req, reply);
            }
            Err(error) => reply(Err(error)),
        }
    }

    fn append_entries(
        &self,
        to: crate::raft::NodeId,
        req: AppendEntriesReq,
        reply: crate::raft::ReplyTo<AppendEntriesResp>,
    ) {
        match self.net.route(self.node_id, to, req.group_id) {
            Ok(group) => {
                let _ = group.append_entries(req, reply);
            }
            Err(error) => reply(Err(error)),
        }
    }

    fn install_snapshot(
        &self,
        to: crate::raft::NodeId,
        req: InstallSnapshotReq,
        reply: crate::raft::ReplyTo<InstallSnapshotResp>,
    ) {
        match self.net.route(self.node_id, to, req.group_id) {
            Ok(group) => {
                let _ = group.install_snapshot(req, reply);
            }
            Err(error) => reply(Err(error)),
        }
    }

    fn ping(
        &self,
        to: crate::raft::NodeId,
        req: RaftPing,
        reply: crate::raft::ReplyTo<RaftPing>,
    ) {
        match self.net.route(self.node_id, to, req.group_id) {
            Ok(group) => {
                let _ = group.ping(req, reply);
            }
            Err(error) => reply(Err(error)),
        }
    }
}

/// A point-in-time view of a group's status.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupStatus {
    pub node_id: crate::raft::NodeId,
    pub role: crate::raft::Role,
    pub term: crate::raft::Term,
    pub leader_id: crate::raft::NodeId,
    pub commit_index: crate::raft::Index,
    pub last_applied: crate::raft::Index,
    pub last_log_index: crate::raft::Index,
    pub last_log_term: crate::raft::Term,
    pub member_ids: Vec<crate::raft::NodeId>,
    pub prepared_member_ids: Vec<crate::raft::NodeId>,
}

/// A Send + Clone handle to one raft group, routing decoded requests and
/// client submissions onto the owning dispatcher.
#[derive(Clone)]
pub struct RaftGroup {
    handle: GroupHandle,
}

impl RaftGroup {
    pub fn id(&self) -> crate::fiber::GroupId {
        self.handle.id()
    }

    fn with_components(
        &self,
        f: impl FnOnce(&mut Ctx, &GroupComponents) + Send + 'static,
    ) -> Result<()> {
        self.handle.submit(move |ctx, services| {
            let comps = services.downcast_ref::<GroupComponents>().expect("group has no components");
            f(ctx, comps);
        })
    }

    /// Fetches a snapshot of the group's status, for admin and tests.
    pub fn status(&self, reply: impl FnOnce(GroupStatus) + Send + 'static) -> Result<()> {
        self.with_components(move |_ctx, comps| {
            let status = comps.status.borrow();
            reply(GroupStatus {
                node_id: status.node_id,
                role: status.role,
                term: status.current_term,
                leader_id: status.leader_id,
                commit_index: status.commit_index,
                last_applied: status.last_applied,
                last_log_index: status.last_log_index,
                last_log_term: status.last_log_term,
                member_ids: status.members.iter().map(|m| m.node_id).collect(),
                prepared_member_ids: status.prepared_members.iter().map(|m| m.node_id).collect(),
            });
        })
    }

    /// Routes an inbound vote request.
    pub fn vote(&self, req: VoteReq, reply: crate::raft::ReplyTo<VoteResp>) -> Result<()> {
        self.with_components(move |ctx, comps| vote::process_vote(comps, ctx, req, reply))
    }

    /// Routes an inbound AppendEntries request.
    pub fn append_entries(
        &self,
        req: AppendEntriesReq,
        reply: crate::raft::ReplyTo<AppendEntriesResp>,
    ) -> Result<()> {
        self.with_components(move |ctx, comps| replicate::process_append(comps, ctx, req, reply))
    }

    /// Routes an inbound InstallSnapshot chunk.
    pub fn install_snapshot(
        &self,
        req: InstallSnapshotReq,
        reply: crate::raft::ReplyTo<InstallSnapshotResp>,
    ) -> Result<()> {
        self.with_components(move |ctx, comps| {
            replicate::process_install_snapshot(comps, ctx, req, reply)
        })
    }

    /// Answers an inbound raft-ping with this node's view of the topology.
    pub fn ping(&self, req: RaftPing, reply: crate::raft::ReplyTo<RaftPing>) -> Result<()> {
        self.with_components(move |_ctx, comps| {
            log::debug!("raft ping from node {} for group {}", req.node_id, req.group_id);
            let status = comps.status.borrow();
            let resp = RaftPing {
                group_id: status.group_id,
                node_id: status.node_id,
                member_ids: status.members.iter().map(|m| m.node_id).collect(),
                observer_ids: status.observers.iter().map(|m| m.node_id).collect(),
            };
            drop(status);
            reply(Ok(resp));
        })
    }

    /// Submits a client command (write, or linearized read when the input
    /// is read-only). The reply callback runs on the dispatcher once the
    /// command applies, fails, or times out.
    pub fn submit(
        &self,
        input: RaftInput,
        reply: impl FnOnce(Result<RaftOutput>) + Send + 'static,
    ) -> Result<()> {
        self.with_components(move |ctx, comps| {
            comps.runner.borrow().submit(ctx, ClientTask { input, reply: Box::new(reply) });
        })
    }

    /// Garbage-collects log segments wholly below the given index, after
    /// the state machine has taken a snapshot covering them.
    pub fn compact_log(&self, first_required: crate::raft::Index) -> Result<()> {
        self.with_components(move |_ctx, comps| {
            if let Err(error) = comps.log.borrow_mut().delete_to(first_required) {
                log::warn!("log compaction to {first_required} failed: {error}");
            }
        })
    }

    /// Begins a joint consensus membership change (Cold,new).
    pub fn prepare_member_change(
        &self,
        new_member_ids: Vec<crate::raft::NodeId>,
        reply: impl FnOnce(Result<RaftOutput>) + Send + 'static,
    ) -> Result<()> {
        self.with_components(move |ctx, comps| {
            comps.members.borrow().prepare_change(ctx, new_member_ids, Box::new(reply));
        })
    }

    /// Completes a joint consensus membership change (Cnew).
    pub fn commit_member_change(
        &self,
        reply: impl FnOnce(Result<RaftOutput>) + Send + 'static,
    ) -> Result<()> {
        self.with_components(move |ctx, comps| {
            comps.members.borrow().commit_change(ctx, Box::new(reply));
        })
    }

    /// Abandons an in-progress membership change.
    pub fn drop_member_change(
        &self,
        reply: impl FnOnce(Result<RaftOutput>) + Send + 'static,
    ) -> Result<()> {
        self.with_components(move |ctx, comps| {
            comps.members.borrow().drop_change(ctx, Box::new(reply));
        })
    }
}
