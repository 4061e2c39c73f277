//! Peer health tracking and joint consensus bookkeeping. A periodic
//! raft-ping carries the full member and observer ID sets; a peer becomes
//! ready only if the ping succeeds, both sides agree on the sets, and the
//! peer's connection epoch hasn't changed since the ping was launched.
//! Membership changes run on the dispatcher, serialized with replication
//! decisions, and use two log entries: Cold,new installs the prepared
//! member set (quorums henceforth require both sets), Cnew replaces the
//! members with it.

use super::item::{ItemType, LogItem, NodeId, Reply};
use super::replicate::ReplicationManager;
use super::runner::LinearTaskRunner;
use super::status::{RaftMember, RaftStatus, Role};
use super::transport::Transport;
use super::GroupConfig;
use crate::encoding::bincode;
use crate::error::{Error, Result};
use crate::fiber::{Ctx, FiberFuture, Frame, Input, Step};

use log::{debug, info, warn};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

pub struct MemberManager {
    config: Rc<GroupConfig>,
    status: Rc<RefCell<RaftStatus>>,
    runner: Rc<RefCell<LinearTaskRunner>>,
    repl: Rc<RefCell<ReplicationManager>>,
    transport: Arc<dyn Transport>,
}

impl MemberManager {
    pub fn new(
        config: Rc<GroupConfig>,
        status: Rc<RefCell<RaftStatus>>,
        runner: Rc<RefCell<LinearTaskRunner>>,
        repl: Rc<RefCell<ReplicationManager>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self { config, status, runner, repl, transport }
    }

    /// Starts a ping fiber per known peer.
    pub fn start(this: &Rc<RefCell<Self>>, ctx: &mut Ctx) {
        let peers = this.borrow().status.borrow().replication_targets();
        for peer in peers {
            Self::start_ping(this, ctx, peer);
        }
    }

    fn start_ping(this: &Rc<RefCell<Self>>, ctx: &mut Ctx, peer: NodeId) {
        ctx.spawn_daemon(
            format!("ping-{peer}"),
            Box::new(PingFiber { manager: this.clone(), peer, state: PingState::Sleep }),
        );
    }

    /// Begins a joint consensus transition to the given member set by
    /// proposing the Cold,new entry. Leader only; fails if a transition is
    /// already in progress. Errors are delivered through the reply.
    pub fn prepare_change(&self, ctx: &mut Ctx, new_member_ids: Vec<NodeId>, reply: Reply) {
        let mut reply = Some(reply);
        let result = (|| {
            let status = self.status.borrow();
            if status.role != Role::Leader {
                return Err(Error::NotLeader(status.leader_id));
            }
            if !status.prepared_members.is_empty() {
                return crate::errinput!("a membership change is already in progress");
            }
            let old_ids: Vec<NodeId> = status.members.iter().map(|m| m.node_id).collect();
            drop(status);

            info!(
                "group {} preparing member change {old_ids:?} → {new_member_ids:?}",
                self.config.group_id
            );
            let body = bincode::serialize(&(old_ids, new_member_ids))?;
            self.append_config(
                ctx,
                ItemType::PrepareConfigChange,
                body,
                reply.take().expect("reply consumed"),
            )
        })();
        if let (Err(error), Some(reply)) = (result, reply.take()) {
            reply(Err(error));
        }
    }

    /// Completes the transition by proposing Cnew. Leader only. Errors are
    /// delivered through the reply.
    pub fn commit_change(&self, ctx: &mut Ctx, reply: Reply) {
        let mut reply = Some(reply);
        let result = (|| {
            let status = self.status.borrow();
            if status.role != Role::Leader {
                return Err(Error::NotLeader(status.leader_id));
            }
            if status.prepared_members.is_empty() {
                return crate::errinput!("no membership change in progress");
            }
            let old_ids: Vec<NodeId> = status.members.iter().map(|m| m.node_id).collect();
            let new_ids: Vec<NodeId> =
                status.prepared_members.iter().map(|m| m.node_id).collect();
            drop(status);

            info!("group {} committing member change to {new_ids:?}", self.config.group_id);
            let body = bincode::serialize(&(old_ids, new_ids))?;
            self.append_config(
                ctx,
                ItemType::CommitConfigChange,
                body,
                reply.take().expect("reply consumed"),
            )
        })();
        if let (Err(error), Some(reply)) = (result, reply.take()) {
            reply(Err(error));
        }
    }

    /// Abandons an in-progress transition. Leader only. Errors are
    /// delivered through the reply.
    pub fn drop_change(&self, ctx: &mut Ctx, reply: Reply) {
        let mut reply = Some(reply);
        let result = (|| {
            let status = self.status.borrow();
            if status.role != Role::Leader {
                return Err(Error::NotLeader(status.leader_id));
            }
            let old_ids: Vec<NodeId> = status.members.iter().map(|m| m.node_id).collect();
            drop(status);

            info!("group {} dropping in-progress member change", self.config.group_id);
            let body = bincode::serialize(&(old_ids.clone(), old_ids))?;
            self.append_config(
                ctx,
                ItemType::DropConfigChange,
                body,
                reply.take().expect("reply consumed"),
            )
        })();
        if let (Err(error), Some(reply)) = (result, reply.take()) {
            reply(Err(error));
        }
    }

    fn append_config(
        &self,
        ctx: &mut Ctx,
        item_type: ItemType,
        body: Vec<u8>,
        reply: Reply,
    ) -> Result<()> {
        let runner = self.runner.borrow();
        let index =
            runner.append_task(ctx, item_type, 0, Vec::new(), body.clone(), None, Some(reply));
        drop(runner);

        // The configuration takes effect as soon as the entry is appended,
        // not when it commits (see section 6 in the Raft paper).
        let mut item = LogItem::new(item_type, index, 0, 0);
        item.body = body;
        apply_config_change(&mut self.status.borrow_mut(), &item)?;
        self.repl.borrow().refresh_members(ctx);
        Ok(())
    }
}

/// Applies a configuration-change entry to the member sets. Invoked on the
/// leader when the entry is proposed and on followers when it is appended.
pub fn apply_config_change(status: &mut RaftStatus, item: &LogItem) -> Result<()> {
    let (_, new_ids): (Vec<NodeId>, Vec<NodeId>) = bincode::deserialize(&item.body)?;
    match item.item_type {
        ItemType::PrepareConfigChange => {
            status.prepared_members = new_ids
                .iter()
                .map(|id| {
                    // Carry over cursors for nodes already tracked.
                    let mut member = RaftMember::new(*id);
                    if let Some(existing) = status.member(*id) {
                        member.next_index = existing.next_index;
                        member.match_index = existing.match_index;
                        member.ready = existing.ready;
                    } else {
                        member.next_index = status.last_log_index + 1;
                    }
                    if *id == status.node_id {
                        member.ready = true;
                    }
                    member
                })
                .collect();
            info!("group {} entered joint consensus with {new_ids:?}", status.group_id);
        }
        ItemType::CommitConfigChange => {
            if status.prepared_members.is_empty() {
                debug!("group {} Cnew without prepared members, ignoring", status.group_id);
                return Ok(());
            }
            status.members = std::mem::take(&mut status.prepared_members);
            info!("group {} left joint consensus, members now {new_ids:?}", status.group_id);
        }
        ItemType::DropConfigChange => {
            status.prepared_members.clear();
            info!("group {} dropped prepared members", status.group_id);
        }
        _ => unreachable!("not a config change item"),
    }
    Ok(())
}

enum PingState {
    Sleep,
    Waiting { epoch: u64, sent: super::message::RaftPing },
}

/// The per-peer liveness fiber.
struct PingFiber {
    manager: Rc<RefCell<MemberManager>>,
    peer: NodeId,
    state: PingState,
}

impl Frame for PingFiber {
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step> {
        match std::mem::replace(&mut self.state, PingState::Sleep) {
            PingState::Sleep => {
                if ctx.is_stopping() {
                    return Ok(Step::done());
                }
                let manager = self.manager.borrow();
                let mut status = manager.status.borrow_mut();
                let req = super::message::RaftPing {
                    group_id: manager.config.group_id,
                    node_id: manager.config.node_id,
                    member_ids: status.members.iter().map(|m| m.node_id).collect(),
                    observer_ids: status.observers.iter().map(|m| m.node_id).collect(),
                };
                let Some(member) = status.member_mut(self.peer) else {
                    // The peer left the group; stop pinging it.
                    return Ok(Step::done());
                };
                member.pinging = true;
                let epoch = member.epoch;
                drop(status);
                let transport = manager.transport.clone();
                let rpc_timeout = manager.config.rpc_timeout;
                drop(manager);

                let future = FiberFuture::new();
                let completer = future.completer(ctx);
                transport.ping(self.peer, req.clone(), Box::new(move |resp| {
                    completer.complete(resp);
                }));
                self.state = PingState::Waiting { epoch, sent: req };
                Ok(future.wait_timeout(rpc_timeout))
            }
            PingState::Waiting { epoch, sent } => {
                let resp = input.take::<super::message::RaftPing>()?;
                let manager = self.manager.borrow();
                let mut status = manager.status.borrow_mut();
                if let Some(member) = status.member_mut(self.peer) {
                    member.pinging = false;
                    let agreed = resp.agrees_with(&sent) && resp.node_id == self.peer;
                    // A stale ping (epoch changed mid-flight) proves nothing.
                    if member.epoch == epoch {
                        if member.ready != agreed {
                            info!("peer {} ready: {} → {agreed}", self.peer, member.ready);
                        }
                        member.ready = agreed;
                        if !agreed {
                            warn!("peer {} ping disagreed on group topology", self.peer);
                        }
                    }
                }
                drop(status);
                drop(manager);
                Ok(Step::Sleep(self.manager.borrow().config.ping_interval))
            }
        }
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        if matches!(error, Error::Interrupt) || ctx.is_stopping() {
            return Ok(Step::done());
        }
        // Ping failure or timeout: the peer is unreachable. Bump the epoch
        // so a response from the failed attempt can't mark it ready.
        let manager = self.manager.borrow();
        let mut status = manager.status.borrow_mut();
        if let Some(member) = status.member_mut(self.peer) {
            member.pinging = false;
            member.epoch += 1;
            if member.ready {
                info!("peer {} became unreachable: {error}", self.peer);
            }
            member.ready = false;
        }
        drop(status);
        let interval = manager.config.ping_interval;
        drop(manager);
        self.state = PingState::Sleep;
        Ok(Step::Sleep(interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn status(members: &[NodeId]) -> RaftStatus {
        RaftStatus::new(1, 1, members, &[], Duration::from_secs(1), Instant::now())
    }

    fn config_item(item_type: ItemType, old: &[NodeId], new: &[NodeId]) -> LogItem {
        let mut item = LogItem::new(item_type, 1, 1, 0);
        item.body = bincode::serialize(&(old.to_vec(), new.to_vec())).expect("encode failed");
        item
    }

    #[test]
    fn joint_consensus_lifecycle() -> Result<()> {
        let mut status = status(&[1, 2, 3]);
        status.last_log_index = 10;

        // Cold,new: both sets active.
        let prepare = config_item(ItemType::PrepareConfigChange, &[1, 2, 3], &[1, 2, 3, 4, 5]);
        apply_config_change(&mut status, &prepare)?;
        assert_eq!(status.prepared_members.len(), 5);
        assert_eq!(status.members.len(), 3);
        // New nodes start replicating from the log end.
        assert_eq!(
            status.prepared_members.iter().find(|m| m.node_id == 4).map(|m| m.next_index),
            Some(11)
        );

        // Cnew: the new set takes over.
        let commit = config_item(ItemType::CommitConfigChange, &[1, 2, 3], &[1, 2, 3, 4, 5]);
        apply_config_change(&mut status, &commit)?;
        assert_eq!(status.members.len(), 5);
        assert!(status.prepared_members.is_empty());
        Ok(())
    }

    #[test]
    fn drop_change_clears_prepared() -> Result<()> {
        let mut status = status(&[1, 2, 3]);
        let prepare = config_item(ItemType::PrepareConfigChange, &[1, 2, 3], &[4, 5, 6]);
        apply_config_change(&mut status, &prepare)?;
        assert!(!status.prepared_members.is_empty());

        let drop_item = config_item(ItemType::DropConfigChange, &[1, 2, 3], &[1, 2, 3]);
        apply_config_change(&mut status, &drop_item)?;
        assert!(status.prepared_members.is_empty());
        assert_eq!(status.members.len(), 3);
        Ok(())
    }
}
