//! The Raft state machine: roles, terms, voting, log replication, commit
//! advancement, the apply loop, membership management with joint
//! consensus, and the linear task runner accepting client submissions.
//! Each group's components run as cooperative fibers on the group's
//! dispatcher; nothing here is shared across threads.

pub mod apply;
pub mod item;
pub mod member;
pub mod message;
pub mod replicate;
pub mod runner;
pub mod state;
pub mod status;
pub mod transport;
pub mod vote;

pub use apply::{ApplyFiber, ApplyManager};
pub use item::{
    Index, ItemType, LogItem, NodeId, RaftInput, RaftOutput, RaftTask, ReadTask, Reply, TailCache,
    Term,
};
pub use member::MemberManager;
pub use replicate::ReplicationManager;
pub use runner::{ClientTask, LinearTaskRunner};
pub use state::StateMachine;
pub use status::{RaftMember, RaftStatus, Role};
pub use transport::{ReplyTo, Transport};
pub use vote::VoteManager;

use crate::fiber::GroupId;
use crate::store::{RaftLog, StatusManager};

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Per-group tuning knobs.
pub struct GroupConfig {
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub member_ids: Vec<NodeId>,
    pub observer_ids: Vec<NodeId>,
    /// How long without leader contact before an election is attempted.
    pub elect_timeout: Duration,
    /// How often an idle leader sends empty AppendEntries.
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub ping_interval: Duration,
    /// Replication batch bounds per AppendEntries request.
    pub max_replicate_items: usize,
    pub max_replicate_bytes: u64,
    pub snapshot_chunk_size: usize,
}

impl GroupConfig {
    pub fn new(group_id: GroupId, node_id: NodeId, member_ids: Vec<NodeId>) -> Self {
        Self {
            group_id,
            node_id,
            member_ids,
            observer_ids: Vec::new(),
            elect_timeout: Duration::from_millis(1500),
            heartbeat_interval: Duration::from_millis(150),
            rpc_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(2),
            max_replicate_items: 100,
            max_replicate_bytes: 1024 * 1024,
            snapshot_chunk_size: 64 * 1024,
        }
    }
}

/// The wired components of one raft group, installed as the fiber group's
/// services bundle. Request processors downcast to this to reach the
/// group's state.
pub struct GroupComponents {
    pub config: Rc<GroupConfig>,
    pub status: Rc<RefCell<RaftStatus>>,
    pub cache: Rc<RefCell<TailCache>>,
    pub log: Rc<RefCell<RaftLog>>,
    pub status_manager: Rc<RefCell<StatusManager>>,
    pub members: Rc<RefCell<MemberManager>>,
    pub vote: Rc<RefCell<VoteManager>>,
    pub repl: Rc<RefCell<ReplicationManager>>,
    pub apply: Rc<RefCell<ApplyManager>>,
    pub runner: Rc<RefCell<LinearTaskRunner>>,
    pub state_machine: Rc<RefCell<Box<dyn StateMachine>>>,
    pub transport: Arc<dyn Transport>,
}
