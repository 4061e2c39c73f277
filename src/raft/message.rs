//! Decoded request and response objects exchanged between nodes. The wire
//! codec and transport are external collaborators; they deliver these
//! structs to the engine and carry the replies back.

use super::item::{Index, LogItem, NodeId, Term};
use crate::fiber::GroupId;

use serde_derive::{Deserialize, Serialize};

/// A vote solicitation, for both the speculative pre-vote round (which
/// never persists state on the receiver) and the real vote.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteReq {
    pub group_id: GroupId,
    pub term: Term,
    pub candidate_id: NodeId,
    /// The index of the candidate's last durable log entry.
    pub last_log_index: Index,
    /// The term of the candidate's last durable log entry.
    pub last_log_term: Term,
    pub pre_vote: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResp {
    pub term: Term,
    pub vote_granted: bool,
}

/// Log replication, also used with no entries as the leader heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReq {
    pub group_id: GroupId,
    pub term: Term,
    pub leader_id: NodeId,
    /// The index of the log entry immediately preceding the entries.
    pub prev_log_index: Index,
    /// The term of the log entry immediately preceding the entries.
    pub prev_log_term: Term,
    pub leader_commit: Index,
    pub entries: Vec<LogItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResp {
    pub term: Term,
    pub success: bool,
    /// On rejection, where the leader should probe next: the first index of
    /// the conflicting term, or one past the follower's log end.
    pub suggest_next_index: Index,
    /// The conflicting term at the rejected position, or 0.
    pub suggest_term: Term,
}

/// One chunk of a state machine snapshot streamed to a lagging follower.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotReq {
    pub group_id: GroupId,
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResp {
    pub term: Term,
    pub success: bool,
}

/// The liveness handshake. Both sides must agree on the full member and
/// observer ID sets for a peer to be considered ready.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftPing {
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub member_ids: Vec<NodeId>,
    pub observer_ids: Vec<NodeId>,
}

impl RaftPing {
    /// Returns whether two pings agree on the group topology.
    pub fn agrees_with(&self, other: &RaftPing) -> bool {
        let sorted = |ids: &[NodeId]| {
            let mut ids = ids.to_vec();
            ids.sort_unstable();
            ids
        };
        self.group_id == other.group_id
            && sorted(&self.member_ids) == sorted(&other.member_ids)
            && sorted(&self.observer_ids) == sorted(&other.observer_ids)
    }
}
