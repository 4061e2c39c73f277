use super::item::{Index, NodeId, Term};
use crate::fiber::GroupId;

use itertools::Itertools as _;
use log::info;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// A Raft role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A peer of this group, with the leader's replication cursors. The self
/// node also appears in members, with ready always true.
pub struct RaftMember {
    pub node_id: NodeId,
    /// The next index to replicate to this peer.
    pub next_index: Index,
    /// The last index known replicated to this peer.
    pub match_index: Index,
    /// When the last successful replication round-trip to this peer was
    /// launched, for the leader lease.
    pub last_confirm: Option<Instant>,
    /// Whether the peer is reachable and the ping handshake agreed.
    pub ready: bool,
    /// Whether a ping is currently in flight.
    pub pinging: bool,
    /// Bumped whenever the peer's connection state changes; pings launched
    /// under an older epoch are ignored on completion.
    pub epoch: u64,
}

impl RaftMember {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            next_index: 1,
            match_index: 0,
            last_confirm: None,
            ready: false,
            pinging: false,
            epoch: 0,
        }
    }
}

/// The authoritative mutable state of one raft group, owned by the group's
/// dispatcher and only ever touched there.
pub struct RaftStatus {
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub role: Role,
    pub current_term: Term,
    /// Who we voted for in the current term, or 0.
    pub voted_for: NodeId,
    /// The current leader, or 0 if unknown.
    pub leader_id: NodeId,
    pub commit_index: Index,
    pub last_applied: Index,
    /// The last durably persisted log position; advanced by the fsync
    /// callback. Pending tail-cache entries may extend beyond it.
    pub last_log_index: Index,
    pub last_log_term: Term,
    /// The voting members, including this node.
    pub members: Vec<RaftMember>,
    /// Non-voting observers: replicated to, never counted for quorum.
    pub observers: Vec<RaftMember>,
    /// The incoming member set during joint consensus; empty otherwise.
    /// While non-empty, elections and commits require quorums of both sets.
    pub prepared_members: Vec<RaftMember>,
    pub last_elect_time: Instant,
    pub elect_timeout: Duration,
    /// (term, first index at that term) pairs for entries known since
    /// startup, newest last. Used for commit safety checks and conflict
    /// hints; indexes below the first recorded entry are unknown.
    pub term_starts: Vec<(Term, Index)>,
}

impl RaftStatus {
    pub fn new(
        group_id: GroupId,
        node_id: NodeId,
        member_ids: &[NodeId],
        observer_ids: &[NodeId],
        elect_timeout: Duration,
        now: Instant,
    ) -> Self {
        assert!(member_ids.contains(&node_id) || observer_ids.contains(&node_id));
        let mut members: Vec<RaftMember> =
            member_ids.iter().sorted().map(|id| RaftMember::new(*id)).collect();
        for member in members.iter_mut().filter(|m| m.node_id == node_id) {
            member.ready = true;
        }
        Self {
            group_id,
            node_id,
            role: Role::Follower,
            current_term: 0,
            voted_for: 0,
            leader_id: 0,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            last_log_term: 0,
            members,
            observers: observer_ids.iter().sorted().map(|id| RaftMember::new(*id)).collect(),
            prepared_members: Vec::new(),
            last_elect_time: now,
            elect_timeout,
            term_starts: Vec::new(),
        }
    }

    /// The election quorum of a set of the given size (strict majority).
    pub fn elect_quorum(size: usize) -> usize {
        size / 2 + 1
    }

    /// Looks a member up in members, prepared members, or observers.
    pub fn member(&self, node_id: NodeId) -> Option<&RaftMember> {
        self.members
            .iter()
            .chain(self.prepared_members.iter())
            .chain(self.observers.iter())
            .find(|m| m.node_id == node_id)
    }

    pub fn member_mut(&mut self, node_id: NodeId) -> Option<&mut RaftMember> {
        self.members
            .iter_mut()
            .chain(self.prepared_members.iter_mut())
            .chain(self.observers.iter_mut())
            .find(|m| m.node_id == node_id)
    }

    /// All distinct node IDs replication must reach: members, prepared
    /// members, and observers, excluding this node.
    pub fn replication_targets(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .chain(self.prepared_members.iter())
            .chain(self.observers.iter())
            .map(|m| m.node_id)
            .filter(|id| *id != self.node_id)
            .unique()
            .sorted()
            .collect()
    }

    /// All distinct voter IDs: members plus prepared members.
    pub fn voter_ids(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .chain(self.prepared_members.iter())
            .map(|m| m.node_id)
            .unique()
            .sorted()
            .collect()
    }

    /// Returns whether the node may stand as a candidate.
    pub fn valid_candidate(&self, node_id: NodeId) -> bool {
        self.members.iter().chain(self.prepared_members.iter()).any(|m| m.node_id == node_id)
    }

    /// Returns whether the granted votes reach quorum. With a prepared
    /// member set, both the old and new majorities are required.
    pub fn votes_elected(&self, votes: &HashSet<NodeId>) -> bool {
        let count = |set: &[RaftMember]| {
            set.iter().filter(|m| votes.contains(&m.node_id)).count()
        };
        if count(&self.members) < Self::elect_quorum(self.members.len()) {
            return false;
        }
        if !self.prepared_members.is_empty()
            && count(&self.prepared_members) < Self::elect_quorum(self.prepared_members.len())
        {
            return false;
        }
        true
    }

    /// The highest index replicated to a quorum of members, and (during
    /// joint consensus) to a quorum of prepared members. This node counts
    /// with its durable last_log_index.
    pub fn quorum_match(&self) -> Index {
        let quorum_of = |set: &[RaftMember]| -> Index {
            let mut matches: Vec<Index> = set
                .iter()
                .map(|m| {
                    if m.node_id == self.node_id {
                        self.last_log_index
                    } else {
                        m.match_index
                    }
                })
                .collect();
            matches.sort_unstable_by(|a, b| b.cmp(a));
            matches[Self::elect_quorum(matches.len()) - 1]
        };
        let mut index = quorum_of(&self.members);
        if !self.prepared_members.is_empty() {
            index = index.min(quorum_of(&self.prepared_members));
        }
        index
    }

    /// The most recent instant at which a quorum had confirmed this leader,
    /// for lease-based step-down. This node counts as always confirmed;
    /// None means a quorum has never confirmed.
    pub fn quorum_confirm(&self, now: Instant) -> Option<Instant> {
        let quorum_of = |set: &[RaftMember]| -> Option<Instant> {
            let mut confirms: Vec<Option<Instant>> = set
                .iter()
                .map(|m| if m.node_id == self.node_id { Some(now) } else { m.last_confirm })
                .collect();
            confirms.sort_unstable_by(|a, b| b.cmp(a));
            confirms[Self::elect_quorum(confirms.len()) - 1]
        };
        let mut confirm = quorum_of(&self.members);
        if !self.prepared_members.is_empty() {
            confirm = confirm.min(quorum_of(&self.prepared_members));
        }
        confirm
    }

    /// The effective log end: the last tail-cache index when entries are
    /// pending, otherwise the durable last index.
    pub fn effective_last(&self, cache_last: Index) -> Index {
        cache_last.max(self.last_log_index)
    }

    /// Records that entries of the given term start at the given index.
    pub fn note_term_start(&mut self, term: Term, index: Index) {
        match self.term_starts.last() {
            Some((last_term, _)) if *last_term == term => {}
            Some((last_term, _)) => {
                assert!(*last_term < term, "term regression {last_term} → {term}");
                self.term_starts.push((term, index));
            }
            None => self.term_starts.push((term, index)),
        }
    }

    /// The term of the entry at the given index, if known since startup.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        let (_, first_index) = *self.term_starts.first()?;
        if index < first_index {
            return None;
        }
        self.term_starts
            .iter()
            .take_while(|(_, start)| *start <= index)
            .last()
            .map(|(term, _)| *term)
    }

    /// The first known index of the given term, for conflict hints.
    pub fn first_index_of_term(&self, term: Term) -> Option<Index> {
        self.term_starts.iter().find(|(t, _)| *t == term).map(|(_, index)| *index)
    }

    /// Drops term bookkeeping at and above the given index after a
    /// truncation.
    pub fn truncate_terms_from(&mut self, index: Index) {
        self.term_starts.retain(|(_, start)| *start < index);
    }

    /// Resets the election timer to now.
    pub fn reset_elect_time(&mut self, now: Instant) {
        self.last_elect_time = now;
    }

    /// Steps down into the given term as a leaderless follower. Any
    /// leader-side pending state must be aborted by the caller, and the new
    /// term persisted before replying to whatever prompted the step-down.
    pub fn step_down(&mut self, term: Term, now: Instant) {
        assert!(term >= self.current_term, "term regression {} → {term}", self.current_term);
        if term > self.current_term {
            info!(
                "group {} stepping into term {term} as follower (was {:?}@{})",
                self.group_id, self.role, self.current_term
            );
            self.current_term = term;
            self.voted_for = 0;
        } else if self.role != Role::Follower {
            info!("group {} stepping down to follower in term {term}", self.group_id);
        }
        self.role = Role::Follower;
        self.leader_id = 0;
        self.reset_elect_time(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn status(members: &[NodeId]) -> RaftStatus {
        RaftStatus::new(1, 1, members, &[], Duration::from_secs(1), Instant::now())
    }

    #[test_case(1 => 1)]
    #[test_case(2 => 2)]
    #[test_case(3 => 2)]
    #[test_case(4 => 3)]
    #[test_case(5 => 3)]
    fn elect_quorum(size: usize) -> usize {
        RaftStatus::elect_quorum(size)
    }

    #[test]
    fn quorum_match_counts_self_durable() {
        let mut status = status(&[1, 2, 3]);
        status.last_log_index = 5;
        status.member_mut(2).expect("no member").match_index = 3;
        status.member_mut(3).expect("no member").match_index = 1;
        // Matches are [5 (self), 3, 1]; the 2-of-3 quorum value is 3.
        assert_eq!(status.quorum_match(), 3);
    }

    #[test]
    fn quorum_match_joint_consensus_needs_both() {
        let mut status = status(&[1, 2, 3]);
        status.last_log_index = 9;
        status.member_mut(2).expect("no member").match_index = 9;
        status.member_mut(3).expect("no member").match_index = 9;
        // Old quorum would commit 9, but the incoming set lags at 2.
        status.prepared_members =
            vec![RaftMember::new(4), RaftMember::new(5), RaftMember::new(6)];
        for member in status.prepared_members.iter_mut() {
            member.match_index = 2;
        }
        assert_eq!(status.quorum_match(), 2);
    }

    #[test]
    fn votes_elected_joint_consensus() {
        let mut status = status(&[1, 2, 3]);
        status.prepared_members = (3..=7).map(RaftMember::new).collect();

        // 2-of-3 old but only 2-of-5 new: not elected.
        let votes: HashSet<NodeId> = [1, 3].into_iter().collect();
        assert!(!status.votes_elected(&votes));

        // 2-of-3 old and 3-of-5 new: elected.
        let votes: HashSet<NodeId> = [1, 3, 4, 5].into_iter().collect();
        assert!(status.votes_elected(&votes));
    }

    #[test]
    fn term_bookkeeping() {
        let mut status = status(&[1]);
        status.note_term_start(2, 5);
        status.note_term_start(2, 6);
        status.note_term_start(4, 9);

        assert_eq!(status.term_at(4), None);
        assert_eq!(status.term_at(5), Some(2));
        assert_eq!(status.term_at(8), Some(2));
        assert_eq!(status.term_at(9), Some(4));
        assert_eq!(status.term_at(100), Some(4));
        assert_eq!(status.first_index_of_term(4), Some(9));

        status.truncate_terms_from(9);
        assert_eq!(status.term_at(9), Some(2));
    }

    #[test]
    fn step_down_clears_vote_on_new_term() {
        let mut status = status(&[1, 2, 3]);
        status.current_term = 3;
        status.voted_for = 1;
        status.role = Role::Leader;
        status.leader_id = 1;

        status.step_down(5, Instant::now());
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.current_term, 5);
        assert_eq!(status.voted_for, 0);
        assert_eq!(status.leader_id, 0);
    }
}
