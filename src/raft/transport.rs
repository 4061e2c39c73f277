use super::message::{
    AppendEntriesReq, AppendEntriesResp, InstallSnapshotReq, InstallSnapshotResp, RaftPing,
    VoteReq, VoteResp,
};
use super::item::NodeId;
use crate::error::Result;

/// A reply callback carried with every outbound request. Invoked exactly
/// once, from any thread, with the decoded response or a transport error.
pub type ReplyTo<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// A transport for communication between Raft nodes. The engine hands it
/// decoded request objects with reply callbacks; the wire codec, framing
/// and connection management are entirely the transport's concern.
///
/// Implementations must eventually invoke every reply callback, with an
/// error if the peer is unreachable or the request times out on the wire.
pub trait Transport: Send + Sync {
    fn vote(&self, to: NodeId, req: VoteReq, reply: ReplyTo<VoteResp>);

    fn append_entries(&self, to: NodeId, req: AppendEntriesReq, reply: ReplyTo<AppendEntriesResp>);

    fn install_snapshot(
        &self,
        to: NodeId,
        req: InstallSnapshotReq,
        reply: ReplyTo<InstallSnapshotResp>,
    );

    fn ping(&self, to: NodeId, req: RaftPing, reply: ReplyTo<RaftPing>);
}
