use super::item::{Index, RaftInput, Term};
use crate::error::Result;

use std::any::Any;

/// A Raft-managed state machine. The engine treats commands as opaque
/// bytes plus a business type tag; the state machine decodes and executes
/// them. exec() is called with strictly increasing indexes, without gaps,
/// on the owning dispatcher.
///
/// Write-path errors break replica determinism and are fatal to the group;
/// read-path errors are only surfaced to the calling client.
pub trait StateMachine {
    /// Decodes a command body into the object exec() will receive.
    fn decode(&self, biz_type: u16, body: &[u8]) -> Result<Box<dyn Any + Send>>;

    /// Applies a command at the given index, returning its result.
    fn exec(&mut self, index: Index, input: &RaftInput) -> Result<Box<dyn Any + Send>>;

    /// Produces a snapshot of all state applied so far.
    fn take_snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces all state with the given snapshot, which covers the log
    /// through last_index/last_term.
    fn install_snapshot(&mut self, last_index: Index, last_term: Term, data: &[u8]) -> Result<()>;
}
