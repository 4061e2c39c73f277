use crate::error::Result;

use serde_derive::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::time::Instant;

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A leader term. Starts at 1, indicates no term if 0.
pub type Term = u32;

/// A node ID. 0 indicates no node.
pub type NodeId = u32;

/// The kind of a log item. Normal items carry state machine commands;
/// no-ops are appended by new leaders to disambiguate previous entries (see
/// section 8 in the Raft paper); the config-change kinds drive joint
/// consensus membership transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemType {
    Normal,
    NoOp,
    PrepareConfigChange,
    CommitConfigChange,
    DropConfigChange,
}

impl ItemType {
    pub fn to_u8(self) -> u8 {
        match self {
            ItemType::Normal => 0,
            ItemType::NoOp => 1,
            ItemType::PrepareConfigChange => 2,
            ItemType::CommitConfigChange => 3,
            ItemType::DropConfigChange => 4,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ItemType::Normal,
            1 => ItemType::NoOp,
            2 => ItemType::PrepareConfigChange,
            3 => ItemType::CommitConfigChange,
            4 => ItemType::DropConfigChange,
            t => return crate::errdata!("invalid log item type {t}"),
        })
    }

    /// Returns whether this is one of the membership-change kinds.
    pub fn is_config_change(self) -> bool {
        matches!(
            self,
            ItemType::PrepareConfigChange
                | ItemType::CommitConfigChange
                | ItemType::DropConfigChange
        )
    }
}

/// A replicated log item. The header and body are opaque byte sequences;
/// the engine interprets nothing beyond the business type tag. For every
/// item, prev_log_term equals the term of the item at index - 1 (or 0 for
/// index 1), which restart recovery uses to validate log continuity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogItem {
    pub index: Index,
    pub term: Term,
    pub prev_log_term: Term,
    pub item_type: ItemType,
    /// An opaque business type tag, dispatched on by the state machine's
    /// decoder.
    pub biz_type: u16,
    /// Submission wall-clock timestamp in milliseconds.
    pub timestamp: i64,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

impl LogItem {
    /// Returns an empty item of the given type at the given position.
    pub fn new(item_type: ItemType, index: Index, term: Term, prev_log_term: Term) -> Self {
        Self {
            index,
            term,
            prev_log_term,
            item_type,
            biz_type: 0,
            timestamp: now_millis(),
            header: Vec::new(),
            body: Vec::new(),
        }
    }
}

/// Returns the current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A decoded client command: the raw body plus its decoded object (present
/// on the leader's fast path, decoded lazily otherwise), and read-only
/// bookkeeping for linearized reads.
pub struct RaftInput {
    pub biz_type: u16,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    pub decoded: Option<Box<dyn Any + Send>>,
    pub read_only: bool,
    /// Read-only requests past their deadline complete with Error::Timeout
    /// instead of executing.
    pub deadline: Option<Instant>,
}

impl RaftInput {
    /// Returns a write input carrying the given command.
    pub fn write(biz_type: u16, header: Vec<u8>, body: Vec<u8>) -> Self {
        Self { biz_type, header, body, decoded: None, read_only: false, deadline: None }
    }

    /// Returns a read-only input with an optional deadline.
    pub fn read(biz_type: u16, body: Vec<u8>, deadline: Option<Instant>) -> Self {
        Self { biz_type, header: Vec::new(), body, decoded: None, read_only: true, deadline }
    }
}

/// The result of applying a command: the log index it applied at and the
/// state machine's output.
pub struct RaftOutput {
    pub index: Index,
    pub result: Box<dyn Any + Send>,
}

/// A client reply callback, invoked on the owning dispatcher when the
/// command applies, fails, or times out.
pub type Reply = Box<dyn FnOnce(Result<RaftOutput>)>;

/// A linearized read attached to a pending write index.
pub struct ReadTask {
    pub input: RaftInput,
    pub reply: Reply,
}

/// A pending log entry: the item awaiting persistence and apply, the
/// decoded input (leader path), the client reply, and any linearized reads
/// attached at this index.
pub struct RaftTask {
    pub item: LogItem,
    pub input: Option<RaftInput>,
    pub reply: Option<Reply>,
    pub next_readers: Vec<ReadTask>,
}

impl RaftTask {
    pub fn new(item: LogItem) -> Self {
        Self { item, input: None, reply: None, next_readers: Vec::new() }
    }
}

/// The tail cache: a contiguous range map from pending index to RaftTask,
/// implemented as a ring buffer with a base index. Entries are inserted in
/// log-append order and evicted from the front as they apply.
#[derive(Default)]
pub struct TailCache {
    first: Index,
    tasks: VecDeque<RaftTask>,
}

impl TailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// The first cached index, or 0 if empty.
    pub fn first_index(&self) -> Index {
        if self.tasks.is_empty() {
            return 0;
        }
        self.first
    }

    /// The last cached index, or 0 if empty.
    pub fn last_index(&self) -> Index {
        if self.tasks.is_empty() {
            return 0;
        }
        self.first + self.tasks.len() as Index - 1
    }

    /// Inserts a task. Its index must directly follow the last cached one.
    pub fn push(&mut self, task: RaftTask) {
        let index = task.item.index;
        if self.tasks.is_empty() {
            self.first = index;
        } else {
            assert_eq!(index, self.last_index() + 1, "tail cache gap at {index}");
        }
        self.tasks.push_back(task);
    }

    pub fn get(&self, index: Index) -> Option<&RaftTask> {
        self.slot(index).map(|i| &self.tasks[i])
    }

    pub fn get_mut(&mut self, index: Index) -> Option<&mut RaftTask> {
        self.slot(index).map(move |i| &mut self.tasks[i])
    }

    fn slot(&self, index: Index) -> Option<usize> {
        if self.tasks.is_empty() || index < self.first || index > self.last_index() {
            return None;
        }
        Some((index - self.first) as usize)
    }

    /// Removes and returns the task at the front, advancing the base.
    pub fn pop_front(&mut self) -> Option<RaftTask> {
        let task = self.tasks.pop_front();
        if task.is_some() {
            self.first += 1;
        }
        task
    }

    /// Evicts all tasks at or below the given index, typically after apply.
    pub fn evict_to(&mut self, index: Index) {
        while !self.tasks.is_empty() && self.first <= index {
            self.tasks.pop_front();
            self.first += 1;
        }
    }

    /// Removes and returns all tasks at or above the given index, for
    /// conflict truncation. The removed tasks' replies must be aborted by
    /// the caller.
    pub fn truncate_from(&mut self, index: Index) -> Vec<RaftTask> {
        let mut removed = Vec::new();
        while self.last_index() >= index && !self.tasks.is_empty() {
            removed.push(self.tasks.pop_back().expect("tail cache underflow"));
        }
        removed.reverse();
        removed
    }

    /// Removes and returns all tasks, for abort on leadership loss.
    pub fn drain(&mut self) -> Vec<RaftTask> {
        self.tasks.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(index: Index, term: Term) -> RaftTask {
        RaftTask::new(LogItem::new(ItemType::Normal, index, term, 0))
    }

    #[test]
    fn tail_cache_contiguity() {
        let mut cache = TailCache::new();
        assert_eq!(cache.first_index(), 0);
        assert_eq!(cache.last_index(), 0);

        cache.push(task(5, 1));
        cache.push(task(6, 1));
        cache.push(task(7, 2));
        assert_eq!(cache.first_index(), 5);
        assert_eq!(cache.last_index(), 7);
        assert_eq!(cache.get(6).map(|t| t.item.term), Some(1));
        assert_eq!(cache.get(4).map(|t| t.item.term), None);
        assert_eq!(cache.get(8).map(|t| t.item.term), None);
    }

    #[test]
    #[should_panic(expected = "tail cache gap")]
    fn tail_cache_rejects_gaps() {
        let mut cache = TailCache::new();
        cache.push(task(1, 1));
        cache.push(task(3, 1));
    }

    #[test]
    fn tail_cache_evict_and_truncate() {
        let mut cache = TailCache::new();
        for index in 1..=5 {
            cache.push(task(index, 1));
        }

        cache.evict_to(2);
        assert_eq!(cache.first_index(), 3);
        assert_eq!(cache.last_index(), 5);

        let removed = cache.truncate_from(4);
        assert_eq!(removed.iter().map(|t| t.item.index).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(cache.last_index(), 3);

        let drained = cache.drain();
        assert_eq!(drained.len(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.last_index(), 0);
    }
}
