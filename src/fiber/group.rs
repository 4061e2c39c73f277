use super::dispatcher::{Submission, Timers};
use super::fiber::{Fiber, FiberId, FiberState, Frame, Payload, Wake};
use super::future::{complete_raw, FutureInner};
use crate::error::{Error, Result};

use crossbeam::channel::Sender;
use log::{debug, error};
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

/// A fiber group ID. For raft groups this is the raft group ID.
pub type GroupId = u32;

/// The set of fibers belonging to one raft group, single-threaded within a
/// dispatcher. All intra-group state is owned here and never shared across
/// threads; the only external ingress is the dispatcher submission queue.
pub(super) struct GroupState {
    pub id: GroupId,
    pub name: String,
    pub fibers: HashMap<FiberId, Fiber>,
    pub ready: VecDeque<FiberId>,
    pub next_fiber_id: FiberId,
    /// Futures registered for cross-thread completion, keyed by registry ID.
    pub registry: HashMap<u64, Rc<RefCell<FutureInner>>>,
    pub next_registry_id: u64,
    /// Group-scoped services installed at creation, downcast by submitted
    /// tasks. For raft groups this is the component bundle.
    pub services: Box<dyn Any>,
    /// Set once shutdown has been requested; fibers observe it via
    /// Ctx::is_stopping and wind down.
    pub shutdown: bool,
    /// The error that triggered shutdown, if any.
    pub fatal: Option<Error>,
    /// The number of live non-daemon fibers. The group finishes when
    /// shutdown is requested and this reaches zero.
    pub nondaemon: usize,
    pub daemons_interrupted: bool,
}

impl GroupState {
    pub fn new(id: GroupId, name: String) -> Self {
        Self {
            id,
            name,
            fibers: HashMap::new(),
            ready: VecDeque::new(),
            next_fiber_id: 1,
            registry: HashMap::new(),
            next_registry_id: 1,
            services: Box::new(()),
            shutdown: false,
            fatal: None,
            nondaemon: 0,
            daemons_interrupted: false,
        }
    }

    /// Returns whether the group has fully drained and can be removed.
    pub fn finished(&self) -> bool {
        self.shutdown && self.fibers.is_empty() && self.ready.is_empty()
    }
}

/// The execution context handed to fiber frames and submitted tasks. Gives
/// access to the owning group's runtime services: spawning, waking,
/// interrupting, shutdown, and the coarse dispatcher timestamp.
pub struct Ctx<'a> {
    pub(super) group: &'a mut GroupState,
    pub(super) timers: &'a mut Timers,
    pub(super) now: Instant,
    pub(super) tx: Sender<Submission>,
    pub(super) current: Option<FiberId>,
}

impl Ctx<'_> {
    /// Returns the dispatcher's coarse monotonic timestamp, refreshed once
    /// per dispatcher pass.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn group_id(&self) -> GroupId {
        self.group.id
    }

    pub fn group_name(&self) -> &str {
        &self.group.name
    }

    /// Returns the ID of the currently executing fiber, if called from one.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.current
    }

    /// Spawns a new fiber on this group, ready to run on the next pass.
    pub fn spawn(&mut self, name: impl Into<String>, frame: Box<dyn Frame>) -> FiberId {
        self.spawn_inner(name.into(), frame, false)
    }

    /// Spawns a daemon fiber. Daemons don't keep the group alive: they are
    /// interrupted once shutdown is requested and all non-daemon fibers have
    /// finished.
    pub fn spawn_daemon(&mut self, name: impl Into<String>, frame: Box<dyn Frame>) -> FiberId {
        self.spawn_inner(name.into(), frame, true)
    }

    fn spawn_inner(&mut self, name: String, frame: Box<dyn Frame>, daemon: bool) -> FiberId {
        let id = self.group.next_fiber_id;
        self.group.next_fiber_id += 1;
        debug!("group {} spawning fiber {name} ({id})", self.group.name);
        self.group.fibers.insert(id, Fiber::new(id, name, daemon, frame));
        if !daemon {
            self.group.nondaemon += 1;
        }
        self.group.ready.push_back(id);
        id
    }

    /// Interrupts a fiber: a suspended fiber is woken with Error::Interrupt,
    /// a ready fiber will raise it at its next suspension point. A fiber
    /// can't interrupt itself.
    pub fn interrupt(&mut self, id: FiberId) {
        debug_assert_ne!(self.current, Some(id), "fiber can't interrupt itself");
        let Some(fiber) = self.group.fibers.get_mut(&id) else { return };
        let source = match &fiber.state {
            FiberState::Ready => {
                fiber.interrupted = true;
                return;
            }
            FiberState::Waiting(source) => Some(source.clone()),
            FiberState::Sleeping => None,
        };
        if let Some(source) = source {
            source.remove_waiter(id);
        }
        self.wake(id, Wake::Err(Error::Interrupt));
    }

    /// Returns whether group shutdown has been requested.
    pub fn is_stopping(&self) -> bool {
        self.group.shutdown
    }

    /// Requests group shutdown: marks the group stopping and interrupts all
    /// suspended fibers so they can observe it. Idempotent.
    pub fn request_shutdown(&mut self) {
        if self.group.shutdown {
            return;
        }
        debug!("group {} shutting down", self.group.name);
        self.group.shutdown = true;
        let suspended: Vec<FiberId> = self
            .group
            .fibers
            .iter()
            .filter(|(id, f)| !matches!(f.state, FiberState::Ready) && Some(**id) != self.current)
            .map(|(id, _)| *id)
            .collect();
        for id in suspended {
            self.interrupt(id);
        }
    }

    /// Records a fatal error and shuts the group down. Returns the error for
    /// use in return position: `return Err(ctx.fatal(err))`.
    pub fn fatal(&mut self, error: Error) -> Error {
        error!("group {} fatal error: {error}", self.group.name);
        if self.group.fatal.is_none() {
            self.group.fatal = Some(error.clone());
        }
        self.request_shutdown();
        error
    }

    /// Returns a Send handle to this group for cross-thread submissions.
    pub fn group_handle(&self) -> GroupHandle {
        GroupHandle { tx: self.tx.clone(), group: self.group.id }
    }

    /// Wakes a suspended fiber with the given resume value.
    pub(super) fn wake(&mut self, id: FiberId, wake: Wake) {
        let Some(fiber) = self.group.fibers.get_mut(&id) else { return };
        if matches!(fiber.state, FiberState::Ready) {
            return;
        }
        fiber.state = FiberState::Ready;
        fiber.wake = Some(wake);
        fiber.timer_seq = None;
        self.group.ready.push_back(id);
    }

    /// Registers a future for cross-thread completion, returning the pieces
    /// a Completer needs.
    pub(super) fn register_future(
        &mut self,
        inner: Rc<RefCell<FutureInner>>,
    ) -> (Sender<Submission>, GroupId, u64) {
        let id = self.group.next_registry_id;
        self.group.next_registry_id += 1;
        self.group.registry.insert(id, inner);
        (self.tx.clone(), self.group.id, id)
    }

    /// Completes a registered future, removing it from the registry.
    pub(super) fn complete_registered(&mut self, id: u64, result: Result<Payload>) {
        let Some(inner) = self.group.registry.remove(&id) else {
            debug!("completion for unknown future {id} in group {}", self.group.name);
            return;
        };
        complete_raw(&inner, self, result);
    }
}

/// A Send + Clone handle to a fiber group, used to run code on the owning
/// dispatcher from other threads. The task receives the group context and
/// its services bundle.
#[derive(Clone)]
pub struct GroupHandle {
    pub(super) tx: Sender<Submission>,
    pub(super) group: GroupId,
}

impl GroupHandle {
    pub fn id(&self) -> GroupId {
        self.group
    }

    /// Submits a task to run on the group's dispatcher thread. Fails if the
    /// dispatcher has stopped.
    pub fn submit(
        &self,
        task: impl FnOnce(&mut Ctx, &mut dyn Any) + Send + 'static,
    ) -> Result<()> {
        Ok(self.tx.send(Submission::Group { group: self.group, task: Box::new(task) })?)
    }
}
