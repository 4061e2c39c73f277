use super::dispatcher::Submission;
use super::fiber::{FiberId, Payload, Step, Wake, WaitSource};
use super::group::{Ctx, GroupId};
use crate::error::{Error, Result};

use crossbeam::channel::Sender;
use log::debug;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::Duration;

/// The completion state of a fiber future.
enum FutureState {
    Pending,
    /// Completed successfully. The payload is handed to the first fiber that
    /// observes completion; later observers resume with empty input.
    Ok(Option<Payload>),
    Err(Error),
}

/// What polling a wait source yields.
pub(super) enum Polled {
    Ready(Option<Payload>),
    Err(Error),
    Pending,
}

/// Future internals, shared between the typed handle and the runtime.
pub struct FutureInner {
    state: FutureState,
    pub(super) waiters: VecDeque<FiberId>,
}

impl FutureInner {
    pub(super) fn poll(&mut self) -> Polled {
        match &mut self.state {
            FutureState::Pending => Polled::Pending,
            FutureState::Ok(payload) => Polled::Ready(payload.take()),
            FutureState::Err(error) => Polled::Err(error.clone()),
        }
    }
}

/// A one-shot future owned by a fiber group. Completion on the dispatcher is
/// synchronous; completion from other threads goes through a Completer,
/// which re-enters the dispatcher via the submission queue. The value is
/// delivered to the first waiter (FIFO); additional waiters observe
/// completion only. Errors are delivered to every waiter.
pub struct FiberFuture<T> {
    inner: Rc<RefCell<FutureInner>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for FiberFuture<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), _marker: PhantomData }
    }
}

impl<T: 'static> Default for FiberFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> FiberFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(FutureInner {
                state: FutureState::Pending,
                waiters: VecDeque::new(),
            })),
            _marker: PhantomData,
        }
    }

    /// Returns an already-completed future.
    pub fn ready(value: T) -> Self {
        let future = Self::new();
        future.inner.borrow_mut().state = FutureState::Ok(Some(Box::new(value)));
        future
    }

    /// Returns whether the future has completed.
    pub fn is_done(&self) -> bool {
        !matches!(self.inner.borrow().state, FutureState::Pending)
    }

    /// Completes the future on the dispatcher, waking all waiters. Repeat
    /// completions are ignored.
    pub fn complete(&self, ctx: &mut Ctx, result: Result<T>) {
        complete_raw(&self.inner, ctx, result.map(|v| Box::new(v) as Payload));
    }

    /// Suspends the current fiber until the future completes. If it already
    /// has, the fiber resumes immediately without suspending.
    pub fn wait(&self) -> Step {
        Step::Await { source: WaitSource::Future(self.inner.clone()), timeout: None }
    }

    /// Like wait, but resumes with Error::Timeout if the future doesn't
    /// complete in time. The future itself stays valid and may still
    /// complete later.
    pub fn wait_timeout(&self, timeout: Duration) -> Step {
        Step::Await { source: WaitSource::Future(self.inner.clone()), timeout: Some(timeout) }
    }

    /// Returns a Send handle that completes this future from any thread by
    /// enqueueing onto the owning dispatcher's submission queue. The future
    /// is registered with the group until completion.
    pub fn completer(&self, ctx: &mut Ctx) -> Completer<T>
    where
        T: Send,
    {
        let (tx, group, id) = ctx.register_future(self.inner.clone());
        Completer { tx, group, id, completed: false, _marker: PhantomData }
    }
}

/// Completes a future's shared state, waking waiters through the context.
pub(super) fn complete_raw(
    inner: &Rc<RefCell<FutureInner>>,
    ctx: &mut Ctx,
    result: Result<Payload>,
) {
    let waiters: Vec<FiberId> = {
        let mut inner = inner.borrow_mut();
        if !matches!(inner.state, FutureState::Pending) {
            debug!("ignoring repeat completion of fiber future");
            return;
        }
        inner.state = match result {
            Ok(payload) => FutureState::Ok(Some(payload)),
            Err(error) => FutureState::Err(error),
        };
        inner.waiters.drain(..).collect()
    };
    for (i, id) in waiters.into_iter().enumerate() {
        let mut state = inner.borrow_mut();
        let wake = match &mut state.state {
            FutureState::Ok(payload) if i == 0 => match payload.take() {
                Some(p) => Wake::Input(p),
                None => Wake::Empty,
            },
            FutureState::Ok(_) => Wake::Empty,
            FutureState::Err(error) => Wake::Err(error.clone()),
            FutureState::Pending => unreachable!("future reverted to pending"),
        };
        drop(state);
        ctx.wake(id, wake);
    }
}

/// A Send handle that completes a registered fiber future from any thread.
/// Dropping a completer without completing it completes the future with
/// Error::Abort, so a waiter never hangs on a lost reply.
pub struct Completer<T: Send + 'static> {
    tx: Sender<Submission>,
    group: GroupId,
    id: u64,
    completed: bool,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Completer<T> {
    /// Completes the registered future with the given result.
    pub fn complete(mut self, result: Result<T>) {
        self.completed = true;
        self.send(result);
    }

    fn send(&mut self, result: Result<T>) {
        let id = self.id;
        let task = Submission::Group {
            group: self.group,
            task: Box::new(move |ctx: &mut Ctx, _services: &mut dyn std::any::Any| {
                ctx.complete_registered(id, result.map(|v| Box::new(v) as Payload));
            }),
        };
        // A send failure means the dispatcher is gone; nothing to wake.
        let _ = self.tx.send(task);
    }
}

impl<T: Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.completed {
            self.send(Err(Error::Abort));
        }
    }
}
