use super::channel::Channel;
use super::condition::Condition;
use super::future::{FutureInner, Polled};
use super::group::Ctx;
use crate::errdata;
use crate::error::{Error, Result};

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// A fiber ID, unique within its fiber group.
pub type FiberId = u64;

/// A type-erased value passed between fiber frames: the return value of a
/// finished frame, or the result of a completed future or channel receive.
pub type Payload = Box<dyn Any>;

/// The value a frame resumes with after a call or await. Empty on first
/// entry, after a sleep, and after a condition wait.
pub struct Input(Option<Payload>);

impl Input {
    pub(super) fn none() -> Self {
        Input(None)
    }

    pub(super) fn some(payload: Payload) -> Self {
        Input(Some(payload))
    }

    /// Returns whether the input carries a value.
    pub fn is_some(&self) -> bool {
        self.0.is_some()
    }

    /// Takes the input value, downcast to the expected type.
    pub fn take<T: 'static>(self) -> Result<T> {
        match self.0 {
            Some(payload) => match payload.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => errdata!("unexpected fiber input type"),
            },
            None => errdata!("missing fiber input"),
        }
    }
}

/// What a frame does next. Returned from Frame::resume, so a frame can only
/// suspend in exactly one way per step -- the original engine's "a fiber must
/// not invoke two suspensions in one step" contract is enforced by
/// construction here.
pub enum Step {
    /// Pushes a sub-frame onto the fiber stack. This frame resumes with the
    /// sub-frame's return value once it finishes.
    Call(Box<dyn Frame>),
    /// Suspends the fiber on a wait source, optionally with a timeout. On
    /// timeout the fiber resumes with Error::Timeout.
    Await { source: WaitSource, timeout: Option<Duration> },
    /// Suspends the fiber on a timer.
    Sleep(Duration),
    /// Re-enters this frame's resume immediately with empty input. Used for
    /// loops, like the original engine's self-resume.
    Again,
    /// Finishes this frame, yielding a value to the calling frame.
    Return(Payload),
}

impl Step {
    /// Returns a Step::Call of the given frame.
    pub fn call(frame: impl Frame) -> Self {
        Step::Call(Box::new(frame))
    }

    /// Returns a Step::Return of the given value.
    pub fn ret<T: 'static>(value: T) -> Self {
        Step::Return(Box::new(value))
    }

    /// Returns a unit Step::Return, finishing the frame without a value.
    pub fn done() -> Self {
        Step::ret(())
    }
}

/// One frame per suspendable call. Implementations are typically small state
/// machines: resume() runs the body from where it left off and returns the
/// next Step; the compiler makes a second suspension per step impossible.
pub trait Frame: 'static {
    /// Runs the frame body. Called on first entry with empty input, and
    /// again after each suspension with the await's result.
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step>;

    /// Handles an error raised by this frame's body or propagated from a
    /// sub-frame. Called exactly once per delivered error; an error raised
    /// by handle itself unwinds to the calling frame. The default re-raises.
    fn handle(&mut self, _ctx: &mut Ctx, error: Error) -> Result<Step> {
        Err(error)
    }

    /// Runs exactly once when the frame is popped, whether it returned or
    /// failed.
    fn finally(&mut self, _ctx: &mut Ctx) {}
}

/// Anything a fiber can block on: a condition, a future, or a channel.
/// Timers are handled separately by the dispatcher schedule queue.
#[derive(Clone)]
pub enum WaitSource {
    Condition(Condition),
    Future(Rc<RefCell<FutureInner>>),
    Channel(Rc<RefCell<ChannelInner>>),
}

impl WaitSource {
    /// Polls the source: a completed future or a non-empty channel resumes
    /// the fiber immediately instead of suspending it.
    pub(super) fn poll(&self) -> Polled {
        match self {
            WaitSource::Condition(_) => Polled::Pending,
            WaitSource::Future(inner) => inner.borrow_mut().poll(),
            WaitSource::Channel(inner) => match inner.borrow_mut().queue.pop_front() {
                Some(payload) => Polled::Ready(Some(payload)),
                None => Polled::Pending,
            },
        }
    }

    pub(super) fn add_waiter(&self, id: FiberId) {
        match self {
            WaitSource::Condition(cond) => cond.add_waiter(id),
            WaitSource::Future(inner) => inner.borrow_mut().waiters.push_back(id),
            WaitSource::Channel(inner) => inner.borrow_mut().waiters.push_back(id),
        }
    }

    pub(super) fn remove_waiter(&self, id: FiberId) {
        match self {
            WaitSource::Condition(cond) => cond.remove_waiter(id),
            WaitSource::Future(inner) => inner.borrow_mut().waiters.retain(|w| *w != id),
            WaitSource::Channel(inner) => inner.borrow_mut().waiters.retain(|w| *w != id),
        }
    }
}

/// The queue state of a fiber channel. Public only to the fiber runtime;
/// use Channel<T> for the typed API.
pub struct ChannelInner {
    pub(super) queue: std::collections::VecDeque<Payload>,
    pub(super) waiters: std::collections::VecDeque<FiberId>,
}

/// Convenience constructors for awaiting without spelling out Step::Await.
impl Condition {
    /// Waits on the condition until signaled.
    pub fn wait(&self) -> Step {
        Step::Await { source: WaitSource::Condition(self.clone()), timeout: None }
    }

    /// Waits on the condition until signaled or the timeout elapses, in
    /// which case the fiber resumes with Error::Timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Step {
        Step::Await { source: WaitSource::Condition(self.clone()), timeout: Some(timeout) }
    }
}

impl<T: 'static> Channel<T> {
    /// Receives the next item from the channel, suspending until one is
    /// available. Items go to waiting fibers in FIFO order.
    pub fn recv(&self) -> Step {
        Step::Await { source: WaitSource::Channel(self.inner()), timeout: None }
    }

    /// Like recv, but resumes with Error::Timeout if nothing arrives in
    /// time.
    pub fn recv_timeout(&self, timeout: Duration) -> Step {
        Step::Await { source: WaitSource::Channel(self.inner()), timeout: Some(timeout) }
    }
}

/// How a suspended fiber gets resumed: with nothing (conditions, sleeps),
/// with a value (futures, channels, frame returns), or with an error
/// (timeouts, interrupts, propagating failures).
pub(super) enum Wake {
    Empty,
    Input(Payload),
    Err(Error),
}

/// The scheduling state of a fiber.
pub(super) enum FiberState {
    /// On the group ready queue, or currently executing.
    Ready,
    /// Blocked on a wait source.
    Waiting(WaitSource),
    /// Blocked on a timer only.
    Sleeping,
}

/// A cooperative task: a stack of frames plus scheduling state. Owned by its
/// fiber group and only ever touched from the owning dispatcher thread.
pub(super) struct Fiber {
    pub id: FiberId,
    pub name: String,
    /// Daemon fibers don't keep the group alive: once shutdown is requested
    /// and all non-daemon fibers have finished, daemons are interrupted.
    pub daemon: bool,
    pub stack: Vec<FrameEntry>,
    pub state: FiberState,
    /// Set by interrupt() while the fiber is ready; raised as
    /// Error::Interrupt at its next suspension point.
    pub interrupted: bool,
    /// The pending resume value, set when the fiber is woken.
    pub wake: Option<Wake>,
    /// The schedule-queue sequence of the active timer, if any. Stale heap
    /// entries are dropped lazily by comparing against this.
    pub timer_seq: Option<u64>,
}

pub(super) struct FrameEntry {
    pub frame: Box<dyn Frame>,
    /// Whether handle() is running for the current error; an error raised
    /// while set unwinds to the caller instead of re-entering the handler.
    pub handled: bool,
}

impl FrameEntry {
    pub fn new(frame: Box<dyn Frame>) -> Self {
        Self { frame, handled: false }
    }
}

impl Fiber {
    pub fn new(id: FiberId, name: String, daemon: bool, frame: Box<dyn Frame>) -> Self {
        Self {
            id,
            name,
            daemon,
            stack: vec![FrameEntry::new(frame)],
            state: FiberState::Ready,
            interrupted: false,
            wake: None,
            timer_seq: None,
        }
    }
}

/// A closure-backed frame for simple bodies that run once without
/// suspending, e.g. spawning a one-shot task onto a group.
pub struct FnFrame<F: FnMut(&mut Ctx, Input) -> Result<Step> + 'static>(pub F);

impl<F: FnMut(&mut Ctx, Input) -> Result<Step> + 'static> Frame for FnFrame<F> {
    fn resume(&mut self, ctx: &mut Ctx, input: Input) -> Result<Step> {
        (self.0)(ctx, input)
    }
}
