//! A cooperative fiber runtime. Each dispatcher thread runs a
//! single-threaded scheduler over one or more fiber groups; within a group
//! every subsystem runs as cooperative fibers, and no locks are taken
//! against intra-group state.
//!
//! Fibers are stacks of [`Frame`]s. A frame's `resume` runs the body until
//! it either finishes or suspends, returning a single [`Step`]: call a
//! sub-frame, await a [`WaitSource`] (condition, future, or channel), sleep
//! on a timer, loop, or return a value. Because each step yields exactly one
//! suspension, the "one suspension per step" contract is enforced by
//! construction.
//!
//! Cross-thread hand-off happens only through the dispatcher submission
//! queue: other threads submit closures via [`GroupHandle`], and blocking IO
//! results re-enter through [`Completer`]s that complete fiber futures.

mod channel;
mod condition;
mod dispatcher;
mod fiber;
mod future;
mod group;
mod io;

pub use channel::Channel;
pub use condition::Condition;
pub use dispatcher::Dispatcher;
pub use fiber::{FiberId, FnFrame, Frame, Input, Payload, Step, WaitSource};
pub use future::{Completer, FiberFuture};
pub use group::{Ctx, GroupHandle, GroupId};
pub use io::{IoExecutor, IoHandle};
