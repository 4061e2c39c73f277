use super::fiber::{FiberId, Wake};
use super::group::Ctx;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A condition variable for fibers within one group. Waiters queue in FIFO
/// order; signal wakes the first waiter, signal_all wakes every waiter.
/// Signaled fibers become ready and run on the group's next dispatcher pass.
///
/// Conditions carry no state: a signal with no waiters is lost, so loops
/// must re-check their predicate after every wakeup.
#[derive(Clone)]
pub struct Condition {
    inner: Rc<RefCell<ConditionInner>>,
}

struct ConditionInner {
    name: String,
    waiters: VecDeque<FiberId>,
}

impl Condition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ConditionInner {
                name: name.into(),
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Returns the condition's name, for logging.
    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// Wakes the first waiter, if any.
    pub fn signal(&self, ctx: &mut Ctx) {
        let waiter = self.inner.borrow_mut().waiters.pop_front();
        if let Some(id) = waiter {
            ctx.wake(id, Wake::Empty);
        }
    }

    /// Wakes all waiters.
    pub fn signal_all(&self, ctx: &mut Ctx) {
        let waiters: Vec<FiberId> = self.inner.borrow_mut().waiters.drain(..).collect();
        for id in waiters {
            ctx.wake(id, Wake::Empty);
        }
    }

    pub(super) fn add_waiter(&self, id: FiberId) {
        self.inner.borrow_mut().waiters.push_back(id);
    }

    pub(super) fn remove_waiter(&self, id: FiberId) {
        self.inner.borrow_mut().waiters.retain(|w| *w != id);
    }
}
