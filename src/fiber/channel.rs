use super::fiber::{ChannelInner, FiberId, Payload, Wake};
use super::group::Ctx;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::Rc;

/// An unbounded FIFO channel between fibers of one group. Producers push
/// synchronously on the dispatcher; consumers suspend via recv(). Producers
/// on other threads go through GroupHandle::submit and push on arrival.
pub struct Channel<T> {
    inner: Rc<RefCell<ChannelInner>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), _marker: PhantomData }
    }
}

impl<T: 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Channel<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChannelInner {
                queue: VecDeque::new(),
                waiters: VecDeque::new(),
            })),
            _marker: PhantomData,
        }
    }

    /// Pushes an item, handing it directly to the first waiting fiber if
    /// there is one.
    pub fn push(&self, ctx: &mut Ctx, item: T) {
        let waiter: Option<FiberId> = self.inner.borrow_mut().waiters.pop_front();
        match waiter {
            Some(id) => ctx.wake(id, Wake::Input(Box::new(item))),
            None => self.inner.borrow_mut().queue.push_back(Box::new(item) as Payload),
        }
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().queue.is_empty()
    }

    pub(super) fn inner(&self) -> Rc<RefCell<ChannelInner>> {
        self.inner.clone()
    }
}
