use super::fiber::{FiberId, FiberState, Input, Step, Wake};
use super::future::Polled;
use super::group::{Ctx, GroupHandle, GroupId, GroupState};
use crate::error::{Error, Result};
use crate::errinput;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// How long the dispatcher blocks on the submission queue when it has no
/// earlier timer deadline and no ready fibers.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// A task submitted to the dispatcher from any thread. This queue is the
/// only legal ingress into a dispatcher; fiber and group state is never
/// touched from other threads.
pub(crate) enum Submission {
    /// Runs with a group's context and its services bundle.
    Group { group: GroupId, task: Box<dyn FnOnce(&mut Ctx, &mut dyn Any) + Send> },
    /// Dispatcher-wide control: group creation and shutdown.
    Control(Box<dyn FnOnce(&mut DispatcherState) + Send>),
}

/// The timer schedule queue: a min-heap of deadlines with a monotonic
/// sequence tiebreaker, so equal deadlines fire in schedule order.
pub(crate) struct Timers {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
}

#[derive(PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    group: GroupId,
    fiber: FiberId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Timers {
    fn new() -> Self {
        Self { heap: BinaryHeap::new(), next_seq: 1 }
    }

    /// Schedules a wakeup, returning the sequence number used for lazy
    /// cancellation: a fiber woken by other means clears its timer_seq and
    /// the stale heap entry is dropped when it surfaces.
    pub(super) fn schedule(&mut self, deadline: Instant, group: GroupId, fiber: FiberId) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(TimerEntry { deadline, seq, group, fiber }));
        seq
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    fn pop_expired(&mut self, now: Instant) -> Option<TimerEntry> {
        if self.heap.peek().is_some_and(|Reverse(e)| e.deadline <= now) {
            return self.heap.pop().map(|Reverse(e)| e);
        }
        None
    }
}

/// A dispatcher thread owning zero or more fiber groups. Runs a cooperative
/// single-threaded scheduler: within a group, one fiber executes at a time
/// and all state is mutated only on this thread.
pub struct Dispatcher {
    tx: Sender<Submission>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Dispatcher {
    /// Starts a new dispatcher thread.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = crossbeam::channel::unbounded();
        let thread_name = name.to_string();
        let thread_tx = tx.clone();
        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || DispatcherState::new(thread_name, thread_tx).run(rx))
            .expect("failed to spawn dispatcher thread");
        Self { tx, thread: Some(thread) }
    }

    /// Creates a fiber group on this dispatcher. The init closure runs on
    /// the dispatcher thread, typically spawning the group's fibers, and
    /// returns the group's services bundle. Blocks until the group exists;
    /// a failed init removes the group again.
    pub fn create_group(
        &self,
        id: GroupId,
        name: &str,
        init: impl FnOnce(&mut Ctx) -> Result<Box<dyn Any>> + Send + 'static,
    ) -> Result<GroupHandle> {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        let group_name = name.to_string();
        self.tx.send(Submission::Control(Box::new(move |state| {
            let _ = reply_tx.send(state.create_group(id, group_name, Box::new(init)));
        })))?;
        reply_rx.recv()??;
        Ok(GroupHandle { tx: self.tx.clone(), group: id })
    }

    /// Returns a handle to a group by ID. The handle is valid regardless of
    /// whether the group exists; submissions to unknown groups are dropped.
    pub fn group(&self, id: GroupId) -> GroupHandle {
        GroupHandle { tx: self.tx.clone(), group: id }
    }

    /// Stops the dispatcher: requests shutdown of every group, waits for
    /// them to drain, and joins the thread.
    pub fn stop(mut self) {
        self.initiate_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn initiate_stop(&self) {
        let _ = self.tx.send(Submission::Control(Box::new(|state| state.stop())));
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.initiate_stop();
            let _ = thread.join();
        }
    }
}

/// Dispatcher-thread state. Only ever touched from the dispatcher thread.
pub(crate) struct DispatcherState {
    name: String,
    tx: Sender<Submission>,
    groups: HashMap<GroupId, GroupState>,
    timers: Timers,
    now: Instant,
    stopping: bool,
}

impl DispatcherState {
    fn new(name: String, tx: Sender<Submission>) -> Self {
        Self {
            name,
            tx,
            groups: HashMap::new(),
            timers: Timers::new(),
            now: Instant::now(),
            stopping: false,
        }
    }

    /// The dispatcher main loop: drain submissions (blocking only when no
    /// fiber is ready), refresh the coarse timestamp, fire expired timers,
    /// then run each ready group's fibers bounded to the queue length at
    /// entry so newly-readied fibers wait a pass and timers can't starve.
    fn run(mut self, rx: Receiver<Submission>) {
        loop {
            if self.any_ready() {
                while let Ok(submission) = rx.try_recv() {
                    self.apply(submission);
                }
            } else {
                let timeout = self
                    .timers
                    .next_deadline()
                    .map(|d| d.saturating_duration_since(Instant::now()))
                    .unwrap_or(POLL_TIMEOUT)
                    .min(POLL_TIMEOUT);
                match rx.recv_timeout(timeout) {
                    Ok(submission) => {
                        self.apply(submission);
                        while let Ok(submission) = rx.try_recv() {
                            self.apply(submission);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            self.now = Instant::now();
            self.fire_timers();
            self.run_ready();

            if self.stopping && self.groups.is_empty() {
                break;
            }
        }
        info!("fiber dispatcher {} exited", self.name);
    }

    fn any_ready(&self) -> bool {
        self.groups.values().any(|g| !g.ready.is_empty())
    }

    fn apply(&mut self, submission: Submission) {
        match submission {
            Submission::Control(task) => task(self),
            Submission::Group { group, task } => {
                let Some(state) = self.groups.get_mut(&group) else {
                    debug!("dropping submission for unknown group {group}");
                    return;
                };
                let mut services = std::mem::replace(&mut state.services, Box::new(()));
                self.with_ctx(group, |ctx| task(ctx, services.as_mut()));
                if let Some(state) = self.groups.get_mut(&group) {
                    state.services = services;
                }
            }
        }
    }

    /// Runs a closure with a group's context, splitting the borrow between
    /// the group and the shared timer heap.
    fn with_ctx<R>(&mut self, group: GroupId, f: impl FnOnce(&mut Ctx) -> R) -> Option<R> {
        let DispatcherState { groups, timers, tx, now, .. } = self;
        let group = groups.get_mut(&group)?;
        let mut ctx = Ctx { group, timers, now: *now, tx: tx.clone(), current: None };
        Some(f(&mut ctx))
    }

    fn create_group(
        &mut self,
        id: GroupId,
        name: String,
        init: Box<dyn FnOnce(&mut Ctx) -> Result<Box<dyn Any>> + Send>,
    ) -> Result<()> {
        if self.stopping {
            return errinput!("dispatcher {} is stopping", self.name);
        }
        if self.groups.contains_key(&id) {
            return errinput!("group {id} already exists on dispatcher {}", self.name);
        }
        info!("dispatcher {} starting fiber group {name} ({id})", self.name);
        self.groups.insert(id, GroupState::new(id, name));
        match self.with_ctx(id, |ctx| init(ctx)).expect("group vanished during init") {
            Ok(services) => {
                self.groups.get_mut(&id).expect("group vanished during init").services = services;
                Ok(())
            }
            Err(error) => {
                self.groups.remove(&id);
                Err(error)
            }
        }
    }

    fn stop(&mut self) {
        self.stopping = true;
        let ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for id in ids {
            self.with_ctx(id, |ctx| ctx.request_shutdown());
        }
    }

    /// Promotes fibers whose deadline has elapsed: sleepers resume normally,
    /// waiters are removed from their wait source and resume with
    /// Error::Timeout.
    fn fire_timers(&mut self) {
        while let Some(entry) = self.timers.pop_expired(self.now) {
            let Some(group) = self.groups.get_mut(&entry.group) else { continue };
            let Some(fiber) = group.fibers.get_mut(&entry.fiber) else { continue };
            if fiber.timer_seq != Some(entry.seq) {
                continue; // stale entry, fiber was woken by other means
            }
            fiber.timer_seq = None;
            match std::mem::replace(&mut fiber.state, FiberState::Ready) {
                FiberState::Waiting(source) => {
                    source.remove_waiter(entry.fiber);
                    fiber.wake = Some(Wake::Err(Error::Timeout));
                }
                FiberState::Sleeping => fiber.wake = Some(Wake::Empty),
                FiberState::Ready => continue,
            }
            group.ready.push_back(entry.fiber);
        }
    }

    fn run_ready(&mut self) {
        let ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for id in ids {
            let count = self.groups.get(&id).map_or(0, |g| g.ready.len());
            for _ in 0..count {
                let Some(fiber) = self.groups.get_mut(&id).and_then(|g| g.ready.pop_front())
                else {
                    break;
                };
                self.exec_fiber(id, fiber);
            }
            self.maybe_finish_group(id);
        }
    }

    /// Executes one fiber until it suspends or finishes, walking its frame
    /// stack: frame returns resume the caller, errors walk up through
    /// handle() then finally() on each frame while unwinding.
    fn exec_fiber(&mut self, group_id: GroupId, fiber_id: FiberId) {
        let DispatcherState { groups, timers, tx, now, .. } = self;
        let Some(group) = groups.get_mut(&group_id) else { return };
        let Some(mut fiber) = group.fibers.remove(&fiber_id) else { return };
        if !matches!(fiber.state, FiberState::Ready) {
            // Stale ready-queue entry for a fiber that suspended again.
            group.fibers.insert(fiber_id, fiber);
            return;
        }

        let mut ctx = Ctx { group, timers, now: *now, tx: tx.clone(), current: Some(fiber_id) };
        let mut wake = fiber.wake.take().unwrap_or(Wake::Empty);
        let mut suspended = false;

        while let Some(entry) = fiber.stack.last_mut() {
            let step = match std::mem::replace(&mut wake, Wake::Empty) {
                Wake::Err(error) if entry.handled => Err(error),
                Wake::Err(error) => {
                    entry.handled = true;
                    entry.frame.handle(&mut ctx, error)
                }
                Wake::Input(payload) => entry.frame.resume(&mut ctx, Input::some(payload)),
                Wake::Empty => entry.frame.resume(&mut ctx, Input::none()),
            };
            // A handled error re-arms the handler: each delivered error
            // gets exactly one handle() call, while errors raised by
            // handle() itself unwind to the caller.
            if step.is_ok() {
                entry.handled = false;
            }
            let handled = entry.handled;

            match step {
                Ok(Step::Return(payload)) => {
                    let mut entry = fiber.stack.pop().expect("frame stack underflow");
                    entry.frame.finally(&mut ctx);
                    wake = Wake::Input(payload);
                }
                Ok(Step::Call(frame)) => fiber.stack.push(super::fiber::FrameEntry::new(frame)),
                Ok(Step::Again) => {}
                Ok(Step::Await { source, timeout }) => {
                    if fiber.interrupted {
                        fiber.interrupted = false;
                        wake = Wake::Err(Error::Interrupt);
                        continue;
                    }
                    match source.poll() {
                        Polled::Ready(Some(payload)) => wake = Wake::Input(payload),
                        Polled::Ready(None) => {}
                        Polled::Err(error) => wake = Wake::Err(error),
                        Polled::Pending => {
                            source.add_waiter(fiber_id);
                            if let Some(timeout) = timeout {
                                fiber.timer_seq =
                                    Some(ctx.timers.schedule(ctx.now + timeout, group_id, fiber_id));
                            }
                            fiber.state = FiberState::Waiting(source);
                            suspended = true;
                            break;
                        }
                    }
                }
                Ok(Step::Sleep(duration)) => {
                    if fiber.interrupted {
                        fiber.interrupted = false;
                        wake = Wake::Err(Error::Interrupt);
                        continue;
                    }
                    fiber.timer_seq =
                        Some(ctx.timers.schedule(ctx.now + duration, group_id, fiber_id));
                    fiber.state = FiberState::Sleeping;
                    suspended = true;
                    break;
                }
                Err(error) => {
                    if handled {
                        // The frame's handler already ran (or just failed):
                        // unwind this frame and propagate to the caller.
                        let mut entry = fiber.stack.pop().expect("frame stack underflow");
                        entry.frame.finally(&mut ctx);
                        wake = Wake::Err(error);
                    } else {
                        // Give this frame's handler a chance on the next pass.
                        wake = Wake::Err(error);
                    }
                }
            }
        }

        if suspended {
            ctx.group.fibers.insert(fiber_id, fiber);
            return;
        }

        // The fiber ran off the bottom of its stack and is finished.
        match &wake {
            Wake::Err(Error::Interrupt) | Wake::Err(Error::Abort) => {
                debug!("fiber {} stopped: {:?}", fiber.name, wake_error(&wake))
            }
            Wake::Err(error) => error!("fiber {} failed: {error}", fiber.name),
            _ => debug!("fiber {} finished", fiber.name),
        }
        if !fiber.daemon {
            ctx.group.nondaemon -= 1;
        }
    }

    /// Drives group teardown: once shutdown is requested and all non-daemon
    /// fibers have finished, daemons are interrupted; once every fiber is
    /// gone the group is removed.
    fn maybe_finish_group(&mut self, id: GroupId) {
        let Some(group) = self.groups.get(&id) else { return };
        if !group.shutdown {
            return;
        }
        if !group.daemons_interrupted && group.nondaemon == 0 && !group.fibers.is_empty() {
            self.with_ctx(id, |ctx| {
                ctx.group.daemons_interrupted = true;
                let ids: Vec<FiberId> = ctx.group.fibers.keys().copied().collect();
                for fiber in ids {
                    ctx.interrupt(fiber);
                }
            });
            return;
        }
        let Some(group) = self.groups.get(&id) else { return };
        if group.finished() {
            let group = self.groups.remove(&id).expect("group vanished");
            match &group.fatal {
                Some(error) => {
                    error!("fiber group {} finished after fatal error: {error}", group.name)
                }
                None => info!("fiber group {} finished", group.name),
            }
        }
    }
}

fn wake_error(wake: &Wake) -> Option<&Error> {
    match wake {
        Wake::Err(error) => Some(error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::channel::Channel;
    use super::super::condition::Condition;
    use super::super::fiber::{FnFrame, Frame, Input, Step};
    use super::super::future::FiberFuture;
    use super::*;
    use crate::error::{Error, Result};

    use crossbeam::channel::Sender as ReportSender;
    use std::time::Duration;

    /// Builds a dispatcher with a single test group, running the given init
    /// closure on it.
    fn setup(init: impl FnOnce(&mut Ctx) + Send + 'static) -> Dispatcher {
        let dispatcher = Dispatcher::new("test-dispatcher");
        dispatcher
            .create_group(1, "test-group", |ctx| {
                init(ctx);
                Ok(Box::new(()) as Box<dyn std::any::Any>)
            })
            .expect("group creation failed");
        dispatcher
    }

    /// A frame that computes a value via a sub-frame call and reports the
    /// sum out through a channel.
    struct Adder {
        base: u64,
        report: ReportSender<u64>,
        called: bool,
    }

    impl Frame for Adder {
        fn resume(&mut self, _ctx: &mut Ctx, input: Input) -> Result<Step> {
            if !self.called {
                self.called = true;
                let base = self.base;
                return Ok(Step::call(FnFrame(move |_: &mut Ctx, _| Ok(Step::ret(base + 7)))));
            }
            self.report.send(input.take::<u64>()?).expect("report failed");
            Ok(Step::done())
        }
    }

    #[test]
    fn call_and_return() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let dispatcher = setup(move |ctx| {
            ctx.spawn("adder", Box::new(Adder { base: 1, report: tx, called: false }));
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(8));
        dispatcher.stop();
    }

    /// A frame that waits on a condition, then reports.
    struct Waiter {
        condition: Condition,
        timeout: Option<Duration>,
        report: ReportSender<Result<()>>,
        waited: bool,
    }

    impl Frame for Waiter {
        fn resume(&mut self, _ctx: &mut Ctx, _input: Input) -> Result<Step> {
            if !self.waited {
                self.waited = true;
                return Ok(match self.timeout {
                    Some(timeout) => self.condition.wait_timeout(timeout),
                    None => self.condition.wait(),
                });
            }
            self.report.send(Ok(())).expect("report failed");
            Ok(Step::done())
        }

        fn handle(&mut self, _ctx: &mut Ctx, error: Error) -> Result<Step> {
            self.report.send(Err(error)).expect("report failed");
            Ok(Step::done())
        }
    }

    #[test]
    fn condition_signal() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let dispatcher = setup(move |ctx| {
            let condition = Condition::new("test");
            let signal_cond = condition.clone();
            ctx.spawn(
                "waiter",
                Box::new(Waiter { condition, timeout: None, report: tx, waited: false }),
            );
            let mut slept = false;
            ctx.spawn(
                "signaler",
                Box::new(FnFrame(move |ctx: &mut Ctx, _| {
                    if !slept {
                        slept = true;
                        return Ok(Step::Sleep(Duration::from_millis(10)));
                    }
                    signal_cond.signal(ctx);
                    Ok(Step::done())
                })),
            );
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("no report"), Ok(()));
        dispatcher.stop();
    }

    #[test]
    fn condition_wait_timeout() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let dispatcher = setup(move |ctx| {
            let condition = Condition::new("test");
            ctx.spawn(
                "waiter",
                Box::new(Waiter {
                    condition,
                    timeout: Some(Duration::from_millis(10)),
                    report: tx,
                    waited: false,
                }),
            );
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("no report"),
            Err(Error::Timeout)
        );
        dispatcher.stop();
    }

    /// A frame that awaits a future and reports the result.
    struct FutureWaiter {
        future: FiberFuture<String>,
        report: ReportSender<Result<String>>,
        waited: bool,
    }

    impl Frame for FutureWaiter {
        fn resume(&mut self, _ctx: &mut Ctx, input: Input) -> Result<Step> {
            if !self.waited {
                self.waited = true;
                return Ok(self.future.wait());
            }
            self.report.send(input.take::<String>()).expect("report failed");
            Ok(Step::done())
        }

        fn handle(&mut self, _ctx: &mut Ctx, error: Error) -> Result<Step> {
            self.report.send(Err(error)).expect("report failed");
            Ok(Step::done())
        }
    }

    #[test]
    fn future_cross_thread_completion() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let dispatcher = setup(move |ctx| {
            let future = FiberFuture::<String>::new();
            let completer = future.completer(ctx);
            ctx.spawn("waiter", Box::new(FutureWaiter { future, report: tx, waited: false }));
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                completer.complete(Ok("hello".to_string()));
            });
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("no report"),
            Ok("hello".to_string())
        );
        dispatcher.stop();
    }

    #[test]
    fn future_dropped_completer_aborts() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let dispatcher = setup(move |ctx| {
            let future = FiberFuture::<String>::new();
            let completer = future.completer(ctx);
            ctx.spawn("waiter", Box::new(FutureWaiter { future, report: tx, waited: false }));
            drop(completer);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("no report"), Err(Error::Abort));
        dispatcher.stop();
    }

    #[test]
    fn future_already_completed() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let dispatcher = setup(move |ctx| {
            let future = FiberFuture::ready("now".to_string());
            ctx.spawn("waiter", Box::new(FutureWaiter { future, report: tx, waited: false }));
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("no report"),
            Ok("now".to_string())
        );
        dispatcher.stop();
    }

    /// A frame that sleeps for an hour and reports how its sleep ended.
    struct Sleeper {
        report: ReportSender<Result<()>>,
        slept: bool,
    }

    impl Frame for Sleeper {
        fn resume(&mut self, _ctx: &mut Ctx, _input: Input) -> Result<Step> {
            if !self.slept {
                self.slept = true;
                return Ok(Step::Sleep(Duration::from_secs(3600)));
            }
            self.report.send(Ok(())).expect("report failed");
            Ok(Step::done())
        }

        fn handle(&mut self, _ctx: &mut Ctx, error: Error) -> Result<Step> {
            self.report.send(Err(error)).expect("report failed");
            Ok(Step::done())
        }
    }

    #[test]
    fn interrupt_sleeping_fiber() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let dispatcher = setup(move |ctx| {
            let sleeper = ctx.spawn("sleeper", Box::new(Sleeper { report: tx, slept: false }));
            let mut waited = false;
            ctx.spawn(
                "interrupter",
                Box::new(FnFrame(move |ctx: &mut Ctx, _| {
                    if !waited {
                        waited = true;
                        // Give the sleeper a pass to suspend first.
                        return Ok(Step::Sleep(Duration::from_millis(10)));
                    }
                    ctx.interrupt(sleeper);
                    Ok(Step::done())
                })),
            );
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("no report"),
            Err(Error::Interrupt)
        );
        dispatcher.stop();
    }

    #[test]
    fn channel_fifo() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let dispatcher = setup(move |ctx| {
            let channel = Channel::<u64>::new();
            let consumer_channel = channel.clone();
            let mut received = Vec::new();
            let report = tx;
            ctx.spawn(
                "consumer",
                Box::new(FnFrame(move |_: &mut Ctx, input: Input| {
                    if input.is_some() {
                        received.push(input.take::<u64>()?);
                    }
                    if received.len() == 3 {
                        report.send(received.clone()).expect("report failed");
                        return Ok(Step::done());
                    }
                    Ok(consumer_channel.recv())
                })),
            );
            for item in [1, 2, 3] {
                channel.push(ctx, item);
            }
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("no report"), vec![1, 2, 3]);
        dispatcher.stop();
    }

    /// Frames recording handle/finally ordering during unwinding.
    struct Outer {
        report: ReportSender<&'static str>,
        called: bool,
    }

    impl Frame for Outer {
        fn resume(&mut self, _ctx: &mut Ctx, _input: Input) -> Result<Step> {
            if !self.called {
                self.called = true;
                let report = self.report.clone();
                return Ok(Step::call(Inner { report }));
            }
            panic!("inner frame should have failed");
        }

        fn handle(&mut self, _ctx: &mut Ctx, error: Error) -> Result<Step> {
            assert_eq!(error, Error::Abort);
            self.report.send("outer handle").expect("report failed");
            Ok(Step::done())
        }

        fn finally(&mut self, _ctx: &mut Ctx) {
            self.report.send("outer finally").expect("report failed");
        }
    }

    struct Inner {
        report: ReportSender<&'static str>,
    }

    impl Frame for Inner {
        fn resume(&mut self, _ctx: &mut Ctx, _input: Input) -> Result<Step> {
            Err(Error::Abort)
        }

        fn finally(&mut self, _ctx: &mut Ctx) {
            self.report.send("inner finally").expect("report failed");
        }
    }

    #[test]
    fn error_unwinding_order() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let dispatcher = setup(move |ctx| {
            ctx.spawn("outer", Box::new(Outer { report: tx, called: false }));
        });
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            events.push(event);
            if events.len() == 3 {
                break;
            }
        }
        assert_eq!(events, vec!["inner finally", "outer handle", "outer finally"]);
        dispatcher.stop();
    }

    #[test]
    fn shutdown_interrupts_daemons() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let dispatcher = setup(move |ctx| {
            let report = tx;
            let mut waiting = false;
            ctx.spawn_daemon(
                "daemon",
                Box::new(FnFrame(move |_: &mut Ctx, _| {
                    if !waiting {
                        waiting = true;
                        return Ok(Step::Sleep(Duration::from_secs(3600)));
                    }
                    report.send("woke").expect("report failed");
                    Ok(Step::done())
                })),
            );
        });
        // Stopping the dispatcher must interrupt the daemon and join cleanly.
        dispatcher.stop();
        assert!(rx.try_recv().is_err());
    }
}
