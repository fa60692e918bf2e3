// src/task.rs
use std::{
    cell::RefCell,
    collections::VecDeque,
    os::unix::io::RawFd,
    rc::Rc,
    time::Duration,
};

use crate::{
    channel::Channel,
    stream::{Direction, Streams},
    timer::{Delay, OneShot, Timer, TimerList, TimerTask},
    wake::{WakeMsg, WakeTx},
};

pub type TaskId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPoll {
    Pending,
    Ready,
}

/// Lifecycle of a task. Exactly one task is `Running` at any moment; the
/// scheduler flips it back to `Suspended` or `Terminated` when the poll
/// returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    NotStarted,
    Running,
    Suspended,
    Terminated,
}

/// What a terminated task left behind. A panic inside a task is caught and
/// recorded here; it never reaches the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Fault(String),
}

/// Handle returned by `spawn`. Querying it never blocks.
#[derive(Clone)]
pub struct TaskHandle {
    outcome: Rc<RefCell<Option<Outcome>>>,
}

impl TaskHandle {
    pub(crate) fn new(outcome: Rc<RefCell<Option<Outcome>>>) -> Self {
        Self { outcome }
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// The task's return, once terminated.
    #[inline]
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }
}

/// A suspendable unit of work. Suspension points are explicit: returning
/// `TaskPoll::Pending` after registering interest (a timer, a stream
/// subscription, a channel wait) parks the task until the scheduler
/// re-enters it.
pub trait Task: 'static {
    fn poll(&mut self, cx: &mut Cx<'_>) -> TaskPoll;
}

/// Convenience adapter: poll a closure.
pub struct FnTask<F>(pub F);

impl<F> Task for FnTask<F>
where
    F: FnMut(&mut Cx<'_>) -> TaskPoll + 'static,
{
    fn poll(&mut self, cx: &mut Cx<'_>) -> TaskPoll {
        (self.0)(cx)
    }
}

pub(crate) struct SpawnReq {
    pub(crate) name: String,
    pub(crate) task: Box<dyn Task>,
    pub(crate) outcome: Rc<RefCell<Option<Outcome>>>,
}

/// The poll context. Only the currently running task holds one, which is
/// what makes "only the running task may suspend" a compile-time fact.
pub struct Cx<'a> {
    pub(crate) id: TaskId,
    pub(crate) now: Duration,
    pub(crate) wake_tx: WakeTx,
    pub(crate) delayed: &'a mut Vec<bool>,
    pub(crate) timers: &'a mut TimerList,
    pub(crate) streams: &'a mut Streams,
    pub(crate) spawns: &'a mut VecDeque<SpawnReq>,
}

impl<'a> Cx<'a> {
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Time of the current cycle, measured from scheduler start.
    #[inline]
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Time elapsed since the scheduler started. The clock's epoch is the
    /// scheduler start, so this coincides with `now()`.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.now
    }

    #[inline]
    pub fn wake(&self, to: TaskId) {
        self.wake_tx.send(WakeMsg { from: self.id, to });
    }

    #[inline]
    pub fn wake_self(&self) {
        self.wake(self.id);
    }

    /// Yield to the scheduler and reschedule yourself.
    #[inline]
    pub fn yield_now(&self) -> TaskPoll {
        self.wake_self();
        TaskPoll::Pending
    }

    /// Spawn a sibling task. It enters the ready queue at the start of the
    /// next cycle.
    pub fn spawn<T: Task>(&mut self, name: impl Into<String>, task: T) -> TaskHandle {
        let outcome = Rc::new(RefCell::new(None));
        self.spawns.push_back(SpawnReq {
            name: name.into(),
            task: Box::new(task),
            outcome: outcome.clone(),
        });
        TaskHandle::new(outcome)
    }

    /// Install a one-shot timer resuming this task `dur` from now. Poll
    /// the returned op and stay `Pending` until it reports `Ready`.
    pub fn delay(&mut self, dur: Duration) -> Delay {
        Delay::armed(self, dur)
    }

    /// Run `task` once, `after` from now.
    pub fn defer<T: Task>(&mut self, after: Duration, task: T) {
        self.timers.add(Timer::once(after, self.now, OneShot::new(task)));
    }

    /// Fire `cb` every `every`, until it returns `Repeat::Stop`.
    pub fn repeat<C: TimerTask>(&mut self, every: Duration, cb: C) {
        self.timers.add(Timer::every(every, self.now, cb));
    }

    /// Construct a channel bound to this scheduler.
    pub fn chan<T: 'static>(&self, cap: usize) -> Channel<T> {
        Channel::new(cap, self.wake_tx.clone())
    }

    /// Subscribe this task for readability of `fd`. The subscription stays
    /// until the task terminates; re-arming is idempotent.
    pub fn stream_read(&mut self, fd: RawFd) {
        self.streams.watch(fd, Direction::Readable, self.id);
    }

    /// Subscribe this task for writability of `fd`.
    pub fn stream_write(&mut self, fd: RawFd) {
        self.streams.watch(fd, Direction::Writable, self.id);
    }

    /// Park this task: the scheduler will skip it even if it sits in the
    /// ready queue, until a wake clears the flag. Set by blocking channel
    /// ops; re-asserted on every spurious poll while still waiting.
    #[inline]
    pub(crate) fn park(&mut self) {
        self.delayed[self.id] = true;
    }

    #[inline]
    pub(crate) fn add_timer(&mut self, timer: Timer) {
        self.timers.add(timer);
    }
}
