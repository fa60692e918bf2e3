// src/timer.rs
use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};

use crate::fatal;
use crate::task::{Cx, Task, TaskPoll};

/// Control value returned by a recurrent timer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Again,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPoll {
    Pending,
    Ready(Repeat),
}

/// A timer callback. Fired callbacks run as tasks: they may suspend, in
/// which case the in-flight task is enqueued and, for recurrent timers,
/// re-arming waits until the callback terminates.
pub trait TimerTask: 'static {
    fn fire(&mut self, cx: &mut Cx<'_>) -> TimerPoll;
}

/// Convenience adapter: a non-suspending callback closure.
pub struct FnTimer<F>(pub F);

impl<F> TimerTask for FnTimer<F>
where
    F: FnMut(&mut Cx<'_>) -> Repeat + 'static,
{
    fn fire(&mut self, cx: &mut Cx<'_>) -> TimerPoll {
        TimerPoll::Ready((self.0)(cx))
    }
}

/// Adapter running an ordinary task as a one-shot timer callback.
pub struct OneShot<T>(T);

impl<T: Task> OneShot<T> {
    pub fn new(task: T) -> Self {
        Self(task)
    }
}

impl<T: Task> TimerTask for OneShot<T> {
    fn fire(&mut self, cx: &mut Cx<'_>) -> TimerPoll {
        match self.0.poll(cx) {
            TaskPoll::Pending => TimerPoll::Pending,
            TaskPoll::Ready => TimerPoll::Ready(Repeat::Stop),
        }
    }
}

/// Scheduled future invocation of a callback. Deadline is absolute:
/// `since + interval`.
pub struct Timer {
    interval: Duration,
    since: Duration,
    recurrent: bool,
    cb: Box<dyn TimerTask>,
}

impl Timer {
    pub fn once(interval: Duration, since: Duration, cb: impl TimerTask) -> Self {
        Self { interval, since, recurrent: false, cb: Box::new(cb) }
    }

    pub fn every(interval: Duration, since: Duration, cb: impl TimerTask) -> Self {
        Self { interval, since, recurrent: true, cb: Box::new(cb) }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn recurrent(&self) -> bool {
        self.recurrent
    }

    #[inline]
    pub fn deadline(&self) -> Duration {
        self.since + self.interval
    }

    #[inline]
    pub fn is_due(&self, now: Duration) -> bool {
        now >= self.deadline()
    }

    #[inline]
    pub fn left(&self, now: Duration) -> Duration {
        self.deadline().saturating_sub(now)
    }

    /// Rebase the timer; used to re-arm recurrent timers at `since = now`.
    pub fn with_since(mut self, t: Duration) -> Self {
        self.since = t;
        self
    }

    pub(crate) fn into_fire(self) -> TimerFire {
        TimerFire { interval: self.interval, recurrent: self.recurrent, cb: Some(self.cb) }
    }
}

/// The task a due timer turns into. Drives the callback to completion and
/// re-arms recurrent timers unless the callback said `Repeat::Stop`.
pub(crate) struct TimerFire {
    interval: Duration,
    recurrent: bool,
    cb: Option<Box<dyn TimerTask>>,
}

impl Task for TimerFire {
    fn poll(&mut self, cx: &mut Cx<'_>) -> TaskPoll {
        let Some(mut cb) = self.cb.take() else {
            return TaskPoll::Ready;
        };
        match cb.fire(cx) {
            TimerPoll::Pending => {
                self.cb = Some(cb);
                TaskPoll::Pending
            }
            TimerPoll::Ready(Repeat::Again) if self.recurrent => {
                // since = now of the completion cycle: intervals do not
                // drift-compensate, per-cycle skew accumulates.
                let now = cx.now();
                cx.add_timer(Timer { interval: self.interval, since: now, recurrent: true, cb });
                TaskPoll::Ready
            }
            TimerPoll::Ready(_) => TaskPoll::Ready,
        }
    }
}

struct TimerEntry {
    deadline: Duration,
    seq: u64,
    timer: Timer,
}

// Reverse ordering for min-heap: earliest deadline first, insertion order
// breaking ties.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Min-priority queue of timers, keyed by absolute deadline.
pub struct TimerList {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
    last_now: Duration,
}

impl TimerList {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), seq: 0, last_now: Duration::ZERO }
    }

    pub fn add(&mut self, timer: Timer) {
        let deadline = timer.deadline();
        self.seq += 1;
        self.heap.push(TimerEntry { deadline, seq: self.seq, timer });
    }

    /// Earliest deadline, if any.
    pub fn top(&self) -> Option<Duration> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Remove and return the earliest timer.
    pub fn shift(&mut self) -> Option<Timer> {
        self.heap.pop().map(|e| e.timer)
    }

    /// Advise the list of the new now. Firing is the scheduler's job; this
    /// only rejects a regressing clock.
    pub fn tick(&mut self, now: Duration) {
        if now < self.last_now {
            fatal::raise(format!("clock regressed: {:?} < {:?}", now, self.last_now));
        }
        self.last_now = now;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot pause, the in-task counterpart of `defer`: installs a timer
/// waking the owning task at `now + dur`, then reports `Pending` until the
/// deadline has passed. `Cx::delay` hands it out pre-armed; `Delay::new`
/// arms on first poll.
pub struct Delay {
    dur: Duration,
    deadline: Option<Duration>,
}

impl Delay {
    pub fn new(dur: Duration) -> Self {
        Self { dur, deadline: None }
    }

    pub(crate) fn armed(cx: &mut Cx<'_>, dur: Duration) -> Self {
        Self { dur, deadline: Some(arm(cx, dur)) }
    }

    pub fn poll(&mut self, cx: &mut Cx<'_>) -> TaskPoll {
        let now = cx.now();
        match self.deadline {
            None => {
                self.deadline = Some(arm(cx, self.dur));
                TaskPoll::Pending
            }
            Some(deadline) if now >= deadline => TaskPoll::Ready,
            Some(_) => TaskPoll::Pending,
        }
    }
}

// Install the wake-up timer for the calling task; returns the deadline.
fn arm(cx: &mut Cx<'_>, dur: Duration) -> Duration {
    let now = cx.now();
    let target = cx.id();
    cx.add_timer(Timer::once(
        dur,
        now,
        FnTimer(move |fcx: &mut Cx<'_>| {
            fcx.wake(target);
            Repeat::Stop
        }),
    ));
    now + dur
}
