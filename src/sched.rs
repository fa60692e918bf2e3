// src/sched.rs
use std::{
    cell::RefCell,
    collections::VecDeque,
    os::unix::io::RawFd,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    rc::Rc,
    thread,
    time::Duration,
};

use log::{debug, trace};

use crate::{
    channel::Channel,
    clock::{self, Clock},
    fatal,
    reactor::Reactor,
    stream::{Direction, Streams},
    task::{Cx, Outcome, SpawnReq, Task, TaskHandle, TaskId, TaskPoll, TaskState},
    timer::{OneShot, Timer, TimerList, TimerTask},
    wake::{wake_channel, WakeMsg, WakeRx, WakeTx},
};

struct TaskEntry {
    name: String,
    state: TaskState,
    task: Option<Box<dyn Task>>,
    outcome: Rc<RefCell<Option<Outcome>>>,
}

/// The cooperative scheduler: ready queue, timer wheel, stream
/// subscriptions and the parked-task set, advanced by `cycle`. One per
/// thread, reached through the free functions at the bottom of this file.
pub struct Scheduler {
    clock: Clock,
    time: Duration,
    tasks: Vec<TaskEntry>,
    ready: VecDeque<TaskId>,
    queued: Vec<bool>,
    delayed: Vec<bool>,
    timers: TimerList,
    streams: Streams,
    wake_tx: WakeTx,
    wake_rx: WakeRx,
    spawns: VecDeque<SpawnReq>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        let clock = Clock::new();
        clock::set_epoch(clock.origin());
        let reactor = match Reactor::new() {
            Ok(r) => r,
            Err(e) => fatal::raise(format!("readiness backend init failed: {e}")),
        };
        let (wake_tx, wake_rx) = wake_channel();
        Self {
            clock,
            time: Duration::ZERO,
            tasks: Vec::new(),
            ready: VecDeque::new(),
            queued: Vec::new(),
            delayed: Vec::new(),
            timers: TimerList::new(),
            streams: Streams::new(reactor),
            wake_tx,
            wake_rx,
            spawns: VecDeque::new(),
        }
    }

    // ---------------- spawning ----------------

    fn insert_task(
        &mut self,
        name: String,
        task: Box<dyn Task>,
        outcome: Rc<RefCell<Option<Outcome>>>,
    ) -> TaskId {
        let id = self.tasks.len();
        self.tasks.push(TaskEntry { name, state: TaskState::NotStarted, task: Some(task), outcome });
        self.queued.push(false);
        self.delayed.push(false);
        id
    }

    fn spawn_boxed(&mut self, name: String, task: Box<dyn Task>) -> TaskHandle {
        let outcome = Rc::new(RefCell::new(None));
        let id = self.insert_task(name, task, outcome.clone());
        trace!("spawn {} {}", id, self.tasks[id].name);
        self.enqueue_ready(id);
        TaskHandle::new(outcome)
    }

    // ---------------- ready queue ----------------

    fn enqueue_ready(&mut self, id: TaskId) {
        if id >= self.queued.len() || self.tasks[id].state == TaskState::Terminated || self.queued[id]
        {
            return;
        }
        self.queued[id] = true;
        self.ready.push_back(id);
    }

    fn on_wake(&mut self, msg: WakeMsg) {
        if msg.to >= self.tasks.len() || self.tasks[msg.to].state == TaskState::Terminated {
            return;
        }
        trace!("wake {} -> {}", msg.from, msg.to);
        self.delayed[msg.to] = false;
        self.enqueue_ready(msg.to);
    }

    fn drain_wakes(&mut self) {
        while let Some(msg) = self.wake_rx.try_recv() {
            self.on_wake(msg);
        }
    }

    fn drain_spawns(&mut self) {
        while let Some(req) = self.spawns.pop_front() {
            let id = self.insert_task(req.name, req.task, req.outcome);
            trace!("spawn {} {}", id, self.tasks[id].name);
            self.enqueue_ready(id);
        }
    }

    // ---------------- the cycle ----------------

    /// One pass of the loop. Returns false exactly when the scheduler is
    /// quiescent: nothing ready, no timers, nothing watched.
    fn cycle(&mut self) -> bool {
        // 1. Tick.
        self.time = self.clock.now();
        self.timers.tick(self.time);
        self.drain_spawns();
        self.drain_wakes();

        // 2. Advance the ready queue. Snapshot semantics: only tasks queued
        //    at cycle start run now; arrivals during the step wait a cycle.
        let snapshot = self.ready.len();
        let mut progressed = false;
        for _ in 0..snapshot {
            let Some(id) = self.ready.pop_front() else { break };
            self.queued[id] = false;
            if self.tasks[id].state == TaskState::Terminated {
                continue;
            }
            if self.delayed[id] {
                // Parked by a blocking primitive: skip and requeue at the
                // tail without losing the task.
                self.enqueue_ready(id);
                continue;
            }
            self.poll_one(id);
            progressed = true;
        }

        // 3. Advance timers: at most one due timer per cycle, checked ahead
        //    of the ready-progress yield so a self-enqueueing task cannot
        //    starve the wheel.
        let mut timeout = Duration::ZERO;
        if let Some(deadline) = self.timers.top() {
            if deadline <= self.time {
                self.fire_due_timer();
                return true;
            }
            timeout = deadline - self.time;
        }

        // 4. Never enter a blocking wait while this cycle advanced tasks.
        if progressed {
            return true;
        }

        // 5. Advance stream subscriptions. timeout zero here means no timer
        //    bounds the wait.
        if self.streams.any_watched() {
            let wait = if timeout.is_zero() { None } else { Some(timeout) };
            trace!("select wait={:?}", wait);
            let ready = self.streams.select(wait);
            let any = !ready.is_empty();
            for ev in ready {
                if ev.readable {
                    self.dispatch(ev.fd, Direction::Readable);
                }
                if ev.writable {
                    self.dispatch(ev.fd, Direction::Writable);
                }
                self.streams.rearm(ev.fd);
            }
            if any {
                return true;
            }
        } else if !timeout.is_zero() {
            // 6. Idle until the next timer.
            thread::sleep(timeout);
        }

        // 7. Quiescence.
        !(self.ready.is_empty()
            && self.wake_rx.is_empty()
            && self.spawns.is_empty()
            && self.timers.is_empty()
            && !self.streams.any_watched())
    }

    fn fire_due_timer(&mut self) {
        let Some(timer) = self.timers.shift() else { return };
        trace!("timer fire deadline={:?} recurrent={}", timer.deadline(), timer.recurrent());
        let outcome = Rc::new(RefCell::new(None));
        let id = self.insert_task("timer".to_string(), Box::new(timer.into_fire()), outcome);
        // The callback starts within the firing cycle.
        self.poll_one(id);
        if self.tasks[id].state == TaskState::Suspended {
            // Suspended callback: the in-flight task stays runnable; a
            // recurrent timer re-arms when it terminates.
            self.enqueue_ready(id);
        }
    }

    fn dispatch(&mut self, fd: RawFd, dir: Direction) {
        for id in self.streams.tasks_for(fd, dir) {
            if self.tasks[id].state == TaskState::Terminated || self.delayed[id] {
                continue;
            }
            self.poll_one(id);
        }
    }

    // ---------------- polling ----------------

    fn poll_one(&mut self, id: TaskId) {
        let Some(mut task) = self.tasks[id].task.take() else { return };
        let starting = self.tasks[id].state == TaskState::NotStarted;
        self.tasks[id].state = TaskState::Running;
        trace!("{} {} {}", if starting { "start" } else { "resume" }, id, self.tasks[id].name);

        let mut cx = Cx {
            id,
            now: self.time,
            wake_tx: self.wake_tx.clone(),
            delayed: &mut self.delayed,
            timers: &mut self.timers,
            streams: &mut self.streams,
            spawns: &mut self.spawns,
        };
        // A panicking task terminates with the fault as its outcome; the
        // loop is unaffected.
        let poll = catch_unwind(AssertUnwindSafe(|| task.poll(&mut cx)));
        let fatal_raised = fatal::take_pending();

        match poll {
            Ok(TaskPoll::Pending) => {
                self.tasks[id].state = TaskState::Suspended;
                self.tasks[id].task = Some(task);
            }
            Ok(TaskPoll::Ready) => self.finish_task(id, Outcome::Done),
            Err(payload) => {
                // Only user faults are contained. Invariant violations and
                // readiness failures raised by the scheduler's own
                // primitives stay process-fatal even when a task triggered
                // them.
                if fatal_raised {
                    resume_unwind(payload);
                }
                self.finish_task(id, Outcome::Fault(panic_message(payload)))
            }
        }
    }

    fn finish_task(&mut self, id: TaskId, outcome: Outcome) {
        debug!("done {} {} => {:?}", id, self.tasks[id].name, outcome);
        self.tasks[id].state = TaskState::Terminated;
        self.queued[id] = false;
        self.delayed[id] = false;
        // Deregister before dropping the task: dropping may close the very
        // descriptors the subscriptions point at.
        self.streams.drop_task(id);
        self.tasks[id].task = None;
        *self.tasks[id].outcome.borrow_mut() = Some(outcome);
    }

    // ---------------- driving ----------------

    fn run(&mut self) {
        while self.cycle() {}
    }

    fn has_work(&self) -> bool {
        !self.ready.is_empty()
            || !self.wake_rx.is_empty()
            || !self.spawns.is_empty()
            || !self.timers.is_empty()
            || self.streams.any_watched()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // No drain while a fatal fault is unwinding the thread.
        if thread::panicking() {
            return;
        }
        // Shutdown drain: work posted without `run()` still completes when
        // the last reference to the scheduler goes away at thread end.
        if self.has_work() {
            debug!("draining scheduler at shutdown");
            self.run();
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

// ---------------- thread-local runtime ----------------

thread_local! {
    static SCHED: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

fn with_sched<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    SCHED.with(|cell| match cell.try_borrow_mut() {
        Ok(mut slot) => f(slot.get_or_insert_with(Scheduler::new)),
        // Inside a running task the scheduler is already borrowed; the
        // in-task surface is the task's Cx.
        Err(_) => fatal::raise("scheduler is running; use the task's Cx instead".to_string()),
    })
}

/// Wrap `task` and enqueue it on this thread's scheduler.
pub fn spawn<T: Task>(name: impl Into<String>, task: T) -> TaskHandle {
    with_sched(|s| s.spawn_boxed(name.into(), Box::new(task)))
}

/// Run `task` once, `after` from now.
pub fn defer<T: Task>(after: Duration, task: T) {
    with_sched(|s| {
        let now = s.clock.now();
        s.timers.add(Timer::once(after, now, OneShot::new(task)));
    })
}

/// Fire `cb` every `every`, until it returns `Repeat::Stop`.
pub fn repeat<C: TimerTask>(every: Duration, cb: C) {
    with_sched(|s| {
        let now = s.clock.now();
        s.timers.add(Timer::every(every, now, cb));
    })
}

/// Construct a channel of capacity `cap` (0 = rendezvous) bound to this
/// thread's scheduler.
pub fn chan<T: 'static>(cap: usize) -> Channel<T> {
    with_sched(|s| Channel::new(cap, s.wake_tx.clone()))
}

/// Drive the loop to quiescence. Re-entrant in one specific sense: calling
/// it while the loop is active is a no-op for the inner call; calling it
/// after the loop terminated restarts it if new work has been posted.
pub fn run() {
    SCHED.with(|cell| {
        if let Ok(mut slot) = cell.try_borrow_mut() {
            if let Some(s) = slot.as_mut() {
                s.run();
            }
        }
    });
}
