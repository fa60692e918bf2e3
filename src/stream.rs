// src/stream.rs
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::fatal;
use crate::reactor::{Reactor, Ready};
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Readable,
    Writable,
}

/// Binding of a descriptor to a task, dispatched on readiness. Lives until
/// the task terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub fd: RawFd,
    pub task: TaskId,
}

/// Insertion-ordered multiset of subscriptions for one direction. Multiple
/// subscriptions may share a descriptor; dispatch order per descriptor is
/// insertion order.
#[derive(Default)]
pub struct SubscriptionList {
    subs: Vec<Subscription>,
}

impl SubscriptionList {
    pub fn new() -> Self {
        Self { subs: Vec::new() }
    }

    /// Returns false when the exact (fd, task) pair is already present, so
    /// a task re-arming itself every poll does not pile up entries.
    pub fn add(&mut self, fd: RawFd, task: TaskId) -> bool {
        if self.subs.iter().any(|s| s.fd == fd && s.task == task) {
            return false;
        }
        self.subs.push(Subscription { fd, task });
        true
    }

    /// Remove every subscription held by `task`; returns the descriptors
    /// whose interest may have changed.
    pub fn remove_task(&mut self, task: TaskId) -> Vec<RawFd> {
        let mut touched = Vec::new();
        self.subs.retain(|s| {
            if s.task == task {
                touched.push(s.fd);
                false
            } else {
                true
            }
        });
        touched
    }

    /// Tasks subscribed to `fd`, in insertion order.
    pub fn tasks_for(&self, fd: RawFd) -> Vec<TaskId> {
        self.subs.iter().filter(|s| s.fd == fd).map(|s| s.task).collect()
    }

    #[inline]
    pub fn watches(&self, fd: RawFd) -> bool {
        self.subs.iter().any(|s| s.fd == fd)
    }

    /// Flat view: the distinct descriptors currently watched.
    pub fn descriptors(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.subs.iter().map(|s| s.fd).collect();
        fds.sort_unstable();
        fds.dedup();
        fds
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.subs.len()
    }
}

/// Both directions plus the readiness backend, kept together so interest
/// registrations always reflect the union of the two lists.
pub struct Streams {
    read: SubscriptionList,
    write: SubscriptionList,
    reactor: Reactor,
}

impl Streams {
    pub(crate) fn new(reactor: Reactor) -> Self {
        Self { read: SubscriptionList::new(), write: SubscriptionList::new(), reactor }
    }

    pub(crate) fn watch(&mut self, fd: RawFd, dir: Direction, task: TaskId) {
        let added = match dir {
            Direction::Readable => self.read.add(fd, task),
            Direction::Writable => self.write.add(fd, task),
        };
        if added {
            log::trace!("watch fd={fd} {dir:?} task={task}");
            self.sync(fd);
        }
    }

    /// Consume every subscription of a terminated task.
    pub(crate) fn drop_task(&mut self, task: TaskId) {
        let mut touched = self.read.remove_task(task);
        touched.extend(self.write.remove_task(task));
        touched.sort_unstable();
        touched.dedup();
        for fd in touched {
            log::trace!("unwatch fd={fd} task={task}");
            self.sync(fd);
        }
    }

    pub(crate) fn tasks_for(&self, fd: RawFd, dir: Direction) -> Vec<TaskId> {
        match dir {
            Direction::Readable => self.read.tasks_for(fd),
            Direction::Writable => self.write.tasks_for(fd),
        }
    }

    #[inline]
    pub(crate) fn any_watched(&self) -> bool {
        !self.read.is_empty() || !self.write.is_empty()
    }

    #[inline]
    pub(crate) fn watches(&self, fd: RawFd) -> bool {
        self.read.watches(fd) || self.write.watches(fd)
    }

    /// Blocking multi-descriptor wait. `None` blocks until something is
    /// ready. A backend failure is fatal.
    pub(crate) fn select(&mut self, timeout: Option<Duration>) -> Vec<Ready> {
        match self.reactor.select(timeout) {
            Ok(ready) => ready,
            Err(e) => fatal::raise(format!("readiness wait failed: {e}")),
        }
    }

    /// Re-arm a descriptor that fired but is still watched, so a still-ready
    /// descriptor is reported again on the next wait.
    pub(crate) fn rearm(&mut self, fd: RawFd) {
        if self.watches(fd) {
            self.sync(fd);
        }
    }

    fn sync(&mut self, fd: RawFd) {
        let want_read = self.read.watches(fd);
        let want_write = self.write.watches(fd);
        if let Err(e) = self.reactor.update(fd, want_read, want_write) {
            fatal::raise(format!("descriptor registration failed for fd {fd}: {e}"));
        }
    }
}
