// src/channel.rs
use std::{cell::RefCell, collections::VecDeque, rc::Rc, task::Poll};

use thiserror::Error;

use crate::fatal;
use crate::task::{Cx, TaskId};
use crate::wake::{WakeMsg, WakeTx, EXTERNAL_WAKE};

/// `send` on a closed channel fails and hands the value back.
#[derive(Debug, Error)]
#[error("send on a closed channel")]
pub struct SendError<T>(pub T);

struct RecvWaiter<T> {
    task: TaskId,
    // Filled in place by a sender; the receiver takes it on resume.
    slot: Option<T>,
}

struct Inner<T> {
    cap: usize,
    buffer: VecDeque<T>,
    // Parked senders keep their value with the queue entry; consuming the
    // entry moves the value, so nothing is ever duplicated or dropped.
    senders: VecDeque<(TaskId, T)>,
    receivers: VecDeque<RecvWaiter<T>>,
    closed: bool,
    wake: WakeTx,
}

/// Typed rendezvous (capacity 0) or bounded-buffer channel between tasks.
/// Cloning shares the channel.
pub struct Channel<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: 'static> Channel<T> {
    pub(crate) fn new(cap: usize, wake: WakeTx) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                cap,
                buffer: VecDeque::new(),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                closed: false,
                wake,
            })),
        }
    }

    /// Begin a send. Poll the returned op from the owning task until ready.
    pub fn send(&self, value: T) -> SendOp<T> {
        SendOp { ch: self.clone(), value: Some(value), enrolled: false }
    }

    /// Begin a receive. Resolves to `None` once the channel is closed and
    /// drained; never blocks after that.
    pub fn recv(&self) -> RecvOp<T> {
        RecvOp { ch: self.clone(), enrolled: false }
    }

    /// Close the channel. Parked senders are woken and fail; parked
    /// receivers are woken and observe the drain. Closing twice is a
    /// programmer error.
    pub fn close(&self) {
        let mut ch = self.inner.borrow_mut();
        if ch.closed {
            // Programmer error, fatal even when reached from inside a task.
            fatal::raise("close of a closed channel".to_string());
        }
        ch.closed = true;
        let to_wake: Vec<TaskId> = ch
            .senders
            .iter()
            .map(|(task, _)| *task)
            .chain(ch.receivers.iter().map(|w| w.task))
            .collect();
        let wake = ch.wake.clone();
        drop(ch);
        for to in to_wake {
            wake.send(WakeMsg { from: EXTERNAL_WAKE, to });
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Number of buffered values.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.inner.borrow().buffer.len()
    }
}

/// In-flight send. First poll either completes directly (waiting receiver,
/// buffer space) or parks the task on the sender queue; later polls observe
/// whether the queued value has been consumed.
pub struct SendOp<T> {
    ch: Channel<T>,
    value: Option<T>,
    enrolled: bool,
}

impl<T: 'static> SendOp<T> {
    pub fn poll(&mut self, cx: &mut Cx<'_>) -> Poll<Result<(), SendError<T>>> {
        if self.enrolled {
            return self.poll_enrolled(cx);
        }
        let Some(v) = self.value.take() else {
            // Completed earlier; polling again is harmless.
            return Poll::Ready(Ok(()));
        };

        let mut ch = self.ch.inner.borrow_mut();
        if ch.closed {
            return Poll::Ready(Err(SendError(v)));
        }
        // Eldest receiver still waiting for a value, if any.
        if let Some(i) = ch.receivers.iter().position(|w| w.slot.is_none()) {
            let to = ch.receivers[i].task;
            ch.receivers[i].slot = Some(v);
            let from = cx.id();
            ch.wake.send(WakeMsg { from, to });
            return Poll::Ready(Ok(()));
        }
        if ch.buffer.len() < ch.cap {
            ch.buffer.push_back(v);
            return Poll::Ready(Ok(()));
        }
        let me = cx.id();
        ch.senders.push_back((me, v));
        drop(ch);
        cx.park();
        self.enrolled = true;
        Poll::Pending
    }

    fn poll_enrolled(&mut self, cx: &mut Cx<'_>) -> Poll<Result<(), SendError<T>>> {
        let me = cx.id();
        let mut ch = self.ch.inner.borrow_mut();
        match ch.senders.iter().position(|(task, _)| *task == me) {
            // Entry consumed by a receiver: the send completed.
            None => {
                self.enrolled = false;
                Poll::Ready(Ok(()))
            }
            Some(i) if ch.closed => {
                let entry = ch.senders.remove(i);
                self.enrolled = false;
                match entry {
                    Some((_, v)) => Poll::Ready(Err(SendError(v))),
                    None => Poll::Ready(Ok(())),
                }
            }
            Some(_) => {
                drop(ch);
                cx.park();
                Poll::Pending
            }
        }
    }
}

/// In-flight receive.
pub struct RecvOp<T> {
    ch: Channel<T>,
    enrolled: bool,
}

impl<T: 'static> RecvOp<T> {
    pub fn poll(&mut self, cx: &mut Cx<'_>) -> Poll<Option<T>> {
        if self.enrolled {
            return self.poll_enrolled(cx);
        }

        let mut ch = self.ch.inner.borrow_mut();
        if let Some(v) = ch.buffer.pop_front() {
            // Backfill the freed slot from the eldest parked sender. Skipped
            // once closed: parked senders must observe the close failure.
            if !ch.closed {
                if let Some((task, pending)) = ch.senders.pop_front() {
                    ch.buffer.push_back(pending);
                    let from = cx.id();
                    ch.wake.send(WakeMsg { from, to: task });
                }
            }
            return Poll::Ready(Some(v));
        }
        if !ch.closed {
            // Rendezvous: take the value straight from a parked sender.
            if let Some((task, v)) = ch.senders.pop_front() {
                let from = cx.id();
                ch.wake.send(WakeMsg { from, to: task });
                return Poll::Ready(Some(v));
            }
        }
        if ch.closed {
            return Poll::Ready(None);
        }
        let me = cx.id();
        ch.receivers.push_back(RecvWaiter { task: me, slot: None });
        drop(ch);
        cx.park();
        self.enrolled = true;
        Poll::Pending
    }

    fn poll_enrolled(&mut self, cx: &mut Cx<'_>) -> Poll<Option<T>> {
        let me = cx.id();
        let mut ch = self.ch.inner.borrow_mut();
        match ch.receivers.iter().position(|w| w.task == me) {
            Some(i) if ch.receivers[i].slot.is_some() => {
                let w = ch.receivers.remove(i);
                self.enrolled = false;
                Poll::Ready(w.and_then(|w| w.slot))
            }
            Some(i) if ch.closed => {
                ch.receivers.remove(i);
                self.enrolled = false;
                Poll::Ready(None)
            }
            Some(_) => {
                drop(ch);
                cx.park();
                Poll::Pending
            }
            None => {
                self.enrolled = false;
                Poll::Ready(None)
            }
        }
    }
}
