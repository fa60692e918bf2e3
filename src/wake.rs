// src/wake.rs
use crate::task::TaskId;
use std::{cell::RefCell, collections::VecDeque, rc::Rc};

/// Sender used for wakes that do not originate from a task (timers firing,
/// channel close).
pub const EXTERNAL_WAKE: TaskId = usize::MAX;

#[derive(Debug, Clone, Copy)]
pub struct WakeMsg {
    pub from: TaskId,
    pub to: TaskId,
}

/// Single-threaded wake queue. Cloneable senders let channels and timer
/// callbacks wake parked tasks without holding a scheduler borrow.
#[derive(Clone)]
pub struct WakeTx {
    q: Rc<RefCell<VecDeque<WakeMsg>>>,
}

pub struct WakeRx {
    q: Rc<RefCell<VecDeque<WakeMsg>>>,
}

pub fn wake_channel() -> (WakeTx, WakeRx) {
    let q = Rc::new(RefCell::new(VecDeque::new()));
    (WakeTx { q: q.clone() }, WakeRx { q })
}

impl WakeTx {
    #[inline]
    pub fn send(&self, msg: WakeMsg) {
        self.q.borrow_mut().push_back(msg);
    }
}

impl WakeRx {
    #[inline]
    pub fn try_recv(&self) -> Option<WakeMsg> {
        self.q.borrow_mut().pop_front()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.q.borrow().is_empty()
    }
}
