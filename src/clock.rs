// src/clock.rs
use std::{
    cell::Cell,
    fmt,
    time::{Duration, Instant},
};

/// Monotonic time source. Readings are `Duration`s measured from the
/// clock's origin, which doubles as the scheduler's start instant.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Nanoseconds elapsed since the origin. Non-decreasing by `Instant`'s
    /// contract.
    #[inline]
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    #[inline]
    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// The diagnostic-print epoch lives outside the scheduler cell so that
// `dprintfn!` works from inside a running task without touching the
// scheduler's borrow.
thread_local! {
    static EPOCH: Cell<Option<Instant>> = const { Cell::new(None) };
}

pub(crate) fn set_epoch(origin: Instant) {
    let _ = EPOCH.try_with(|e| {
        if e.get().is_none() {
            e.set(Some(origin));
        }
    });
}

/// Milliseconds since the scheduler started, 0 if it never did.
pub fn millis_since_start() -> u64 {
    EPOCH
        .try_with(|e| e.get())
        .ok()
        .flatten()
        .map(|origin| origin.elapsed().as_millis() as u64)
        .unwrap_or(0)
}

/// Backing call for `dprintfn!`: one line, stamped with the milliseconds
/// elapsed since scheduler start, zero-padded to four digits.
pub fn dprint(args: fmt::Arguments<'_>) {
    println!("{}", stamp(millis_since_start(), args));
}

fn stamp(millis: u64, args: fmt::Arguments<'_>) -> String {
    format!("[{millis:04}]: {args}")
}
