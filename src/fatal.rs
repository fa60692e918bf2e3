// src/fatal.rs
use std::cell::Cell;

// Set by `raise`, consumed by the scheduler after every poll. Lets
// `poll_one` tell a process-fatal fault apart from an ordinary user panic
// without inspecting payload types.
thread_local! {
    static PENDING: Cell<bool> = const { Cell::new(false) };
}

/// Raise a process-fatal fault: an invariant violation, a readiness
/// failure or a regressing clock. These are never contained as a task
/// outcome; when one unwinds out of a task poll the scheduler re-raises it.
pub(crate) fn raise(msg: String) -> ! {
    log::error!("{msg}");
    PENDING.with(|f| f.set(true));
    panic!("{msg}");
}

/// Whether the last panic was raised by `raise`. Clears the flag.
pub(crate) fn take_pending() -> bool {
    PENDING.try_with(|f| f.replace(false)).unwrap_or(false)
}
