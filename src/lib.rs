//! # WEAVE
//! Cooperative multiplexing of many tasks onto one OS thread.
//!
//! Tasks are ordinary poll-driven routines that suspend at explicit yield
//! points: waiting for time to pass, for a descriptor to become readable or
//! writable, for a channel peer, or simply to let siblings run.
//!
//! ## Architectural principles
//! * **One thread, one task at a time.** No parallelism, no preemption, no
//!   locks; every suspension point is visible in the code.
//! * **Bounded cycles.** The run loop advances a snapshot of the ready
//!   queue, fires at most one due timer, then waits; work enqueued during
//!   a cycle runs in the next one.
//! * **Quiescent termination.** `run()` returns exactly when no task is
//!   ready, no timer is pending and no descriptor is watched; work left
//!   behind still drains when the scheduler is dropped at thread end.

pub mod channel;
pub mod clock;
mod fatal;
mod macros;
mod reactor;
pub mod sched;
pub mod stream;
pub mod task;
pub mod timer;
mod wake;

pub use channel::{Channel, RecvOp, SendError, SendOp};
pub use clock::millis_since_start;
pub use sched::{chan, defer, repeat, run, spawn, Scheduler};
pub use stream::Direction;
pub use task::{Cx, FnTask, Outcome, Task, TaskHandle, TaskId, TaskPoll, TaskState};
pub use timer::{Delay, FnTimer, OneShot, Repeat, Timer, TimerList, TimerPoll, TimerTask};
