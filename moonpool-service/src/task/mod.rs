//! Cooperative task scheduling.
//!
//! A task is a boxed future driven by the [`Scheduler`] rather than by an
//! async executor. It only ever suspends on the runtime's own await points
//! ([`Suspend`]): waiting for a session, a timer, or an explicit `wait`.
//! Resuming a task delivers exactly one [`Resumed`] value and polls it
//! synchronously until the next suspension or completion.
//!
//! ```text
//! spawn(body) ──► poll ──► Pending (parked on Suspend) ──► resume(task, value) ──► poll ──► ...
//!                   │                                                               │
//!                   └──► Ready(Ok)  → slot cleared, returned to pool                │
//!                   └──► Ready(Err) / panic → TaskFault, slot discarded ◄───────────┘
//! ```

mod scheduler;
mod suspend;
mod trace;

pub use scheduler::{Outcome, Resumed, Scheduler, TaskHandle, WaitKey};
pub use suspend::Suspend;
pub use trace::SuspendTrace;
