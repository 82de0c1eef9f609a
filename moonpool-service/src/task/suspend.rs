//! The single suspension primitive every await point is built on.

use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use super::scheduler::{Resumed, Scheduler, TaskHandle, WaitKey};

/// Future that parks the current task until the scheduler resumes it with
/// a value for this future's [`WaitKey`].
///
/// The first poll completes at once if a value for the key is already held.
/// Otherwise it records the suspension point and returns `Pending`. Later
/// polls yield the value handed to [`Scheduler::resume`] for the key.
pub struct Suspend {
    scheduler: Rc<Scheduler>,
    task: TaskHandle,
    key: WaitKey,
    location: &'static Location<'static>,
    armed: bool,
}

impl Suspend {
    /// Park `task` on `key`, recording the caller as the suspension point.
    #[track_caller]
    pub fn new(scheduler: Rc<Scheduler>, task: TaskHandle, key: WaitKey) -> Self {
        Self::at(scheduler, task, key, Location::caller())
    }

    /// Park `task` on `key`, recording an explicit suspension point.
    pub fn at(
        scheduler: Rc<Scheduler>,
        task: TaskHandle,
        key: WaitKey,
        location: &'static Location<'static>,
    ) -> Self {
        Self {
            scheduler,
            task,
            key,
            location,
            armed: false,
        }
    }

    /// The task this future parks.
    pub fn task(&self) -> TaskHandle {
        self.task
    }

    /// What this future waits for.
    pub fn key(&self) -> WaitKey {
        self.key
    }
}

impl Future for Suspend {
    type Output = Resumed;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.armed {
            self.armed = true;
            if let Some(resumed) = self.scheduler.take_early(self.task, self.key) {
                return Poll::Ready(resumed);
            }
            self.scheduler.park(self.task, self.key, self.location);
            return Poll::Pending;
        }
        match self.scheduler.take_delivery(self.task, self.key) {
            Some(resumed) => Poll::Ready(resumed),
            None => Poll::Pending,
        }
    }
}
