//! Task pool and the poll loop that drives suspended tasks.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, Location};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use crate::error::{RemoteError, Result, ServiceError};
use crate::protocol::Reply;
use crate::types::{SessionId, TimerId};

use super::trace::SuspendTrace;

/// Body of a task: a local future returning the task's outcome.
pub type TaskBody = Pin<Box<dyn Future<Output = Result<()>>>>;

/// Handle to one task.
///
/// The generation changes every time the slot goes back to the pool, so a
/// handle kept past the end of its job never resumes the slot's next job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    index: u32,
    generation: u32,
}

impl TaskHandle {
    /// Slot index inside the pool.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// What a parked task is waiting for.
///
/// Every delivery names its key. A task only wakes for the key it is parked
/// on; deliveries for its other pending sessions or timers are held until it
/// awaits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKey {
    /// Response to a session.
    Session(SessionId),
    /// Expiry of a timer.
    Timer(TimerId),
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitKey::Session(session) => write!(f, "session {session}"),
            WaitKey::Timer(timer) => write!(f, "timer {timer}"),
        }
    }
}

/// Value delivered to a suspended task.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumed {
    /// Normal resumption with a reply.
    Reply(Reply),
    /// Failure outcome (remote error or watcher termination).
    Failed(RemoteError),
}

impl Resumed {
    /// Convert into the result observed by the waiting code.
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Resumed::Reply(reply) => Ok(reply),
            Resumed::Failed(remote) => Err(ServiceError::Remote(remote)),
        }
    }
}

/// What happened when a task was polled.
#[derive(Debug)]
pub enum Outcome {
    /// The task parked on a suspension point.
    Suspended,
    /// The task ran to completion; its slot is back in the pool.
    Finished,
    /// The task failed; its slot was discarded.
    Faulted(ServiceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Running,
    Suspended,
    /// Returned `Pending` without parking on a runtime await point.
    Stalled,
}

struct TaskSlot {
    generation: u32,
    state: SlotState,
    body: Option<TaskBody>,
    waiting_on: Option<WaitKey>,
    delivered: Option<(WaitKey, Resumed)>,
    held: Vec<(WaitKey, Resumed)>,
    parked: bool,
    trace: SuspendTrace,
}

impl TaskSlot {
    fn fresh(generation: u32) -> Self {
        Self {
            generation,
            state: SlotState::Free,
            body: None,
            waiting_on: None,
            delivered: None,
            held: Vec::new(),
            parked: false,
            trace: SuspendTrace::new(),
        }
    }
}

/// Pool of reusable task slots for one service.
///
/// # Single-Threaded Design
///
/// Uses `Cell`/`RefCell` only. No borrow is held while a task body is
/// polled, so a running task may resume another one (cooperative handoff).
///
/// The pool grows with the peak number of concurrently suspended tasks and
/// never shrinks.
pub struct Scheduler {
    slots: RefCell<Vec<TaskSlot>>,
    free: RefCell<Vec<u32>>,
    current: Cell<Option<TaskHandle>>,
    discarded: Cell<u64>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            current: Cell::new(None),
            discarded: Cell::new(0),
        }
    }

    /// Start `body` on a pooled slot and run it until it first suspends or
    /// completes.
    pub fn spawn<F>(&self, body: F) -> (TaskHandle, Outcome)
    where
        F: Future<Output = Result<()>> + 'static,
    {
        let task = self.acquire();
        tracing::trace!(%task, "spawning task");
        let outcome = self.poll_task(task, Box::pin(body));
        (task, outcome)
    }

    /// Deliver `resumed` for `key` to a suspended task.
    ///
    /// If the task is parked on `key` it runs until it suspends again or
    /// completes. Otherwise the value is held, the task stays suspended, and
    /// the await on `key` completes at once when the task reaches it.
    ///
    /// # Errors
    ///
    /// - `TaskBusy` if the task is currently running
    /// - `StaleTask` if the task is not suspended (finished, recycled, stalled)
    pub fn resume(&self, task: TaskHandle, key: WaitKey, resumed: Resumed) -> Result<Outcome> {
        let body = {
            let mut slots = self.slots.borrow_mut();
            let slot = slots
                .get_mut(task.index as usize)
                .filter(|slot| slot.generation == task.generation)
                .ok_or(ServiceError::StaleTask(task))?;
            match slot.state {
                SlotState::Suspended => {}
                SlotState::Running => return Err(ServiceError::TaskBusy(task)),
                SlotState::Free | SlotState::Stalled => return Err(ServiceError::StaleTask(task)),
            }
            if slot.waiting_on != Some(key) {
                tracing::trace!(%task, %key, waiting_on = ?slot.waiting_on, "delivery held until awaited");
                slot.held.push((key, resumed));
                return Ok(Outcome::Suspended);
            }
            let body = slot.body.take().ok_or(ServiceError::StaleTask(task))?;
            slot.state = SlotState::Running;
            slot.parked = false;
            slot.waiting_on = None;
            slot.delivered = Some((key, resumed));
            body
        };
        Ok(self.poll_task(task, body))
    }

    /// Drop a suspended task without resuming it and return its slot to the
    /// pool. Returns `false` if the task is not suspended.
    pub fn close(&self, task: TaskHandle) -> bool {
        let body = {
            let mut slots = self.slots.borrow_mut();
            let Some(slot) = slots
                .get_mut(task.index as usize)
                .filter(|slot| slot.generation == task.generation)
            else {
                return false;
            };
            if !matches!(slot.state, SlotState::Suspended | SlotState::Stalled) {
                return false;
            }
            slot.body.take()
        };
        // Dropping the body may run destructors that touch the service.
        drop(body);
        self.recycle(task);
        true
    }

    /// Drop every task body. Used when the owning service is torn down.
    pub fn close_all(&self) {
        let bodies: Vec<TaskBody> = {
            let mut slots = self.slots.borrow_mut();
            slots.iter_mut().filter_map(|slot| slot.body.take()).collect()
        };
        drop(bodies);
    }

    /// The task currently being polled, if any.
    pub fn current(&self) -> Option<TaskHandle> {
        self.current.get()
    }

    /// Whether the handle names a task that is suspended right now.
    pub fn is_suspended(&self, task: TaskHandle) -> bool {
        self.slots
            .borrow()
            .get(task.index as usize)
            .map(|slot| slot.generation == task.generation && slot.state == SlotState::Suspended)
            .unwrap_or(false)
    }

    /// Number of tasks that are running or suspended.
    pub fn running_count(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|slot| slot.state != SlotState::Free)
            .count()
    }

    /// Number of idle slots ready for reuse.
    pub fn free_count(&self) -> usize {
        self.free.borrow().len()
    }

    /// Number of slots discarded after a fault.
    pub fn discarded_count(&self) -> u64 {
        self.discarded.get()
    }

    /// Total number of slots ever created.
    pub fn capacity(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Mark the task as parked on `key`.
    pub(crate) fn park(&self, task: TaskHandle, key: WaitKey, location: &'static Location<'static>) {
        let mut slots = self.slots.borrow_mut();
        if let Some(slot) = slots
            .get_mut(task.index as usize)
            .filter(|slot| slot.generation == task.generation)
        {
            slot.parked = true;
            slot.waiting_on = Some(key);
            slot.trace.push(location);
        }
    }

    /// Take a value delivered for `key`, either by the last `resume` or held
    /// earlier. Re-parks the task on `key` if there is none.
    pub(crate) fn take_delivery(&self, task: TaskHandle, key: WaitKey) -> Option<Resumed> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots
            .get_mut(task.index as usize)
            .filter(|slot| slot.generation == task.generation)?;
        if let Some(resumed) = take_held(slot, key) {
            return Some(resumed);
        }
        slot.parked = true;
        slot.waiting_on = Some(key);
        None
    }

    /// Take a value held for `key` without parking.
    pub(crate) fn take_early(&self, task: TaskHandle, key: WaitKey) -> Option<Resumed> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots
            .get_mut(task.index as usize)
            .filter(|slot| slot.generation == task.generation)?;
        take_held(slot, key)
    }

    fn acquire(&self) -> TaskHandle {
        let reused = self.free.borrow_mut().pop();
        let mut slots = self.slots.borrow_mut();
        let index = match reused {
            Some(index) => index,
            None => {
                slots.push(TaskSlot::fresh(0));
                (slots.len() - 1) as u32
            }
        };
        let slot = &mut slots[index as usize];
        slot.state = SlotState::Running;
        TaskHandle {
            index,
            generation: slot.generation,
        }
    }

    fn poll_task(&self, task: TaskHandle, mut body: TaskBody) -> Outcome {
        let previous = self.current.replace(Some(task));
        let mut cx = Context::from_waker(Waker::noop());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)));
        self.current.set(previous);

        match polled {
            Ok(Poll::Pending) => {
                let mut slots = self.slots.borrow_mut();
                let slot = &mut slots[task.index as usize];
                slot.state = if slot.parked {
                    SlotState::Suspended
                } else {
                    tracing::warn!(%task, "task suspended outside a runtime await point");
                    SlotState::Stalled
                };
                slot.body = Some(body);
                Outcome::Suspended
            }
            Ok(Poll::Ready(Ok(()))) => {
                drop(body);
                self.recycle(task);
                Outcome::Finished
            }
            Ok(Poll::Ready(Err(err))) => {
                drop(body);
                Outcome::Faulted(self.discard(task, err.to_string()))
            }
            Err(payload) => {
                drop(body);
                Outcome::Faulted(self.discard(task, panic_message(payload.as_ref())))
            }
        }
    }

    fn recycle(&self, task: TaskHandle) {
        {
            let mut slots = self.slots.borrow_mut();
            let slot = &mut slots[task.index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.state = SlotState::Free;
            slot.waiting_on = None;
            slot.delivered = None;
            slot.held.clear();
            slot.parked = false;
            slot.trace.clear();
        }
        self.free.borrow_mut().push(task.index);
    }

    fn discard(&self, task: TaskHandle, reason: String) -> ServiceError {
        let trace = {
            let mut slots = self.slots.borrow_mut();
            let slot = &mut slots[task.index as usize];
            let trace = std::mem::take(&mut slot.trace);
            *slot = TaskSlot::fresh(slot.generation.wrapping_add(1));
            trace
        };
        self.free.borrow_mut().push(task.index);
        self.discarded.set(self.discarded.get() + 1);
        tracing::error!(%task, %reason, "task faulted, slot discarded");
        ServiceError::TaskFault {
            task,
            reason,
            trace,
        }
    }
}

fn take_held(slot: &mut TaskSlot, key: WaitKey) -> Option<Resumed> {
    if slot.delivered.as_ref().is_some_and(|(k, _)| *k == key) {
        return slot.delivered.take().map(|(_, resumed)| resumed);
    }
    let position = slot.held.iter().position(|(k, _)| *k == key)?;
    Some(slot.held.remove(position).1)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use serde_json::json;

    use super::*;
    use crate::task::Suspend;

    const KEY: WaitKey = WaitKey::Session(SessionId(1));

    fn explode() -> Result<()> {
        panic!("kaboom")
    }

    fn values_reply(value: serde_json::Value) -> Resumed {
        Resumed::Reply(Reply::Values(vec![value]))
    }

    #[test]
    fn test_spawn_runs_immediately() {
        let scheduler = Scheduler::new();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();

        let (_, outcome) = scheduler.spawn(async move {
            flag.set(true);
            Ok(())
        });

        assert!(ran.get());
        assert!(matches!(outcome, Outcome::Finished));
        assert_eq!(scheduler.running_count(), 0);
        assert_eq!(scheduler.free_count(), 1);
    }

    #[test]
    fn test_suspend_and_resume_delivers_value() {
        let scheduler = Rc::new(Scheduler::new());
        let seen = Rc::new(RefCell::new(None));

        let sched = scheduler.clone();
        let sink = seen.clone();
        let (task, outcome) = scheduler.spawn(async move {
            let task = sched.current().ok_or(ServiceError::NotInTask)?;
            let resumed = Suspend::new(sched.clone(), task, KEY).await;
            *sink.borrow_mut() = Some(resumed);
            Ok(())
        });

        assert!(matches!(outcome, Outcome::Suspended));
        assert!(scheduler.is_suspended(task));
        assert_eq!(scheduler.running_count(), 1);

        let outcome = scheduler.resume(task, KEY, values_reply(json!("pong"))).unwrap();
        assert!(matches!(outcome, Outcome::Finished));
        assert_eq!(*seen.borrow(), Some(values_reply(json!("pong"))));
    }

    #[test]
    fn test_slots_are_reused_with_new_generation() {
        let scheduler = Scheduler::new();
        let (first, _) = scheduler.spawn(async { Ok(()) });
        let (second, _) = scheduler.spawn(async { Ok(()) });

        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert_eq!(scheduler.capacity(), 1);
    }

    #[test]
    fn test_resume_finished_task_is_stale() {
        let scheduler = Scheduler::new();
        let (task, _) = scheduler.spawn(async { Ok(()) });
        let result = scheduler.resume(task, KEY, values_reply(json!(1)));
        assert!(matches!(result, Err(ServiceError::StaleTask(_))));
    }

    #[test]
    fn test_resume_running_task_is_busy() {
        let scheduler = Rc::new(Scheduler::new());
        let observed = Rc::new(RefCell::new(None));

        let sched = scheduler.clone();
        let sink = observed.clone();
        scheduler.spawn(async move {
            let me = sched.current().ok_or(ServiceError::NotInTask)?;
            let result = sched.resume(me, KEY, values_reply(json!(1)));
            *sink.borrow_mut() = Some(matches!(result, Err(ServiceError::TaskBusy(_))));
            Ok(())
        });

        assert_eq!(*observed.borrow(), Some(true));
    }

    #[test]
    fn test_error_discards_slot_with_trace() {
        let scheduler = Rc::new(Scheduler::new());
        let sched = scheduler.clone();
        let (task, _) = scheduler.spawn(async move {
            let task = sched.current().ok_or(ServiceError::NotInTask)?;
            Suspend::new(sched.clone(), task, KEY).await;
            Err(ServiceError::Transport("boom".to_string()))
        });

        let outcome = scheduler.resume(task, KEY, values_reply(json!(null))).unwrap();
        match outcome {
            Outcome::Faulted(ServiceError::TaskFault { reason, trace, .. }) => {
                assert!(reason.contains("boom"));
                assert_eq!(trace.len(), 1);
            }
            other => panic!("expected fault, got {other:?}"),
        }
        assert_eq!(scheduler.discarded_count(), 1);
        assert_eq!(scheduler.free_count(), 1);
        assert_eq!(scheduler.running_count(), 0);
    }

    #[test]
    fn test_panic_is_captured_as_fault() {
        let scheduler = Scheduler::new();
        let (_, outcome) = scheduler.spawn(async { explode() });
        match outcome {
            Outcome::Faulted(ServiceError::TaskFault { reason, .. }) => {
                assert!(reason.contains("kaboom"));
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_close_recycles_suspended_task() {
        let scheduler = Rc::new(Scheduler::new());
        let sched = scheduler.clone();
        let (task, _) = scheduler.spawn(async move {
            let task = sched.current().ok_or(ServiceError::NotInTask)?;
            Suspend::new(sched.clone(), task, KEY).await;
            Ok(())
        });

        assert!(scheduler.close(task));
        assert!(!scheduler.close(task));
        assert_eq!(scheduler.running_count(), 0);
        assert_eq!(scheduler.free_count(), 1);
    }

    #[test]
    fn test_current_is_restored_after_nested_resume() {
        let scheduler = Rc::new(Scheduler::new());

        let sched = scheduler.clone();
        let (sleeper, _) = scheduler.spawn(async move {
            let task = sched.current().ok_or(ServiceError::NotInTask)?;
            Suspend::new(sched.clone(), task, KEY).await;
            Ok(())
        });

        let sched = scheduler.clone();
        let restored = Rc::new(Cell::new(false));
        let flag = restored.clone();
        let (waker, _) = scheduler.spawn(async move {
            let me = sched.current();
            sched.resume(sleeper, KEY, values_reply(json!(1)))?;
            flag.set(sched.current() == me);
            Ok(())
        });

        assert!(restored.get());
        assert_ne!(waker, sleeper);
        assert_eq!(scheduler.current(), None);
    }
    #[test]
    fn test_delivery_for_other_key_is_held_until_awaited() {
        let scheduler = Rc::new(Scheduler::new());
        let first = WaitKey::Session(SessionId::new(1));
        let second = WaitKey::Timer(TimerId::new(1));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let (sched, sink) = (scheduler.clone(), seen.clone());
        let (task, _) = scheduler.spawn(async move {
            let me = sched.current().ok_or(ServiceError::NotInTask)?;
            let a = Suspend::new(sched.clone(), me, first);
            let b = Suspend::new(sched.clone(), me, second);
            let va = a.await;
            sink.borrow_mut().push(va);
            let vb = b.await;
            sink.borrow_mut().push(vb);
            Ok(())
        });

        let outcome = scheduler.resume(task, second, values_reply(json!("b"))).unwrap();
        assert!(matches!(outcome, Outcome::Suspended));
        assert!(seen.borrow().is_empty());

        let outcome = scheduler.resume(task, first, values_reply(json!("a"))).unwrap();
        assert!(matches!(outcome, Outcome::Finished));
        assert_eq!(
            *seen.borrow(),
            vec![values_reply(json!("a")), values_reply(json!("b"))]
        );
    }

    #[test]
    fn test_held_values_are_dropped_with_the_slot() {
        let scheduler = Rc::new(Scheduler::new());
        let sched = scheduler.clone();
        let (task, _) = scheduler.spawn(async move {
            let me = sched.current().ok_or(ServiceError::NotInTask)?;
            Suspend::new(sched.clone(), me, KEY).await;
            Ok(())
        });

        let stray = WaitKey::Timer(TimerId::new(9));
        scheduler.resume(task, stray, values_reply(json!(9))).unwrap();
        scheduler.resume(task, KEY, values_reply(json!(1))).unwrap();

        let sched = scheduler.clone();
        let leaked = Rc::new(Cell::new(true));
        let flag = leaked.clone();
        scheduler.spawn(async move {
            let me = sched.current().ok_or(ServiceError::NotInTask)?;
            flag.set(sched.take_early(me, stray).is_some());
            Ok(())
        });
        assert!(!leaked.get());
    }
}
