//! Single-shot timers keyed by [`TimerId`].
//!
//! Scheduling is two-step: [`TimerTable::schedule`] reserves an id so it can
//! be handed to the transport's delay primitive, then [`TimerTable::bind`]
//! attaches what happens when it fires. The id space is independent from
//! sessions.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, ServiceError};
use crate::task::TaskHandle;
use crate::types::{IdSequence, TimerId, TIMER_ID_MAX};

/// Callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce(TimerId)>;

/// What a fired timer does.
pub enum TimerAction {
    /// Resume a task blocked in `sleep`.
    Resume(TaskHandle),
    /// Invoke a plain callback.
    Callback(TimerCallback),
}

impl fmt::Debug for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerAction::Resume(task) => f.debug_tuple("Resume").field(task).finish(),
            TimerAction::Callback(_) => f.write_str("Callback"),
        }
    }
}

enum TimerEntry {
    Reserved,
    Bound(TimerAction),
    Cancelled,
}

/// Result of a timer firing.
#[derive(Debug)]
pub enum Fired {
    /// Perform this action.
    Action(TimerAction),
    /// A tombstone was consumed.
    Cancelled,
    /// Nothing was scheduled under the id.
    Unknown,
}

/// Per-service timer table.
pub struct TimerTable {
    ids: IdSequence,
    entries: HashMap<TimerId, TimerEntry>,
    fired: u64,
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerTable {
    /// Create an empty table whose first id is 1.
    pub fn new() -> Self {
        Self {
            ids: IdSequence::new(TIMER_ID_MAX),
            entries: HashMap::new(),
            fired: 0,
        }
    }

    /// Reserve a fresh timer id.
    ///
    /// # Errors
    ///
    /// `TimerCollision` if the next id is still pending.
    pub fn schedule(&mut self) -> Result<TimerId> {
        let timer = TimerId::new(self.ids.next_id());
        if self.entries.contains_key(&timer) {
            tracing::error!(%timer, "timer id still live after wraparound");
            return Err(ServiceError::TimerCollision(timer));
        }
        self.entries.insert(timer, TimerEntry::Reserved);
        Ok(timer)
    }

    /// Attach the action to a reserved id. An id cancelled in between keeps
    /// its tombstone and the action is dropped.
    pub fn bind(&mut self, timer: TimerId, action: TimerAction) {
        match self.entries.get_mut(&timer) {
            Some(entry @ TimerEntry::Reserved) => {
                *entry = TimerEntry::Bound(action);
            }
            Some(TimerEntry::Cancelled) => {
                tracing::debug!(%timer, "timer cancelled before bind");
            }
            Some(TimerEntry::Bound(_)) | None => {
                tracing::error!(%timer, "bind on a timer that was not reserved");
            }
        }
    }

    /// Remove the entry and return what to do with it.
    pub fn fire(&mut self, timer: TimerId) -> Fired {
        match self.entries.remove(&timer) {
            Some(TimerEntry::Bound(action)) => {
                self.fired += 1;
                Fired::Action(action)
            }
            Some(TimerEntry::Cancelled) => Fired::Cancelled,
            Some(TimerEntry::Reserved) | None => {
                tracing::debug!(%timer, "timer fired with nothing bound");
                Fired::Unknown
            }
        }
    }

    /// Tombstone a pending timer and return its action.
    pub fn cancel(&mut self, timer: TimerId) -> Option<TimerAction> {
        let entry = self.entries.get_mut(&timer)?;
        match std::mem::replace(entry, TimerEntry::Cancelled) {
            TimerEntry::Bound(action) => Some(action),
            TimerEntry::Reserved | TimerEntry::Cancelled => None,
        }
    }

    /// Tombstone every timer not resuming `keep` and return the tasks that
    /// were sleeping.
    pub fn discard_all_except(&mut self, keep: Option<TaskHandle>) -> Vec<TaskHandle> {
        let mut tasks = Vec::new();
        for entry in self.entries.values_mut() {
            if let TimerEntry::Bound(TimerAction::Resume(task)) = entry {
                if Some(*task) == keep {
                    continue;
                }
                tasks.push(*task);
            }
            *entry = TimerEntry::Cancelled;
        }
        tasks
    }

    /// Tombstone timers that would resume a task that is no longer sleeping.
    pub fn release_task(&mut self, task: TaskHandle) -> usize {
        let mut released = 0;
        for entry in self.entries.values_mut() {
            if matches!(entry, TimerEntry::Bound(TimerAction::Resume(t)) if *t == task) {
                *entry = TimerEntry::Cancelled;
                released += 1;
            }
        }
        released
    }

    /// Drop every tombstone.
    pub fn purge_tombstones(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !matches!(entry, TimerEntry::Cancelled));
        before - self.entries.len()
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of timers still waiting to fire.
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| !matches!(entry, TimerEntry::Cancelled))
            .count()
    }

    /// Timers that fired with an action since creation.
    pub fn fired_total(&self) -> u64 {
        self.fired
    }
}
