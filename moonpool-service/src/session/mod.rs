//! Session table for request/response correlation.
//!
//! Every outgoing call allocates a session id and binds it to the task that
//! waits for the answer. The inbound response names the same id, which is
//! how the router finds the task to resume.
//!
//! # Lifecycle
//!
//! ```text
//!   allocate ──► Waiting(task) ──take──► resumed (binding gone)
//!                    │
//!                  cancel
//!                    ▼
//!                Cancelled ──take──► late response swallowed (binding gone)
//! ```
//!
//! A session may also record a *watcher*: the address whose death fails the
//! call. The watcher entry is removed together with the binding.

use std::collections::HashMap;

use crate::error::{Result, ServiceError};
use crate::task::TaskHandle;
use crate::types::{Address, IdSequence, SessionId, SESSION_ID_MAX};

/// What a live session id is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// A task is suspended waiting for the response.
    Waiting(TaskHandle),
    /// Cancelled on purpose; the late response is dropped silently.
    Cancelled,
}

/// Result of removing a session from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The waiting task, to be resumed.
    Waiting(TaskHandle),
    /// A tombstone was consumed.
    Cancelled,
    /// Nothing was bound to the id.
    Missing,
}

/// Per-service session table.
///
/// Holds no interior mutability; the owning service keeps it in a `RefCell`
/// and never holds the borrow across a task resume.
#[derive(Debug)]
pub struct SessionTable {
    ids: IdSequence,
    bindings: HashMap<SessionId, Binding>,
    watchers: HashMap<SessionId, Address>,
    allocated: u64,
    resolved: u64,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    /// Create an empty table whose first id is 1.
    pub fn new() -> Self {
        Self::with_sequence(IdSequence::new(SESSION_ID_MAX))
    }

    /// Create an empty table whose next id is `start`.
    #[cfg(test)]
    pub(crate) fn starting_at(start: u32) -> Self {
        Self::with_sequence(IdSequence::starting_at(start, SESSION_ID_MAX))
    }

    fn with_sequence(ids: IdSequence) -> Self {
        Self {
            ids,
            bindings: HashMap::new(),
            watchers: HashMap::new(),
            allocated: 0,
            resolved: 0,
        }
    }

    /// Allocate a fresh id bound to `task`, optionally watched by `watcher`.
    ///
    /// # Errors
    ///
    /// `SessionCollision` if the next id is still bound. That means more
    /// calls are outstanding than the id space can hold, which is treated as
    /// an invariant violation.
    pub fn allocate(&mut self, task: TaskHandle, watcher: Option<Address>) -> Result<SessionId> {
        let session = SessionId::new(self.ids.next_id());
        if self.bindings.contains_key(&session) {
            tracing::error!(%session, %task, "session id still live after wraparound");
            return Err(ServiceError::SessionCollision(session));
        }

        self.bindings.insert(session, Binding::Waiting(task));
        if let Some(watcher) = watcher.filter(|address| !address.is_none()) {
            self.watchers.insert(session, watcher);
        }
        self.allocated += 1;
        Ok(session)
    }

    /// Remove the binding and its watcher entry.
    pub fn take(&mut self, session: SessionId) -> Lookup {
        self.watchers.remove(&session);
        match self.bindings.remove(&session) {
            Some(Binding::Waiting(task)) => {
                self.resolved += 1;
                Lookup::Waiting(task)
            }
            Some(Binding::Cancelled) => Lookup::Cancelled,
            None => Lookup::Missing,
        }
    }

    /// Current binding, if any.
    pub fn get(&self, session: SessionId) -> Option<Binding> {
        self.bindings.get(&session).copied()
    }

    /// Tombstone a session. Returns the task that was waiting on it.
    ///
    /// Idempotent: cancelling a tombstone or an unknown id changes nothing.
    pub fn cancel(&mut self, session: SessionId) -> Option<TaskHandle> {
        self.watchers.remove(&session);
        match self.bindings.get(&session).copied() {
            Some(Binding::Waiting(task)) => {
                self.bindings.insert(session, Binding::Cancelled);
                Some(task)
            }
            Some(Binding::Cancelled) | None => None,
        }
    }

    /// Remove every session watched by `watcher` and return the waiting
    /// tasks, ordered by session id.
    pub fn take_watched_by(&mut self, watcher: Address) -> Vec<(SessionId, TaskHandle)> {
        let mut sessions: Vec<SessionId> = self
            .watchers
            .iter()
            .filter(|(_, address)| **address == watcher)
            .map(|(session, _)| *session)
            .collect();
        sessions.sort_unstable();

        sessions
            .into_iter()
            .filter_map(|session| match self.take(session) {
                Lookup::Waiting(task) => Some((session, task)),
                Lookup::Cancelled | Lookup::Missing => None,
            })
            .collect()
    }

    /// Tombstone every session not bound to `keep` and return the tasks
    /// that were waiting, without duplicates.
    pub fn discard_all_except(&mut self, keep: Option<TaskHandle>) -> Vec<TaskHandle> {
        let mut tasks = Vec::new();
        for (session, binding) in self.bindings.iter_mut() {
            if let Binding::Waiting(task) = *binding {
                if Some(task) == keep {
                    continue;
                }
                *binding = Binding::Cancelled;
                self.watchers.remove(session);
                if !tasks.contains(&task) {
                    tasks.push(task);
                }
            }
        }
        tasks
    }

    /// Tombstone sessions still bound to a task that is no longer waiting.
    pub fn release_task(&mut self, task: TaskHandle) -> usize {
        let mut released = 0;
        for (session, binding) in self.bindings.iter_mut() {
            if *binding == Binding::Waiting(task) {
                *binding = Binding::Cancelled;
                self.watchers.remove(session);
                released += 1;
            }
        }
        released
    }

    /// Drop every tombstone. Late responses to them become unmatched.
    pub fn purge_tombstones(&mut self) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| *binding != Binding::Cancelled);
        before - self.bindings.len()
    }

    /// Number of live entries, tombstones included.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the table holds no entry.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Number of sessions with a waiting task.
    pub fn waiting_count(&self) -> usize {
        self.bindings
            .values()
            .filter(|binding| matches!(binding, Binding::Waiting(_)))
            .count()
    }

    /// Number of tombstones.
    pub fn tombstone_count(&self) -> usize {
        self.len() - self.waiting_count()
    }

    /// Number of watcher entries.
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Sessions allocated since creation.
    pub fn allocated_total(&self) -> u64 {
        self.allocated
    }

    /// Sessions resolved by a response or an error since creation.
    pub fn resolved_total(&self) -> u64 {
        self.resolved
    }
}
