//! Per-service execution context.
//!
//! A [`ServiceContext`] owns everything one service needs: its protocol
//! registry, session table, timer table, and task pool. All of it lives
//! behind one `Rc`, so cloning the context is cheap and every clone sees the
//! same state. Nothing is process-global.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ ServiceContext (Rc<ServiceState>)        │
//! │                                          │
//! │  registry:  RefCell<ProtocolRegistry>    │
//! │  sessions:  RefCell<SessionTable>        │
//! │  timers:    RefCell<TimerTable>          │
//! │  scheduler: Rc<Scheduler>                │
//! │  transport: Rc<dyn Transport>            │
//! └──────────────────────────────────────────┘
//!        ▲ dispatch(message)        │ send / schedule_timer / kill
//!        │                          ▼
//!                  Transport
//! ```
//!
//! # Single-Threaded Design
//!
//! Borrows of the tables are always scoped to one statement. None is held
//! across a task resume or a transport call, so a task may resume another
//! one from inside its own poll.
//!
//! # Example
//!
//! ```rust,ignore
//! ctx.spawn({
//!     let ctx = ctx.clone();
//!     async move {
//!         let reply = ctx.call("lua", peer, vec![json!("ping")]).await?;
//!         assert_eq!(reply.first(), Some(&json!("pong")));
//!         ctx.sleep(10).await?;
//!         Ok(())
//!     }
//! })?;
//! ```

mod dispatch;
mod lifecycle;
mod reply;
mod system;

#[cfg(test)]
pub(crate) mod testing;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::Location;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RemoteError, Result, ServiceError};
use crate::protocol::{
    DispatchFn, LocalBoxFuture, ProtocolDescriptor, ProtocolRef, ProtocolRegistry, Reply, Values,
};
use crate::session::{Binding, Lookup, SessionTable};
use crate::task::{Outcome, Resumed, Scheduler, Suspend, TaskHandle, WaitKey};
use crate::timer::{Fired, TimerAction, TimerTable};
use crate::transport::Transport;
use crate::types::{Address, ProtocolTag, SessionId, TimerId};

pub use reply::ReplyFuture;
pub use system::SERVICE_EXIT;

/// Replacement for the default quit-on-shutdown behavior.
pub type ShutdownHook = Rc<dyn Fn(ServiceContext) -> LocalBoxFuture<Result<()>>>;

/// Counters reported by the `state` debug command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Tasks running or suspended.
    pub tasks_running: usize,
    /// Idle pooled tasks.
    pub tasks_free: usize,
    /// Tasks discarded after a fault.
    pub tasks_discarded: u64,
    /// Sessions with a waiting task.
    pub sessions_waiting: usize,
    /// Cancelled sessions not yet answered.
    pub session_tombstones: usize,
    /// Sessions that fail when their watcher dies.
    pub watchers: usize,
    /// Timers waiting to fire.
    pub timers_pending: usize,
    /// Sessions allocated since start.
    pub sessions_allocated: u64,
    /// Timers fired since start.
    pub timers_fired: u64,
}

struct ServiceState {
    address: Address,
    name: String,
    transport: Rc<dyn Transport>,
    registry: RefCell<ProtocolRegistry>,
    sessions: RefCell<SessionTable>,
    timers: RefCell<TimerTable>,
    scheduler: Rc<Scheduler>,
    shutdown_hook: RefCell<Option<ShutdownHook>>,
    exited: Cell<bool>,
}

/// Handle to one service's runtime state.
#[derive(Clone)]
pub struct ServiceContext {
    state: Rc<ServiceState>,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("address", &self.state.address)
            .field("name", &self.state.name)
            .field("exited", &self.state.exited.get())
            .finish()
    }
}

impl ServiceContext {
    /// Create the context of the service at `address` and install the
    /// built-in protocols.
    pub fn new(
        address: Address,
        name: impl Into<String>,
        transport: Rc<dyn Transport>,
    ) -> Result<Self> {
        let ctx = Self {
            state: Rc::new(ServiceState {
                address,
                name: name.into(),
                transport,
                registry: RefCell::new(ProtocolRegistry::new()),
                sessions: RefCell::new(SessionTable::new()),
                timers: RefCell::new(TimerTable::new()),
                scheduler: Rc::new(Scheduler::new()),
                shutdown_hook: RefCell::new(None),
                exited: Cell::new(false),
            }),
        };
        system::install(&ctx)?;
        Ok(ctx)
    }

    /// Address of this service.
    pub fn address(&self) -> Address {
        self.state.address
    }

    /// Name of this service.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Transport clock in milliseconds.
    pub fn now(&self) -> u64 {
        self.state.transport.now()
    }

    /// Whether the service has been torn down.
    pub fn is_exited(&self) -> bool {
        self.state.exited.get()
    }

    /// Task currently running in this service, if any.
    pub fn current_task(&self) -> Option<TaskHandle> {
        self.state.scheduler.current()
    }

    // =========================================================================
    // Protocols
    // =========================================================================

    /// Register a protocol. Re-registering a tag replaces it.
    pub fn register_protocol(&self, descriptor: ProtocolDescriptor) -> Result<()> {
        self.state.registry.borrow_mut().register(descriptor)
    }

    /// Replace the fire-and-forget handler of a protocol. Returns the
    /// previous handler.
    pub fn set_dispatch<'p>(
        &self,
        protocol: impl Into<ProtocolRef<'p>>,
        handler: DispatchFn,
    ) -> Result<Option<DispatchFn>> {
        self.state
            .registry
            .borrow_mut()
            .set_dispatch(protocol.into(), handler)
    }

    /// Look up a registered protocol.
    pub fn protocol<'p>(
        &self,
        protocol: impl Into<ProtocolRef<'p>>,
    ) -> Option<Rc<ProtocolDescriptor>> {
        self.state.registry.borrow().lookup(protocol.into())
    }

    fn descriptor(&self, protocol: ProtocolRef<'_>) -> Result<Rc<ProtocolDescriptor>> {
        self.state
            .registry
            .borrow()
            .require(protocol)
            .inspect_err(|err| tracing::error!(service = %self.address(), %err, "protocol lookup failed"))
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Send values without expecting a response.
    pub fn send<'p>(
        &self,
        protocol: impl Into<ProtocolRef<'p>>,
        receiver: Address,
        values: Values,
    ) -> Result<()> {
        self.ensure_alive()?;
        let descriptor = self.descriptor(protocol.into())?;
        let payload = descriptor.pack(&values)?;
        self.state
            .transport
            .send(receiver, payload, "", 0, descriptor.tag())
    }

    /// Send an already encoded payload. A non-zero `session` marks the
    /// message as a request; pair it with [`make_session`](Self::make_session)
    /// and [`wait`](Self::wait).
    pub fn raw_send<'p>(
        &self,
        protocol: impl Into<ProtocolRef<'p>>,
        receiver: Address,
        header: &str,
        payload: Vec<u8>,
        session: SessionId,
    ) -> Result<()> {
        self.ensure_alive()?;
        let descriptor = self.descriptor(protocol.into())?;
        self.state.transport.send(
            receiver,
            payload,
            header,
            session.request_wire(),
            descriptor.tag(),
        )
    }

    /// Send a request and wait for the response.
    ///
    /// The receiver is recorded as the session's watcher: if it exits before
    /// answering, the call fails with a remote error instead of hanging.
    ///
    /// Must be awaited from inside a task of this service.
    #[track_caller]
    pub fn call<'p>(
        &self,
        protocol: impl Into<ProtocolRef<'p>>,
        receiver: Address,
        values: Values,
    ) -> ReplyFuture {
        let location = Location::caller();
        let packed = self
            .descriptor(protocol.into())
            .and_then(|descriptor| Ok((descriptor.tag(), descriptor.pack(&values)?)));
        let (ptype, payload) = match packed {
            Ok(packed) => packed,
            Err(err) => return ReplyFuture::failed(err),
        };

        let transport = self.state.transport.clone();
        self.begin_wait(location, Some(receiver), move |session| {
            transport.send(receiver, payload, "", session.request_wire(), ptype)
        })
    }

    /// Answer a request. A no-op when `session` is `NONE`.
    pub fn respond<'p>(
        &self,
        protocol: impl Into<ProtocolRef<'p>>,
        receiver: Address,
        session: SessionId,
        values: Values,
    ) -> Result<()> {
        if !session.expects_response() {
            return Ok(());
        }
        self.ensure_alive()?;
        let descriptor = self.descriptor(protocol.into())?;
        let payload = descriptor.pack(&values)?;
        self.state.transport.send(
            receiver,
            payload,
            "",
            session.response_wire(),
            descriptor.tag(),
        )
    }

    /// Fail a request: the caller observes a [`RemoteError`] carrying
    /// `message`. A no-op when `session` is `NONE`.
    pub fn respond_error(&self, receiver: Address, session: SessionId, message: &str) -> Result<()> {
        if !session.expects_response() {
            return Ok(());
        }
        self.ensure_alive()?;
        self.state.transport.send(
            receiver,
            Vec::new(),
            message,
            session.response_wire(),
            ProtocolTag::ERROR,
        )
    }

    // =========================================================================
    // Tasks and sessions
    // =========================================================================

    /// Run `body` in a pooled task until it first suspends or completes.
    ///
    /// # Errors
    ///
    /// `TaskFault` if the body fails before its first suspension.
    pub fn spawn<F>(&self, body: F) -> Result<TaskHandle>
    where
        F: Future<Output = Result<()>> + 'static,
    {
        self.ensure_alive()?;
        let (task, outcome) = self.state.scheduler.spawn(body);
        self.settle(task, outcome)?;
        Ok(task)
    }

    /// Allocate a session bound to the current task.
    pub fn make_session(&self, watcher: Option<Address>) -> Result<SessionId> {
        self.ensure_alive()?;
        let task = self.require_task()?;
        self.state.sessions.borrow_mut().allocate(task, watcher)
    }

    /// Wait for the response to a session made with
    /// [`make_session`](Self::make_session).
    ///
    /// The current task must not suspend anywhere else between making the
    /// session and waiting on it.
    #[track_caller]
    pub fn wait(&self, session: SessionId) -> ReplyFuture {
        let location = Location::caller();
        let task = match self.require_task() {
            Ok(task) => task,
            Err(err) => return ReplyFuture::failed(err),
        };
        let binding = self.state.sessions.borrow().get(session);
        if binding != Some(Binding::Waiting(task)) {
            tracing::warn!(%session, %task, ?binding, "wait on a session not bound to this task");
            return ReplyFuture::failed(ServiceError::UnmatchedResponse(session));
        }
        ReplyFuture::waiting(
            Suspend::at(self.state.scheduler.clone(), task, WaitKey::Session(session), location),
            Some(session),
        )
    }

    /// Resolve a local session with `values`, as if a response had arrived.
    pub fn wakeup(&self, session: SessionId, values: Values) -> Result<()> {
        self.resolve(session, Reply::Values(values))
    }

    /// Resume the task waiting on `session` with `reply`.
    ///
    /// # Errors
    ///
    /// - `UnmatchedResponse` if nothing was bound to the session
    /// - `TaskBusy` if the waiting task is the one running
    /// - `TaskFault` if the resumed task fails
    pub fn resolve(&self, session: SessionId, reply: Reply) -> Result<()> {
        self.deliver(session, move || Resumed::Reply(reply))
    }

    /// Resume the task waiting on `session` with a failure.
    pub fn resolve_error(&self, session: SessionId, message: &str) -> Result<()> {
        let remote = RemoteError::new(message);
        self.deliver(session, move || Resumed::Failed(remote))
    }

    /// Tombstone a session so its late response is dropped. A task still
    /// waiting on it is resumed with a failure.
    pub fn cancel_session(&self, session: SessionId) -> Result<()> {
        let waiting = self.state.sessions.borrow_mut().cancel(session);
        match waiting {
            Some(task) if Some(task) != self.current_task() => self.resume_task(
                task,
                WaitKey::Session(session),
                Resumed::Failed(RemoteError::new(format!("session {session} cancelled"))),
            ),
            _ => Ok(()),
        }
    }

    /// Fail every call watching `watcher` with `reason`.
    pub fn on_watcher_terminated(&self, watcher: Address, reason: &str) -> Result<()> {
        let failed = self.state.sessions.borrow_mut().take_watched_by(watcher);
        if !failed.is_empty() {
            tracing::debug!(service = %self.address(), %watcher, count = failed.len(), "failing calls to exited service");
        }

        let mut first_error = None;
        for (session, task) in failed {
            let resumed = Resumed::Failed(RemoteError::new(reason));
            if let Err(err) = self.resume_task(task, WaitKey::Session(session), resumed) {
                tracing::warn!(%session, %task, %err, "resuming watcher of exited service failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn deliver(&self, session: SessionId, resumed: impl FnOnce() -> Resumed) -> Result<()> {
        if !session.expects_response() {
            tracing::error!(service = %self.address(), "resolve called with session 0");
            return Err(ServiceError::UnmatchedResponse(session));
        }

        let bound = self.state.sessions.borrow().get(session);
        if let Some(Binding::Waiting(task)) = bound {
            if self.current_task() == Some(task) {
                return Err(ServiceError::TaskBusy(task));
            }
        }

        let lookup = self.state.sessions.borrow_mut().take(session);
        match lookup {
            Lookup::Waiting(task) => self.resume_task(task, WaitKey::Session(session), resumed()),
            Lookup::Cancelled => {
                tracing::trace!(service = %self.address(), %session, "late response swallowed");
                Ok(())
            }
            Lookup::Missing => {
                tracing::error!(service = %self.address(), %session, "response for a session nobody waits on");
                Err(ServiceError::UnmatchedResponse(session))
            }
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Suspend the current task for `delay_ms`. Resolves to the timer id.
    #[track_caller]
    pub fn sleep(&self, delay_ms: u64) -> impl Future<Output = Result<TimerId>> + 'static {
        let started = self.start_sleep(delay_ms, Location::caller());
        async move {
            let (timer, reply) = started?;
            reply.await?;
            Ok(timer)
        }
    }

    fn start_sleep(
        &self,
        delay_ms: u64,
        location: &'static Location<'static>,
    ) -> Result<(TimerId, ReplyFuture)> {
        self.ensure_alive()?;
        let task = self.require_task()?;
        let timer = self.arm_timer(delay_ms)?;
        self.state
            .timers
            .borrow_mut()
            .bind(timer, TimerAction::Resume(task));
        let suspend = Suspend::at(self.state.scheduler.clone(), task, WaitKey::Timer(timer), location);
        Ok((timer, ReplyFuture::waiting(suspend, None)))
    }

    /// Run `callback` once after `delay_ms`.
    pub fn timeout<F>(&self, delay_ms: u64, callback: F) -> Result<TimerId>
    where
        F: FnOnce(TimerId) + 'static,
    {
        self.ensure_alive()?;
        let timer = self.arm_timer(delay_ms)?;
        self.state
            .timers
            .borrow_mut()
            .bind(timer, TimerAction::Callback(Box::new(callback)));
        Ok(timer)
    }

    /// Cancel a pending timer. Returns `false` if it already fired or was
    /// cancelled. A task sleeping on it is resumed with a failure.
    pub fn cancel_timer(&self, timer: TimerId) -> Result<bool> {
        let action = self.state.timers.borrow_mut().cancel(timer);
        match action {
            Some(TimerAction::Resume(task)) if Some(task) != self.current_task() => {
                self.resume_task(
                    task,
                    WaitKey::Timer(timer),
                    Resumed::Failed(RemoteError::new(format!("timer {timer} cancelled"))),
                )?;
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    fn arm_timer(&self, delay_ms: u64) -> Result<TimerId> {
        let timer = self.state.timers.borrow_mut().schedule()?;
        if let Err(err) = self.state.transport.schedule_timer(delay_ms, timer) {
            self.state.timers.borrow_mut().cancel(timer);
            return Err(err);
        }
        Ok(timer)
    }

    pub(crate) fn fire_timer(&self, timer: TimerId) -> Result<()> {
        let fired = self.state.timers.borrow_mut().fire(timer);
        match fired {
            Fired::Action(TimerAction::Resume(task)) => self.resume_task(
                task,
                WaitKey::Timer(timer),
                Resumed::Reply(Reply::Values(vec![Value::from(timer.as_u32())])),
            ),
            Fired::Action(TimerAction::Callback(callback)) => {
                callback(timer);
                Ok(())
            }
            Fired::Cancelled | Fired::Unknown => Ok(()),
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Current counters.
    pub fn stats(&self) -> ServiceStats {
        let scheduler = &self.state.scheduler;
        let sessions = self.state.sessions.borrow();
        let timers = self.state.timers.borrow();
        ServiceStats {
            tasks_running: scheduler.running_count(),
            tasks_free: scheduler.free_count(),
            tasks_discarded: scheduler.discarded_count(),
            sessions_waiting: sessions.waiting_count(),
            session_tombstones: sessions.tombstone_count(),
            watchers: sessions.watcher_count(),
            timers_pending: timers.pending_count(),
            sessions_allocated: sessions.allocated_total(),
            timers_fired: timers.fired_total(),
        }
    }

    /// Sizes of the per-service tables, as reported by the `mem` debug
    /// command.
    pub fn table_sizes(&self) -> Value {
        serde_json::json!({
            "sessions": self.state.sessions.borrow().len(),
            "timers": self.state.timers.borrow().len(),
            "task_slots": self.state.scheduler.capacity(),
            "protocols": self.state.registry.borrow().len(),
        })
    }

    /// Drop session and timer tombstones. Returns how many of each.
    pub fn purge_tombstones(&self) -> (usize, usize) {
        let sessions = self.state.sessions.borrow_mut().purge_tombstones();
        let timers = self.state.timers.borrow_mut().purge_tombstones();
        (sessions, timers)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_alive(&self) -> Result<()> {
        if self.is_exited() {
            return Err(ServiceError::ServiceExited(self.address()));
        }
        Ok(())
    }

    fn require_task(&self) -> Result<TaskHandle> {
        self.current_task().ok_or(ServiceError::NotInTask)
    }

    fn begin_wait(
        &self,
        location: &'static Location<'static>,
        watcher: Option<Address>,
        start: impl FnOnce(SessionId) -> Result<()>,
    ) -> ReplyFuture {
        match self.open_session(watcher, start) {
            Ok((task, session)) => ReplyFuture::waiting(
                Suspend::at(self.state.scheduler.clone(), task, WaitKey::Session(session), location),
                Some(session),
            ),
            Err(err) => ReplyFuture::failed(err),
        }
    }

    fn open_session(
        &self,
        watcher: Option<Address>,
        start: impl FnOnce(SessionId) -> Result<()>,
    ) -> Result<(TaskHandle, SessionId)> {
        self.ensure_alive()?;
        let task = self.require_task()?;
        let session = self.state.sessions.borrow_mut().allocate(task, watcher)?;
        if let Err(err) = start(session) {
            self.state.sessions.borrow_mut().take(session);
            return Err(err);
        }
        Ok((task, session))
    }

    fn resume_task(&self, task: TaskHandle, key: WaitKey, resumed: Resumed) -> Result<()> {
        let outcome = self.state.scheduler.resume(task, key, resumed)?;
        self.settle(task, outcome)
    }

    fn settle(&self, task: TaskHandle, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Suspended => Ok(()),
            Outcome::Finished => {
                self.release_task(task);
                Ok(())
            }
            Outcome::Faulted(fault) => {
                self.release_task(task);
                Err(fault)
            }
        }
    }

    /// Tombstone sessions and timers left behind by a task that ended.
    fn release_task(&self, task: TaskHandle) {
        let sessions = self.state.sessions.borrow_mut().release_task(task);
        let timers = self.state.timers.borrow_mut().release_task(task);
        if sessions + timers > 0 {
            tracing::debug!(service = %self.address(), %task, sessions, timers, "task ended with bindings outstanding");
        }
    }

    /// Drop every task body and table. Called by the transport once the
    /// service is gone; breaks the reference cycles between task bodies and
    /// the context they captured.
    pub(crate) fn teardown(&self) {
        if self.state.exited.replace(true) {
            return;
        }
        self.state.scheduler.close_all();
        let hook = self.state.shutdown_hook.borrow_mut().take();
        let registry = std::mem::take(&mut *self.state.registry.borrow_mut());
        let timers = std::mem::take(&mut *self.state.timers.borrow_mut());
        let sessions = std::mem::take(&mut *self.state.sessions.borrow_mut());
        tracing::debug!(
            service = %self.address(),
            sessions = sessions.len(),
            timers = timers.len(),
            "service torn down"
        );
        drop((hook, registry, timers, sessions));
    }
}
