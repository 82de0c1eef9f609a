//! Transport double that records every native call.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::Result;
use crate::transport::{Message, Transport};
use crate::types::{Address, ProtocolTag, SessionId, TimerId};

use super::ServiceContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SpawnRequest {
    pub kind: String,
    pub config: String,
    pub unique: bool,
    pub worker_hint: u32,
    pub session: SessionId,
}

pub(crate) struct RecordingTransport {
    address: Address,
    clock: Cell<u64>,
    sent: RefCell<Vec<Message>>,
    timers: RefCell<Vec<(u64, TimerId)>>,
    spawned: RefCell<Vec<SpawnRequest>>,
    killed: RefCell<Vec<(Address, SessionId)>>,
    scans: RefCell<Vec<(u32, SessionId)>>,
    names: RefCell<HashMap<String, Address>>,
}

impl RecordingTransport {
    pub(crate) fn new(address: Address) -> Self {
        Self {
            address,
            clock: Cell::new(0),
            sent: RefCell::new(Vec::new()),
            timers: RefCell::new(Vec::new()),
            spawned: RefCell::new(Vec::new()),
            killed: RefCell::new(Vec::new()),
            scans: RefCell::new(Vec::new()),
            names: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }

    pub(crate) fn take_timers(&self) -> Vec<(u64, TimerId)> {
        std::mem::take(&mut *self.timers.borrow_mut())
    }

    pub(crate) fn take_spawned(&self) -> Vec<SpawnRequest> {
        std::mem::take(&mut *self.spawned.borrow_mut())
    }

    pub(crate) fn take_killed(&self) -> Vec<(Address, SessionId)> {
        std::mem::take(&mut *self.killed.borrow_mut())
    }

    pub(crate) fn take_scans(&self) -> Vec<(u32, SessionId)> {
        std::mem::take(&mut *self.scans.borrow_mut())
    }

    pub(crate) fn name(&self, name: &str, address: Address) {
        self.names.borrow_mut().insert(name.to_string(), address);
    }

    pub(crate) fn advance(&self, ms: u64) {
        self.clock.set(self.clock.get() + ms);
    }

    /// The response the receiver of `request` would send back.
    pub(crate) fn reply_to(request: &Message, payload: &[u8]) -> Message {
        Message::with_wire_session(
            request.receiver,
            request.sender,
            -request.session,
            request.ptype,
            "",
            payload.to_vec(),
        )
    }

    /// A text answer on `session`, as the native layer sends for spawn,
    /// kill, and scan requests.
    pub(crate) fn native_reply(receiver: Address, session: SessionId, text: &str) -> Message {
        Message::new(
            Address::NONE,
            receiver,
            session,
            ProtocolTag::TEXT,
            "",
            text.as_bytes().to_vec(),
        )
    }

    pub(crate) fn timer_event(receiver: Address, timer: TimerId) -> Message {
        Message::new(
            Address::new(timer.as_u32()),
            receiver,
            SessionId::NONE,
            ProtocolTag::TIMER,
            "",
            Vec::new(),
        )
    }
}

impl Transport for RecordingTransport {
    fn address(&self) -> Address {
        self.address
    }

    fn now(&self) -> u64 {
        self.clock.get()
    }

    fn send(
        &self,
        receiver: Address,
        payload: Vec<u8>,
        header: &str,
        session: i32,
        ptype: ProtocolTag,
    ) -> Result<()> {
        self.sent.borrow_mut().push(Message::with_wire_session(
            self.address,
            receiver,
            session,
            ptype,
            header,
            payload,
        ));
        Ok(())
    }

    fn schedule_timer(&self, delay_ms: u64, timer: TimerId) -> Result<()> {
        self.timers.borrow_mut().push((delay_ms, timer));
        Ok(())
    }

    fn spawn_service(
        &self,
        kind: &str,
        config: &str,
        unique: bool,
        worker_hint: u32,
        session: SessionId,
    ) -> Result<()> {
        self.spawned.borrow_mut().push(SpawnRequest {
            kind: kind.to_string(),
            config: config.to_string(),
            unique,
            worker_hint,
            session,
        });
        Ok(())
    }

    fn query_service(&self, name: &str) -> Option<Address> {
        self.names.borrow().get(name).copied()
    }

    fn kill(&self, address: Address, session: SessionId) -> Result<()> {
        self.killed.borrow_mut().push((address, session));
        Ok(())
    }

    fn scan_services(&self, worker_id: u32, session: SessionId) -> Result<()> {
        self.scans.borrow_mut().push((worker_id, session));
        Ok(())
    }
}

/// A context at `address` backed by a fresh recording transport.
pub(crate) fn context(address: u32) -> (ServiceContext, Rc<RecordingTransport>) {
    let transport = Rc::new(RecordingTransport::new(Address::new(address)));
    let ctx = ServiceContext::new(Address::new(address), "test", transport.clone())
        .unwrap_or_else(|err| panic!("context setup failed: {err}"));
    (ctx, transport)
}
