//! Boundary between the service runtime and whatever moves messages.
//!
//! The runtime never touches sockets, threads, or clocks directly. Each
//! service holds one [`Transport`] handle bound to its own address, and the
//! transport calls back into [`ServiceContext::dispatch`](crate::ServiceContext::dispatch)
//! for every inbound message.
//!
//! [`LocalNode`] is the in-process implementation used by tests and
//! single-process deployments.

mod local;

use std::borrow::Cow;
use std::fmt;

use crate::error::Result;
use crate::types::{Address, ProtocolTag, SessionId, TimerId};

pub use local::{service_init, LocalNode, LocalNodeBuilder, ServiceInit, DEAD_SERVICE};

/// One message as delivered by the transport.
///
/// The `session` field keeps the wire sign convention:
///
/// - `> 0`: response to a call this service made
/// - `< 0`: request whose sender waits for a response
/// - `0`: no correlation
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Sending service. Timer events carry the timer id here.
    pub sender: Address,
    /// Receiving service.
    pub receiver: Address,
    /// Signed session as carried on the wire.
    pub session: i32,
    /// Free-form header, used as the command name by system and debug.
    pub header: String,
    /// Protocol tag.
    pub ptype: ProtocolTag,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message.
    pub fn new(
        sender: Address,
        receiver: Address,
        session: SessionId,
        ptype: ProtocolTag,
        header: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sender,
            receiver,
            session: session.response_wire(),
            header: header.into(),
            ptype,
            payload,
        }
    }

    /// Create a message with a raw wire session.
    pub fn with_wire_session(
        sender: Address,
        receiver: Address,
        session: i32,
        ptype: ProtocolTag,
        header: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sender,
            receiver,
            session,
            header: header.into(),
            ptype,
            payload,
        }
    }

    /// Session id regardless of direction.
    pub fn session_id(&self) -> SessionId {
        SessionId::from_wire(self.session)
    }

    /// Whether this answers a call made by the receiver.
    pub fn is_response(&self) -> bool {
        self.session > 0
    }

    /// Session to answer with, `NONE` unless the sender waits for a reply.
    pub fn reply_session(&self) -> SessionId {
        if self.session < 0 {
            SessionId::from_wire(self.session)
        } else {
            SessionId::NONE
        }
    }

    /// Timer id of a timer event.
    pub fn timer_id(&self) -> TimerId {
        TimerId::new(self.sender.as_u32())
    }

    /// Payload decoded as UTF-8, lossily.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("session", &self.session)
            .field("header", &self.header)
            .field("ptype", &self.ptype)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Native operations a service needs from its host.
///
/// Implementations must not call back into the service synchronously:
/// anything that produces a message for this service (responses, timer
/// events, spawn acknowledgements) is delivered later through `dispatch`.
pub trait Transport {
    /// Address of the service this handle belongs to.
    fn address(&self) -> Address;

    /// Milliseconds since the transport started.
    fn now(&self) -> u64;

    /// Deliver a message. `session` uses the wire sign convention of
    /// [`Message::session`].
    fn send(
        &self,
        receiver: Address,
        payload: Vec<u8>,
        header: &str,
        session: i32,
        ptype: ProtocolTag,
    ) -> Result<()>;

    /// Post a timer event for `timer` after `delay_ms`.
    fn schedule_timer(&self, delay_ms: u64, timer: TimerId) -> Result<()>;

    /// Create a service and answer on `session` with its address as text,
    /// `"0"` on failure.
    fn spawn_service(
        &self,
        kind: &str,
        config: &str,
        unique: bool,
        worker_hint: u32,
        session: SessionId,
    ) -> Result<()>;

    /// Address of a uniquely named service.
    fn query_service(&self, name: &str) -> Option<Address>;

    /// Remove a service. Answers on `session` once it is gone, unless
    /// `session` is `NONE`.
    fn kill(&self, address: Address, session: SessionId) -> Result<()>;

    /// Answer on `session` with a description of the services hosted by
    /// `worker_id`.
    fn scan_services(&self, worker_id: u32, session: SessionId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_direction() {
        let request = Message::with_wire_session(
            Address::new(1),
            Address::new(2),
            SessionId::new(5).request_wire(),
            ProtocolTag::GENERIC_CALL,
            "",
            Vec::new(),
        );
        assert!(!request.is_response());
        assert_eq!(request.reply_session(), SessionId::new(5));

        let response = Message::new(
            Address::new(2),
            Address::new(1),
            SessionId::new(5),
            ProtocolTag::GENERIC_CALL,
            "",
            Vec::new(),
        );
        assert!(response.is_response());
        assert_eq!(response.reply_session(), SessionId::NONE);
        assert_eq!(response.session_id(), SessionId::new(5));
    }

    #[test]
    fn test_timer_event_carries_id_in_sender() {
        let event = Message::new(
            Address::new(42),
            Address::new(2),
            SessionId::NONE,
            ProtocolTag::TIMER,
            "",
            Vec::new(),
        );
        assert_eq!(event.timer_id(), TimerId::new(42));
        assert_eq!(event.payload_text(), "");
    }
}
