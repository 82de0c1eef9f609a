//! Identifier types shared by every runtime component.
//!
//! All identifiers are thin `u32` newtypes. Value `0` is reserved in every
//! space: it never names a live service, session, or timer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest session id before the counter wraps back to 1.
pub const SESSION_ID_MAX: u32 = 0x7FFF_FFFE;

/// Largest timer id before the counter wraps back to 1.
pub const TIMER_ID_MAX: u32 = 0xFFFF_FFFE;

/// Opaque address of one service.
///
/// Assigned by the transport when the service is created and unique for as
/// long as the service is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u32);

impl Address {
    /// The "no service" address.
    pub const NONE: Address = Address(0);

    /// Create an address from its raw value.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the reserved zero address.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{:08x}", self.0)
    }
}

/// Correlation identifier pairing one request with its single response.
///
/// # Invariants
///
/// - `SessionId::NONE` (0) means "no response expected"
/// - Live ids are in `1..=SESSION_ID_MAX`
/// - At most one pending call owns a given value at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Fire-and-forget marker.
    pub const NONE: SessionId = SessionId(0);

    /// Create a session id from its raw value.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether a response is expected for this id.
    pub fn expects_response(&self) -> bool {
        self.0 != 0
    }

    /// Wire form of a request: negated, so the receiver can tell a request
    /// that awaits a reply from a reply to one of its own calls.
    pub fn request_wire(&self) -> i32 {
        -(self.0 as i32)
    }

    /// Wire form of a response.
    pub fn response_wire(&self) -> i32 {
        self.0 as i32
    }

    /// Session carried by a wire value, regardless of direction.
    pub fn from_wire(wire: i32) -> Self {
        Self(wire.unsigned_abs())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one scheduled timer. Independent from [`SessionId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(pub u32);

impl TimerId {
    /// Create a timer id from its raw value.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Integer tag classifying a message's encoding and routing rules.
///
/// Tags 1 through 9 are reserved and must match the native transport.
/// Services may register their own protocols above [`ProtocolTag::TIMER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolTag(pub u8);

impl ProtocolTag {
    /// Service-to-service control messages (`_service_exit`, ...).
    pub const SYSTEM: ProtocolTag = ProtocolTag(1);
    /// Plain text.
    pub const TEXT: ProtocolTag = ProtocolTag(2);
    /// Generic request/response calls with packed values.
    pub const GENERIC_CALL: ProtocolTag = ProtocolTag(3);
    /// Socket events.
    pub const SOCKET: ProtocolTag = ProtocolTag(4);
    /// Remote failure carried back to a waiting caller.
    pub const ERROR: ProtocolTag = ProtocolTag(5);
    /// Websocket events.
    pub const WEBSOCKET: ProtocolTag = ProtocolTag(6);
    /// Introspection commands.
    pub const DEBUG: ProtocolTag = ProtocolTag(7);
    /// Shutdown signal.
    pub const SHUTDOWN: ProtocolTag = ProtocolTag(8);
    /// Timer expiry events.
    pub const TIMER: ProtocolTag = ProtocolTag(9);

    /// Create a tag from its raw value.
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Whether this is the reserved zero tag.
    pub fn is_reserved_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id counter in `1..=max` that wraps to 1 and never yields 0.
#[derive(Debug, Clone)]
pub(crate) struct IdSequence {
    next: u32,
    max: u32,
}

impl IdSequence {
    pub(crate) fn new(max: u32) -> Self {
        Self::starting_at(1, max)
    }

    pub(crate) fn starting_at(start: u32, max: u32) -> Self {
        let next = if start == 0 || start > max { 1 } else { start };
        Self { next, max }
    }

    pub(crate) fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = if id >= self.max { 1 } else { id + 1 };
        id
    }
}
