//! Codecs and descriptors for the reserved protocol tags.
//!
//! Descriptors here carry only their codecs. Handlers that need a
//! [`ServiceContext`](crate::ServiceContext) (system, debug, error, shutdown,
//! timer) are attached by the service when it installs the built-ins.

use std::rc::Rc;

use serde_json::Value;

use crate::error::Result;
use crate::types::ProtocolTag;

use super::{PackFn, ProtocolDescriptor, UnpackFn, Values};

/// Name of the generic-call protocol.
pub const GENERIC_CALL: &str = "lua";

/// Concatenate values as text. Strings are written verbatim, anything else
/// in its JSON form.
pub fn text_pack(values: &[Value]) -> Result<Vec<u8>> {
    let mut out = String::new();
    for value in values {
        match value {
            Value::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
    }
    Ok(out.into_bytes())
}

/// Decode a payload as one text value.
pub fn text_unpack(payload: &[u8]) -> Result<Values> {
    Ok(vec![Value::String(
        String::from_utf8_lossy(payload).into_owned(),
    )])
}

/// Encode values as a JSON array.
pub fn json_pack(values: &[Value]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(values)?)
}

/// Decode a JSON array. An empty payload is an empty argument list.
pub fn json_unpack(payload: &[u8]) -> Result<Values> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(payload)?)
}

fn text_codec(descriptor: ProtocolDescriptor) -> ProtocolDescriptor {
    let pack: PackFn = Rc::new(text_pack);
    let unpack: UnpackFn = Rc::new(text_unpack);
    descriptor.with_pack(pack).with_unpack(unpack)
}

fn json_codec(descriptor: ProtocolDescriptor) -> ProtocolDescriptor {
    let pack: PackFn = Rc::new(json_pack);
    let unpack: UnpackFn = Rc::new(json_unpack);
    descriptor.with_pack(pack).with_unpack(unpack)
}

/// Descriptors for every reserved tag, without handlers.
pub fn descriptors() -> Vec<ProtocolDescriptor> {
    vec![
        text_codec(ProtocolDescriptor::new(ProtocolTag::SYSTEM, "system")),
        text_codec(ProtocolDescriptor::new(ProtocolTag::TEXT, "text")),
        json_codec(ProtocolDescriptor::new(ProtocolTag::GENERIC_CALL, GENERIC_CALL)),
        ProtocolDescriptor::new(ProtocolTag::SOCKET, "socket"),
        text_codec(ProtocolDescriptor::new(ProtocolTag::ERROR, "error")),
        ProtocolDescriptor::new(ProtocolTag::WEBSOCKET, "websocket"),
        json_codec(ProtocolDescriptor::new(ProtocolTag::DEBUG, "debug")),
        ProtocolDescriptor::new(ProtocolTag::SHUTDOWN, "shutdown"),
        ProtocolDescriptor::new(ProtocolTag::TIMER, "timer"),
    ]
}
