//! ProtocolRegistry: tag → descriptor routing with a name index.
//!
//! Tags are a `u8`, so lookup by tag is a direct array index. Names are a
//! secondary index built at registration time.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Result, ServiceError};
use crate::types::ProtocolTag;

use super::{DispatchFn, ProtocolDescriptor, ProtocolRef};

const TAG_SPACE: usize = u8::MAX as usize + 1;

/// Maps protocol tags and names to descriptors.
pub struct ProtocolRegistry {
    by_tag: [Option<Rc<ProtocolDescriptor>>; TAG_SPACE],
    by_name: HashMap<String, ProtocolTag>,
    registration_count: u64,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            by_tag: std::array::from_fn(|_| None),
            by_name: HashMap::new(),
            registration_count: 0,
        }
    }

    /// Register a descriptor under its tag and its name.
    ///
    /// Re-registering a tag logs a warning and replaces the old descriptor.
    ///
    /// # Errors
    ///
    /// `ReservedProtocolTag` for tag 0.
    pub fn register(&mut self, descriptor: ProtocolDescriptor) -> Result<()> {
        let tag = descriptor.tag();
        if tag.is_reserved_zero() {
            return Err(ServiceError::ReservedProtocolTag);
        }

        let slot = &mut self.by_tag[tag.as_u8() as usize];
        if let Some(previous) = slot.take() {
            tracing::warn!(
                %tag,
                previous = previous.name(),
                name = descriptor.name(),
                "protocol re-registered, replacing previous descriptor"
            );
            if self.by_name.get(previous.name()) == Some(&tag) {
                self.by_name.remove(previous.name());
            }
        }

        self.by_name.insert(descriptor.name().to_string(), tag);
        *slot = Some(Rc::new(descriptor));
        self.registration_count += 1;
        Ok(())
    }

    /// Look up a descriptor by tag.
    pub fn get(&self, tag: ProtocolTag) -> Option<Rc<ProtocolDescriptor>> {
        self.by_tag[tag.as_u8() as usize].clone()
    }

    /// Look up a descriptor by name.
    pub fn get_by_name(&self, name: &str) -> Option<Rc<ProtocolDescriptor>> {
        self.by_name.get(name).and_then(|tag| self.get(*tag))
    }

    /// Look up a descriptor by tag or name.
    pub fn lookup(&self, protocol: ProtocolRef<'_>) -> Option<Rc<ProtocolDescriptor>> {
        match protocol {
            ProtocolRef::Tag(tag) => self.get(tag),
            ProtocolRef::Name(name) => self.get_by_name(name),
        }
    }

    /// Like [`lookup`](Self::lookup) but fails with `UnknownProtocol`.
    pub fn require(&self, protocol: ProtocolRef<'_>) -> Result<Rc<ProtocolDescriptor>> {
        self.lookup(protocol)
            .ok_or_else(|| ServiceError::UnknownProtocol(protocol.to_string()))
    }

    /// Swap the dispatch handler of a protocol and return the previous one.
    ///
    /// # Errors
    ///
    /// `UnknownProtocol` if nothing is registered under `protocol`.
    pub fn set_dispatch(
        &mut self,
        protocol: ProtocolRef<'_>,
        dispatch: DispatchFn,
    ) -> Result<Option<DispatchFn>> {
        let current = self.require(protocol)?;
        let previous = current.dispatcher();
        let replaced = current.replace_dispatch(Some(dispatch));
        let index = replaced.tag().as_u8() as usize;
        self.by_tag[index] = Some(Rc::new(replaced));
        Ok(previous)
    }

    /// Number of registered protocols.
    pub fn len(&self) -> usize {
        self.by_tag.iter().filter(|entry| entry.is_some()).count()
    }

    /// Whether no protocol is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total registrations, including replacements.
    pub fn registration_count(&self) -> u64 {
        self.registration_count
    }
}
