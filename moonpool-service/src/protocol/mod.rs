//! Protocol descriptors and the registry that routes by protocol tag.
//!
//! A protocol says how values are packed into a payload, how a payload is
//! unpacked back into values, and which handler runs for messages that are
//! not responses to a pending call.

pub mod builtin;
pub mod registry;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use serde_json::Value;

use crate::error::{Result, ServiceError};
use crate::service::ServiceContext;
use crate::transport::Message;
use crate::types::ProtocolTag;

pub use registry::ProtocolRegistry;

/// Dynamic argument list carried by a message.
pub type Values = Vec<Value>;

/// Boxed local future, the return type of dispatch handlers.
pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// Packs values into a payload.
pub type PackFn = Rc<dyn Fn(&[Value]) -> Result<Vec<u8>>>;

/// Unpacks a payload into values.
pub type UnpackFn = Rc<dyn Fn(&[u8]) -> Result<Values>>;

/// Handles one fire-and-forget message. Runs inside a pooled task, so it may
/// await calls and timers.
pub type DispatchFn =
    Rc<dyn Fn(ServiceContext, Message, Option<UnpackFn>) -> LocalBoxFuture<Result<()>>>;

/// Wrap an async closure into a [`DispatchFn`].
///
/// # Example
///
/// ```rust,ignore
/// ctx.set_dispatch("lua", dispatch_fn(|ctx, msg, unpack| async move {
///     let args = unpack.map(|u| u(&msg.payload)).transpose()?.unwrap_or_default();
///     ctx.respond("lua", msg.sender, msg.session, vec![json!("pong")])
/// }))?;
/// ```
pub fn dispatch_fn<F, Fut>(handler: F) -> DispatchFn
where
    F: Fn(ServiceContext, Message, Option<UnpackFn>) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Rc::new(
        move |ctx: ServiceContext,
              message: Message,
              unpack: Option<UnpackFn>|
              -> LocalBoxFuture<Result<()>> { Box::pin(handler(ctx, message, unpack)) },
    )
}

/// What a resumed call yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Payload unpacked by the protocol.
    Values(Values),
    /// The raw message, for protocols without an unpacker.
    Raw(Message),
}

impl Reply {
    /// Unpacked values, empty for a raw reply.
    pub fn values(&self) -> &[Value] {
        match self {
            Reply::Values(values) => values,
            Reply::Raw(_) => &[],
        }
    }

    /// Take the unpacked values, empty for a raw reply.
    pub fn into_values(self) -> Values {
        match self {
            Reply::Values(values) => values,
            Reply::Raw(_) => Vec::new(),
        }
    }

    /// First unpacked value.
    pub fn first(&self) -> Option<&Value> {
        self.values().first()
    }

    /// The raw message, if the protocol had no unpacker.
    pub fn as_raw(&self) -> Option<&Message> {
        match self {
            Reply::Raw(message) => Some(message),
            Reply::Values(_) => None,
        }
    }
}

/// Protocol reference by tag or by registered name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolRef<'a> {
    /// Numeric tag.
    Tag(ProtocolTag),
    /// Registered name.
    Name(&'a str),
}

impl From<ProtocolTag> for ProtocolRef<'_> {
    fn from(tag: ProtocolTag) -> Self {
        ProtocolRef::Tag(tag)
    }
}

impl<'a> From<&'a str> for ProtocolRef<'a> {
    fn from(name: &'a str) -> Self {
        ProtocolRef::Name(name)
    }
}

impl fmt::Display for ProtocolRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolRef::Tag(tag) => write!(f, "tag {tag}"),
            ProtocolRef::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// Immutable protocol record.
///
/// Registered once per tag at service start. Swapping the dispatch handler
/// through [`ProtocolRegistry::set_dispatch`] replaces the record rather
/// than mutating it.
#[derive(Clone)]
pub struct ProtocolDescriptor {
    tag: ProtocolTag,
    name: String,
    pack: Option<PackFn>,
    unpack: Option<UnpackFn>,
    dispatch: Option<DispatchFn>,
}

impl ProtocolDescriptor {
    /// Create a descriptor with no codec and no handler.
    pub fn new(tag: ProtocolTag, name: impl Into<String>) -> Self {
        Self {
            tag,
            name: name.into(),
            pack: None,
            unpack: None,
            dispatch: None,
        }
    }

    /// Set the packer.
    pub fn with_pack(mut self, pack: PackFn) -> Self {
        self.pack = Some(pack);
        self
    }

    /// Set the unpacker.
    pub fn with_unpack(mut self, unpack: UnpackFn) -> Self {
        self.unpack = Some(unpack);
        self
    }

    /// Set the fire-and-forget handler.
    pub fn with_dispatch(mut self, dispatch: DispatchFn) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Protocol tag.
    pub fn tag(&self) -> ProtocolTag {
        self.tag
    }

    /// Protocol name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unpacker, if any.
    pub fn unpacker(&self) -> Option<UnpackFn> {
        self.unpack.clone()
    }

    /// The dispatch handler, if any.
    pub fn dispatcher(&self) -> Option<DispatchFn> {
        self.dispatch.clone()
    }

    /// Pack values into a payload.
    ///
    /// # Errors
    ///
    /// `Codec` if the protocol has no packer or packing fails.
    pub fn pack(&self, values: &[Value]) -> Result<Vec<u8>> {
        match &self.pack {
            Some(pack) => pack(values),
            None => Err(ServiceError::Codec(format!(
                "protocol '{}' cannot pack values",
                self.name
            ))),
        }
    }

    /// Unpack a payload, `None` if the protocol has no unpacker.
    pub fn unpack(&self, payload: &[u8]) -> Option<Result<Values>> {
        self.unpack.as_ref().map(|unpack| unpack(payload))
    }

    pub(crate) fn replace_dispatch(&self, dispatch: Option<DispatchFn>) -> Self {
        Self {
            dispatch,
            ..self.clone()
        }
    }
}

impl fmt::Debug for ProtocolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolDescriptor")
            .field("tag", &self.tag)
            .field("name", &self.name)
            .field("pack", &self.pack.is_some())
            .field("unpack", &self.unpack.is_some())
            .field("dispatch", &self.dispatch.is_some())
            .finish()
    }
}
