//! Default dispatch router: the single entry point for inbound messages.
//!
//! ```text
//!   message ──► registry.get(ptype) ── none ──► UnknownProtocol
//!                    │
//!               session > 0
//!             │yes                 │no
//!             ▼                    ▼
//!      session table         descriptor.dispatch
//!      resume waiter         run in a pooled task
//!      (error ptype fails it)
//! ```

use std::rc::Rc;

use crate::error::{RemoteError, Result, ServiceError};
use crate::protocol::{ProtocolDescriptor, Reply};
use crate::task::Resumed;
use crate::transport::Message;
use crate::types::ProtocolTag;

use super::{system, ServiceContext};

impl ServiceContext {
    /// Route one inbound message.
    ///
    /// Never suspends. Errors are for the transport to log; the next message
    /// is routed normally.
    pub fn dispatch(&self, message: Message) -> Result<()> {
        if self.is_exited() {
            tracing::debug!(service = %self.address(), sender = %message.sender, "message for exited service dropped");
            return Err(ServiceError::ServiceExited(self.address()));
        }

        let Some(descriptor) = self.protocol(message.ptype) else {
            tracing::error!(
                service = %self.address(),
                sender = %message.sender,
                ptype = %message.ptype,
                "message with unknown protocol dropped"
            );
            return Err(ServiceError::UnknownProtocol(message.ptype.to_string()));
        };

        if message.is_response() {
            if message.ptype == ProtocolTag::ERROR {
                return self.route_error(&message);
            }
            return self.route_response(&descriptor, message);
        }

        let Some(handler) = descriptor.dispatcher() else {
            tracing::error!(
                service = %self.address(),
                sender = %message.sender,
                protocol = descriptor.name(),
                "no dispatch handler"
            );
            return Err(ServiceError::DispatchNotImplemented {
                protocol: descriptor.name().to_string(),
            });
        };

        tracing::trace!(
            service = %self.address(),
            sender = %message.sender,
            protocol = descriptor.name(),
            header = %message.header,
            "dispatching"
        );
        self.spawn(handler(self.clone(), message, descriptor.unpacker()))
            .map(|_| ())
    }

    /// An error message carrying a session fails that session's waiter.
    fn route_error(&self, message: &Message) -> Result<()> {
        let session = message.session_id();
        tracing::trace!(service = %self.address(), %session, sender = %message.sender, "routing error response");
        self.resolve_error(session, &system::error_text(message))
    }

    fn route_response(&self, descriptor: &Rc<ProtocolDescriptor>, message: Message) -> Result<()> {
        let session = message.session_id();
        tracing::trace!(service = %self.address(), %session, sender = %message.sender, "routing response");
        self.deliver(session, move || match descriptor.unpack(&message.payload) {
            Some(Ok(values)) => Resumed::Reply(Reply::Values(values)),
            Some(Err(err)) => {
                tracing::warn!(%session, %err, "response payload could not be unpacked");
                Resumed::Failed(RemoteError::new(format!("malformed response: {err}")))
            }
            None => Resumed::Reply(Reply::Raw(message)),
        })
    }
}
