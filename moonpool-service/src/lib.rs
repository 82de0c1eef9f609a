//! # moonpool-service
//!
//! Session-correlated RPC and cooperative task scheduling for single-threaded
//! services that talk only through messages.
//!
//! Each service owns a [`ServiceContext`]. Handlers run as pooled tasks that
//! suspend on their own await points (a call, a sleep, an explicit wait) and
//! are resumed when the matching response, timer event, or error arrives.
//!
//! ## Building Blocks
//!
//! - [`ServiceContext`]: sessions, timers, tasks, and the dispatch router
//! - [`ProtocolDescriptor`]: per-protocol codec and fire-and-forget handler
//! - [`Transport`]: the native layer that moves messages and runs timers
//! - [`LocalNode`]: in-process transport hosting many services on one thread
//!
//! ## Wire Sessions
//!
//! [`Message::session`] is signed: requests that expect an answer carry a
//! negative session, responses a positive one, and `0` means no correlation.
//!
//! ## Example
//!
//! ```rust,ignore
//! let node = LocalNode::builder()
//!     .kind("echo", service_init(|ctx, _| async move {
//!         ctx.set_dispatch("lua", dispatch_fn(|ctx, msg, unpack| async move {
//!             let args = unpack.map(|u| u(&msg.payload)).transpose()?.unwrap_or_default();
//!             ctx.respond("lua", msg.sender, msg.reply_session(), args)
//!         }))?;
//!         Ok(())
//!     }))
//!     .build()?;
//! ```

#![deny(missing_docs)]

mod config;
mod error;
mod protocol;
mod service;
mod session;
mod task;
mod timer;
mod transport;
mod types;

// Service exports
pub use service::{ReplyFuture, ServiceContext, ServiceStats, ShutdownHook, SERVICE_EXIT};

// Configuration and errors
pub use config::ServiceConfig;
pub use error::{RemoteError, Result, ServiceError};

// Protocol exports
pub use protocol::{
    builtin, dispatch_fn, DispatchFn, LocalBoxFuture, PackFn, ProtocolDescriptor, ProtocolRef,
    ProtocolRegistry, Reply, UnpackFn, Values,
};

// Task exports
pub use task::{SuspendTrace, TaskHandle};

// Transport exports
pub use transport::{
    service_init, LocalNode, LocalNodeBuilder, Message, ServiceInit, Transport, DEAD_SERVICE,
};

// Core type exports
pub use types::{Address, ProtocolTag, SessionId, TimerId, SESSION_ID_MAX, TIMER_ID_MAX};
