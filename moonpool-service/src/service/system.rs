//! Handlers for the reserved protocols and the system/debug command tables.

use serde_json::{json, Value};

use crate::error::Result;
use crate::protocol::{builtin, dispatch_fn, DispatchFn, UnpackFn};
use crate::transport::Message;
use crate::types::ProtocolTag;

use super::ServiceContext;

/// System command: a watched service exited.
pub const SERVICE_EXIT: &str = "_service_exit";

const DEFAULT_EXIT_REASON: &str = "service exited";

/// Register every built-in protocol with its handler.
pub(super) fn install(ctx: &ServiceContext) -> Result<()> {
    for descriptor in builtin::descriptors() {
        let descriptor = match handler_for(descriptor.tag()) {
            Some(handler) => descriptor.with_dispatch(handler),
            None => descriptor,
        };
        ctx.register_protocol(descriptor)?;
    }
    Ok(())
}

fn handler_for(tag: ProtocolTag) -> Option<DispatchFn> {
    let handler = match tag {
        ProtocolTag::SYSTEM => dispatch_fn(|ctx, msg, _| async move { system_command(&ctx, &msg) }),
        ProtocolTag::DEBUG => {
            dispatch_fn(|ctx, msg, unpack| async move { debug_command(&ctx, &msg, unpack) })
        }
        ProtocolTag::ERROR => dispatch_fn(|ctx, msg, _| async move { remote_error(&ctx, &msg) }),
        ProtocolTag::SHUTDOWN => dispatch_fn(|ctx, _, _| async move { ctx.handle_shutdown().await }),
        ProtocolTag::TIMER => {
            dispatch_fn(|ctx, msg, _| async move { ctx.fire_timer(msg.timer_id()) })
        }
        _ => return None,
    };
    Some(handler)
}

fn system_command(ctx: &ServiceContext, msg: &Message) -> Result<()> {
    match msg.header.as_str() {
        SERVICE_EXIT => {
            let text = msg.payload_text();
            let reason = if text.is_empty() {
                DEFAULT_EXIT_REASON
            } else {
                text.as_ref()
            };
            ctx.on_watcher_terminated(msg.sender, reason)
        }
        other => {
            tracing::debug!(service = %ctx.address(), command = other, "unknown system command ignored");
            Ok(())
        }
    }
}

/// The first argument names the command.
fn debug_command(ctx: &ServiceContext, msg: &Message, unpack: Option<UnpackFn>) -> Result<()> {
    let args = match unpack {
        Some(unpack) => unpack(&msg.payload)?,
        None => Vec::new(),
    };
    let command = args.first().and_then(Value::as_str).unwrap_or_default();

    let answer = match command {
        "ping" => json!("pong"),
        "state" => serde_json::to_value(ctx.stats())?,
        "mem" => ctx.table_sizes(),
        "gc" => {
            let (sessions, timers) = ctx.purge_tombstones();
            json!({ "sessions": sessions, "timers": timers })
        }
        other => json!(format!("unknown debug command '{other}'")),
    };
    ctx.respond(ProtocolTag::DEBUG, msg.sender, msg.reply_session(), vec![answer])
}

/// Error messages that carry a session are resolved by the router. Only
/// uncorrelated ones reach this handler.
fn remote_error(ctx: &ServiceContext, msg: &Message) -> Result<()> {
    tracing::warn!(service = %ctx.address(), sender = %msg.sender, error = %error_text(msg), "error message without session");
    Ok(())
}

/// Header is the message. A non-empty payload is appended after a colon.
pub(super) fn error_text(msg: &Message) -> String {
    let text = msg.payload_text();
    if text.is_empty() {
        msg.header.clone()
    } else {
        format!("{}: {}", msg.header, text)
    }
}
