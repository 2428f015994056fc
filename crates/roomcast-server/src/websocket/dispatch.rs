//! Inbound frame → middleware chain → event bus.

use metrics::counter;
use roomcast_core::Frame;
use serde_json::Value;
use tracing::{debug, warn};

use super::SessionContext;
use crate::handle::ConnectionHandle;
use crate::metrics::{WS_FRAMES_RECEIVED_TOTAL, WS_FRAMES_REJECTED_TOTAL};
use crate::middleware::{ChainOutcome, MiddlewareContext};

/// Payload every listener receives: the sending connection and the event
/// arguments after middleware.
pub type ServerEvent = (ConnectionHandle, Vec<Value>);

/// Event emitted once per accepted connection.
///
/// The single argument is `{"path": ..., "headers": {name: value}}` taken
/// from the upgrade request.
pub const ON_CONNECT_EVENT: &str = "onConnect";

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The event was emitted to this many listeners.
    Dispatched {
        /// Listeners invoked.
        listeners: usize,
    },
    /// A middleware halted the chain and halted chains do not emit.
    Suppressed,
    /// A middleware failed; nothing was emitted.
    Failed,
    /// The text was not a valid frame.
    Rejected,
}

/// Decode `text` and run it through the middleware chain and event bus.
pub async fn dispatch_text(
    text: &str,
    handle: &ConnectionHandle,
    ctx: &SessionContext,
) -> DispatchOutcome {
    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(error) => {
            counter!(WS_FRAMES_REJECTED_TOTAL).increment(1);
            warn!(client_id = %handle.id(), %error, len = text.len(), "malformed frame ignored");
            return DispatchOutcome::Rejected;
        }
    };
    counter!(WS_FRAMES_RECEIVED_TOTAL).increment(1);
    dispatch_frame(frame, handle, ctx).await
}

/// Run an already-decoded frame through the middleware chain and event bus.
pub async fn dispatch_frame(
    frame: Frame,
    handle: &ConnectionHandle,
    ctx: &SessionContext,
) -> DispatchOutcome {
    let Frame { event, args } = frame;
    debug!(client_id = %handle.id(), event, args = args.len(), "frame received");

    let mut mw_ctx = MiddlewareContext::new(event, handle.clone(), args);
    match ctx.middleware.execute(&mut mw_ctx).await {
        ChainOutcome::Completed => {}
        ChainOutcome::Halted { at } => {
            if !ctx.options.dispatch_on_halt {
                debug!(event = mw_ctx.event(), at, "halted chain, emit suppressed");
                return DispatchOutcome::Suppressed;
            }
        }
        ChainOutcome::Failed { .. } => return DispatchOutcome::Failed,
    }

    let event = mw_ctx.event().to_owned();
    let listeners = ctx.events.emit(&event, (handle.clone(), mw_ctx.into_args()));
    if listeners == 0 {
        debug!(event, "no listeners for event");
    }
    DispatchOutcome::Dispatched { listeners }
}
