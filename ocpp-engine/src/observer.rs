//! Telemetry hooks for session activity
//!
//! Sessions never log through ambient state; each one is handed an observer
//! at construction and reports its transitions and traffic to it.

use tracing::{debug, info, warn};

use crate::ocpp::messages::{DecodeError, Frame};
use crate::session::SessionState;

/// Receives session lifecycle and traffic events. All methods default to no-ops.
pub trait SessionObserver: Send + Sync {
    fn on_state_change(&self, _identity: &str, _from: SessionState, _to: SessionState) {}

    fn on_frame_received(&self, _identity: &str, _frame: &Frame) {}

    fn on_frame_sent(&self, _identity: &str, _frame: &Frame) {}

    /// An inbound CALL was answered; `reply` is the CALLRESULT or CALLERROR sent back
    fn on_dispatch(&self, _identity: &str, _action: &str, _reply: &Frame) {}

    fn on_decode_error(&self, _identity: &str, _text: &str, _error: &DecodeError) {}

    /// A CALLRESULT/CALLERROR arrived for an id with no pending call
    fn on_stray_reply(&self, _identity: &str, _message_id: &str) {}
}

/// Observer that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Observer that forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_state_change(&self, identity: &str, from: SessionState, to: SessionState) {
        info!("Session {}: {:?} -> {:?}", identity, from, to);
    }

    fn on_frame_received(&self, identity: &str, frame: &Frame) {
        debug!("{} <- {}", identity, frame.encode());
    }

    fn on_frame_sent(&self, identity: &str, frame: &Frame) {
        debug!("{} -> {}", identity, frame.encode());
    }

    fn on_dispatch(&self, identity: &str, action: &str, reply: &Frame) {
        match reply {
            Frame::CallError(err) => warn!(
                "{} from {} answered with {}: {}",
                action, identity, err.error_code, err.error_description
            ),
            _ => info!("{} from {} handled", action, identity),
        }
    }

    fn on_decode_error(&self, identity: &str, text: &str, error: &DecodeError) {
        warn!("Malformed frame from {}: {} ({})", identity, error, text);
    }

    fn on_stray_reply(&self, identity: &str, message_id: &str) {
        warn!("Reply from {} for unknown message id {}", identity, message_id);
    }
}
