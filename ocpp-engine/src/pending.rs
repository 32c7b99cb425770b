//! Correlation of outbound CALLs with their replies
//!
//! Every CALL a session sends is registered here under its message id. The
//! read loop completes the entry when the matching CALLRESULT or CALLERROR
//! arrives; session teardown completes every remaining entry with a
//! cancellation so no caller waits forever.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::OcppError;
use crate::ocpp::messages::ErrorCode;

/// What a waiting caller receives
pub type CallOutcome = Result<Value, OcppError>;

/// Outbound CALL awaiting its reply
struct PendingCall {
    action: String,
    created_at: DateTime<Utc>,
    slot: oneshot::Sender<CallOutcome>,
}

/// Snapshot of an outstanding call, for diagnostics
#[derive(Debug, Clone)]
pub struct PendingCallInfo {
    pub message_id: String,
    pub action: String,
    pub created_at: DateTime<Utc>,
}

/// Handle the caller awaits until the call completes
#[derive(Debug)]
pub struct CompletionSlot {
    rx: oneshot::Receiver<CallOutcome>,
}

impl CompletionSlot {
    pub async fn wait(self) -> CallOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(OcppError::Cancelled("pending call dropped".to_string())))
    }
}

#[derive(Default)]
struct TrackerState {
    calls: HashMap<String, PendingCall>,
    /// Set by `cancel_all`; no registrations afterwards
    closed: Option<String>,
}

/// Per-session table of outstanding calls
#[derive(Default)]
pub struct PendingCalls {
    state: Mutex<TrackerState>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new outbound call and hand back the slot to await
    pub fn register(&self, message_id: &str, action: &str) -> Result<CompletionSlot, OcppError> {
        let mut state = self.state.lock();

        if state.closed.is_some() {
            return Err(OcppError::ConnectionClosed);
        }
        if state.calls.contains_key(message_id) {
            return Err(OcppError::DuplicateMessageId(message_id.to_string()));
        }

        let (slot, rx) = oneshot::channel();
        state.calls.insert(
            message_id.to_string(),
            PendingCall {
                action: action.to_string(),
                created_at: Utc::now(),
                slot,
            },
        );

        Ok(CompletionSlot { rx })
    }

    /// Complete a call with its CALLRESULT payload. False if no such call.
    pub fn resolve(&self, message_id: &str, payload: Value) -> bool {
        self.complete(message_id, Ok(payload))
    }

    /// Complete a call with the peer's CALLERROR. False if no such call.
    pub fn reject(
        &self,
        message_id: &str,
        code: ErrorCode,
        description: impl Into<String>,
        details: Value,
    ) -> bool {
        self.complete(
            message_id,
            Err(OcppError::RemoteError {
                code,
                description: description.into(),
                details,
            }),
        )
    }

    fn complete(&self, message_id: &str, outcome: CallOutcome) -> bool {
        let Some(call) = self.state.lock().calls.remove(message_id) else {
            debug!("No pending call for message id {}", message_id);
            return false;
        };

        debug!(
            "Completing {} ({}) after {} ms",
            call.action,
            message_id,
            (Utc::now() - call.created_at).num_milliseconds()
        );
        // The caller may have stopped waiting; nothing to do then
        let _ = call.slot.send(outcome);
        true
    }

    /// Fail every outstanding call and refuse new ones. Returns how many were failed.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let calls: Vec<(String, PendingCall)> = {
            let mut state = self.state.lock();
            state.closed.get_or_insert_with(|| reason.to_string());
            state.calls.drain().collect()
        };

        let count = calls.len();
        for (message_id, call) in calls {
            debug!("Cancelling {} ({}): {}", call.action, message_id, reason);
            let _ = call.slot.send(Err(OcppError::Cancelled(reason.to_string())));
        }
        count
    }

    /// Drop a call the caller no longer waits for
    pub fn forget(&self, message_id: &str) -> bool {
        self.state.lock().calls.remove(message_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    pub fn outstanding(&self) -> Vec<PendingCallInfo> {
        let state = self.state.lock();
        let mut calls: Vec<PendingCallInfo> = state
            .calls
            .iter()
            .map(|(message_id, call)| PendingCallInfo {
                message_id: message_id.clone(),
                action: call.action.clone(),
                created_at: call.created_at,
            })
            .collect();
        calls.sort_by_key(|c| c.created_at);
        calls
    }
}

/// Removes its call from the tracker when dropped, so a caller that gives up
/// (timeout, task abort) leaves nothing behind
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    message_id: &'a str,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(pending: &'a PendingCalls, message_id: &'a str) -> Self {
        Self {
            pending,
            message_id,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.forget(self.message_id);
    }
}
