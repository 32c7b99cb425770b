//! One connection's full duplex lifecycle
//!
//! ```text
//! Connecting ──open()──► Open ──close()/peer gone──► Closing ──► Closed
//!      └──────── subprotocol mismatch ──────────────────┘
//! ```
//!
//! While `Open`, [`Session::run`] reads frames one at a time: CALLs are
//! dispatched inline (strict arrival order) and answered, replies complete
//! pending calls. Any number of tasks may issue [`Session::call`] at the same
//! time. Tasks started with [`Session::spawn_task`] share the session's
//! lifetime and are cancelled when it closes.
//!
//! Handlers run inside the read loop, so a handler must not await a call on
//! its own session; it should hand that work to `spawn_task`.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::dispatcher::Dispatcher;
use crate::error::OcppError;
use crate::observer::{SessionObserver, TracingObserver};
use crate::ocpp::messages::{Call, Frame};
use crate::pending::{PendingCalls, PendingGuard};
use crate::transport::Transport;

/// Bound on the closing handshake so teardown cannot hang on a dead peer
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, handshake checks pending
    Connecting,
    /// Frames flowing both ways
    Open,
    /// Teardown in progress
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    fn can_move_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Connecting, Open) | (Connecting, Closing) | (Open, Closing) | (Closing, Closed)
        )
    }
}

/// Builder for a [`Session`]
pub struct SessionBuilder {
    identity: String,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    observer: Arc<dyn SessionObserver>,
    config: SessionConfig,
}

impl SessionBuilder {
    /// Set the inbound action handlers
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Set the telemetry hook
    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<Session> {
        let (state, _) = watch::channel(SessionState::Connecting);

        Arc::new_cyclic(|this| Session {
            this: this.clone(),
            identity: self.identity,
            session_id: Uuid::new_v4().to_string(),
            transport: self.transport,
            pending: PendingCalls::new(),
            dispatcher: self.dispatcher,
            observer: self.observer,
            config: self.config,
            state,
            scope: CancellationToken::new(),
        })
    }
}

/// A live connection to one peer
pub struct Session {
    this: Weak<Session>,
    identity: String,
    /// Distinguishes this connection from a later one with the same identity
    session_id: String,
    transport: Arc<dyn Transport>,
    pending: PendingCalls,
    dispatcher: Dispatcher,
    observer: Arc<dyn SessionObserver>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    /// Parent scope of the read loop and every spawned child task
    scope: CancellationToken,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Session {
    /// Start building a session for `identity` over `transport`
    pub fn builder(identity: impl Into<String>, transport: Arc<dyn Transport>) -> SessionBuilder {
        SessionBuilder {
            identity: identity.into(),
            transport,
            dispatcher: Dispatcher::new(),
            observer: Arc::new(TracingObserver),
            config: SessionConfig::default(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Outstanding outbound calls
    pub fn pending_calls(&self) -> &PendingCalls {
        &self.pending
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn transition(&self, to: SessionState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if state.can_move_to(to) {
                from = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });

        match from {
            Some(from) => {
                self.observer.on_state_change(&self.identity, from, to);
                true
            }
            None => false,
        }
    }

    /// Leave `Connecting` once the handshake agreed on `negotiated`.
    ///
    /// Without an acceptable subprotocol the session goes straight to
    /// teardown and never exchanges a frame.
    pub async fn open(&self, negotiated: Option<&str>) -> Result<(), OcppError> {
        let accepted = negotiated
            .map(|p| self.config.subprotocols.iter().any(|s| s == p))
            .unwrap_or(false);

        if !accepted {
            warn!(
                "Protocols mismatched for {}: expected one of {:?}, got {:?}. Closing connection",
                self.identity, self.config.subprotocols, negotiated
            );
            self.close("subprotocol mismatch").await;
            return Err(OcppError::SubprotocolMismatch {
                requested: negotiated.map(str::to_string),
                supported: self.config.subprotocols.clone(),
            });
        }

        if !self.transition(SessionState::Open) {
            return Err(OcppError::ConnectionClosed);
        }
        Ok(())
    }

    /// Spawn the read loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<(), OcppError>> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Read loop: runs until the transport closes or the session is closed.
    ///
    /// Returns `Ok` for an orderly closure and the transport error otherwise;
    /// the session is `Closed` either way.
    pub async fn run(self: Arc<Self>) -> Result<(), OcppError> {
        if !self.is_open() {
            return Err(OcppError::ConnectionClosed);
        }

        let outcome = loop {
            let received = tokio::select! {
                _ = self.scope.cancelled() => break Ok(()),
                received = self.transport.receive() => received,
            };

            match received {
                Ok(text) => {
                    tokio::select! {
                        _ = self.scope.cancelled() => break Ok(()),
                        _ = self.handle_text(&text) => {}
                    }
                }
                Err(OcppError::ConnectionClosed) => {
                    info!("Charging station {} disconnected", self.identity);
                    break Ok(());
                }
                Err(e) => {
                    warn!("Transport error on {}: {}", self.identity, e);
                    break Err(e);
                }
            }
        };

        self.close("connection closed").await;
        outcome
    }

    async fn handle_text(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                self.observer.on_decode_error(&self.identity, text, &err);
                if let Some(reply) = err.to_reply() {
                    if let Err(e) = self.send_frame(&reply.into()).await {
                        debug!("Could not answer malformed frame from {}: {}", self.identity, e);
                    }
                }
                return;
            }
        };

        self.observer.on_frame_received(&self.identity, &frame);

        match frame {
            Frame::Call(call) => {
                let action = call.action.clone();
                let reply = self.dispatcher.dispatch(&self.identity, call).await;
                self.observer.on_dispatch(&self.identity, &action, &reply);

                if let Err(e) = self.send_frame(&reply).await {
                    warn!("Failed to answer {} from {}: {}", action, self.identity, e);
                }
            }
            Frame::CallResult(result) => {
                if !self.pending.resolve(&result.message_id, result.payload) {
                    self.observer.on_stray_reply(&self.identity, &result.message_id);
                }
            }
            Frame::CallError(error) => {
                if !self.pending.reject(
                    &error.message_id,
                    error.error_code,
                    error.error_description,
                    error.error_details,
                ) {
                    self.observer.on_stray_reply(&self.identity, &error.message_id);
                }
            }
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), OcppError> {
        self.transport.send(frame.encode()).await?;
        self.observer.on_frame_sent(&self.identity, frame);
        Ok(())
    }

    /// Send a CALL and wait for its reply payload.
    ///
    /// Fails with `RemoteError` on a CALLERROR, `Timeout` after the configured
    /// call timeout, and `Cancelled`/`ConnectionClosed` when the session
    /// closes first.
    pub async fn call(
        &self,
        action: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Value, OcppError> {
        if !self.is_open() {
            return Err(OcppError::ConnectionClosed);
        }

        let call = Call::new(action, payload)?;
        let message_id = call.message_id.clone();
        let slot = self.pending.register(&message_id, &call.action)?;
        let _guard = PendingGuard::new(&self.pending, &message_id);

        let action = call.action.clone();
        self.send_frame(&Frame::Call(call)).await?;

        match tokio::time::timeout(self.config.call_timeout, slot.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "{} to {} ({}) timed out after {:?}",
                    action, self.identity, message_id, self.config.call_timeout
                );
                Err(OcppError::Timeout)
            }
        }
    }

    /// [`Session::call`] with typed request and response payloads
    pub async fn call_typed<Req, Resp>(
        &self,
        action: impl Into<String>,
        request: &Req,
    ) -> Result<Resp, OcppError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = self.call(action, request).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Run `task` as a child of this session: it is cancelled when the
    /// session closes, or immediately if it already has.
    pub fn spawn_task<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scope = self.scope.clone();
        let identity = self.identity.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => debug!("{} task for {} cancelled", name, identity),
                _ = task => debug!("{} task for {} finished", name, identity),
            }
        })
    }

    /// Tear the session down. Idempotent; later callers wait for `Closed`.
    pub async fn close(&self, reason: &str) {
        if !self.transition(SessionState::Closing) {
            self.closed().await;
            return;
        }

        self.scope.cancel();

        let cancelled = self.pending.cancel_all(reason);
        if cancelled > 0 {
            info!(
                "Session {}: failed {} pending call(s): {}",
                self.identity, cancelled, reason
            );
        }

        // The caller may be a child task the scope just cancelled, so the
        // rest of the teardown must not depend on this future being polled
        match self.this.upgrade() {
            Some(session) => {
                let _ = tokio::spawn(async move { session.finish_close().await }).await;
            }
            None => self.finish_close().await,
        }
    }

    async fn finish_close(&self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing transport for {}: {}", self.identity, e),
            Err(_) => warn!("Closing transport for {} timed out", self.identity),
        }

        self.transition(SessionState::Closed);
    }

    /// Resolves once the session reaches `Closed`
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::handler_fn;
    use crate::ocpp::messages::{CallError, CallResult, ErrorCode};
    use crate::transport::ChannelTransport;
    use async_trait::async_trait;
    use serde_json::json;

    /// Session over one end of a channel pair; the test drives the other end
    async fn open_session(dispatcher: Dispatcher) -> (Arc<Session>, ChannelTransport) {
        let (local, peer) = ChannelTransport::pair();
        let session = Session::builder("CP_1", Arc::new(local))
            .dispatcher(dispatcher)
            .build();
        session.open(Some("ocpp2.0.1")).await.unwrap();
        (session, peer)
    }

    async fn next_frame(peer: &ChannelTransport) -> Frame {
        Frame::decode(&peer.receive().await.unwrap()).unwrap()
    }

    fn echo_dispatcher() -> Dispatcher {
        Dispatcher::new().on(
            "Echo",
            handler_fn(|_ctx, payload| async move { Ok::<_, OcppError>(payload) }),
        )
    }

    #[tokio::test]
    async fn test_subprotocol_mismatch_never_opens() {
        let (local, peer) = ChannelTransport::pair();
        let session = Session::builder("CP_1", Arc::new(local)).build();

        let err = session.open(Some("ocpp1.6")).await.unwrap_err();
        assert!(matches!(err, OcppError::SubprotocolMismatch { .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(peer.is_closed());

        let err = session.clone().run().await.unwrap_err();
        assert!(matches!(err, OcppError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_missing_subprotocol_refused() {
        let (local, _peer) = ChannelTransport::pair();
        let session = Session::builder("CP_1", Arc::new(local)).build();

        assert!(session.open(None).await.is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_inbound_calls_answered_in_order() {
        let (session, peer) = open_session(echo_dispatcher()).await;
        let reader = session.start();

        peer.send(r#"[2,"a","Echo",{"n":1}]"#.to_string()).await.unwrap();
        peer.send(r#"[2,"b","Unknown",{}]"#.to_string()).await.unwrap();
        peer.send(r#"[2,"c","Echo",{"n":3}]"#.to_string()).await.unwrap();

        assert_eq!(
            next_frame(&peer).await,
            Frame::CallResult(CallResult {
                message_id: "a".to_string(),
                payload: json!({"n": 1}),
            })
        );
        match next_frame(&peer).await {
            Frame::CallError(err) => {
                assert_eq!(err.message_id, "b");
                assert_eq!(err.error_code, ErrorCode::NotImplemented);
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
        assert_eq!(next_frame(&peer).await.message_id(), "c");

        peer.close().await.unwrap();
        reader.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_frame_answered_and_session_survives() {
        let (session, peer) = open_session(echo_dispatcher()).await;
        let _reader = session.start();

        peer.send("garbage".to_string()).await.unwrap();
        peer.send(r#"[2,"x","Echo"]"#.to_string()).await.unwrap();
        peer.send(r#"[2,"y","Echo",{}]"#.to_string()).await.unwrap();

        // Unanswerable garbage is dropped; the short CALL gets a CALLERROR
        match next_frame(&peer).await {
            Frame::CallError(err) => {
                assert_eq!(err.message_id, "x");
                assert_eq!(err.error_code, ErrorCode::FormatViolation);
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
        assert!(matches!(next_frame(&peer).await, Frame::CallResult(r) if r.message_id == "y"));
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_outbound_call_correlates_out_of_order_replies() {
        let (session, peer) = open_session(Dispatcher::new()).await;
        let _reader = session.start();

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.call("Authorize", json!({"n": 1})).await })
        };
        let first_id = next_frame(&peer).await.message_id().to_string();

        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.call("Authorize", json!({"n": 2})).await })
        };
        let second_id = next_frame(&peer).await.message_id().to_string();

        // Answer in reverse order
        let reply = Frame::CallResult(CallResult {
            message_id: second_id,
            payload: json!({"for": 2}),
        });
        peer.send(reply.encode()).await.unwrap();
        let reply = Frame::CallError(CallError::new(first_id, ErrorCode::SecurityError, "denied"));
        peer.send(reply.encode()).await.unwrap();

        assert_eq!(second.await.unwrap().unwrap(), json!({"for": 2}));
        match first.await.unwrap() {
            Err(OcppError::RemoteError { code, .. }) => assert_eq!(code, ErrorCode::SecurityError),
            other => panic!("Expected RemoteError, got {:?}", other),
        }
        assert!(session.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn test_stray_reply_is_ignored() {
        let (session, peer) = open_session(echo_dispatcher()).await;
        let _reader = session.start();

        peer.send(r#"[3,"nobody","{}"]"#.to_string()).await.unwrap();
        peer.send(r#"[2,"z","Echo",{}]"#.to_string()).await.unwrap();

        assert_eq!(next_frame(&peer).await.message_id(), "z");
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_calls() {
        let (session, peer) = open_session(Dispatcher::new()).await;
        let _reader = session.start();

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.call("Heartbeat", json!({})).await })
            })
            .collect();
        for _ in 0..3 {
            next_frame(&peer).await;
        }
        assert_eq!(session.pending_calls().len(), 3);

        peer.close().await.unwrap();

        for caller in callers {
            let outcome = caller.await.unwrap();
            assert!(outcome.unwrap_err().is_closed());
        }
        session.closed().await;
        assert!(session.pending_calls().is_empty());
        assert!(matches!(
            session.call("Heartbeat", json!({})).await,
            Err(OcppError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _peer) = open_session(Dispatcher::new()).await;

        session.close("operator").await;
        session.close("operator").await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let (local, peer) = ChannelTransport::pair();
        let session = Session::builder("CP_1", Arc::new(local))
            .config(SessionConfig::default().with_call_timeout(Duration::from_secs(2)))
            .build();
        session.open(Some("ocpp2.0.1")).await.unwrap();

        let outcome = session.call("Heartbeat", json!({})).await;
        assert!(matches!(outcome, Err(OcppError::Timeout)));
        assert!(session.pending_calls().is_empty());
        drop(peer);
    }

    #[tokio::test]
    async fn test_children_cancelled_on_close() {
        let (session, _peer) = open_session(Dispatcher::new()).await;

        let child = session.spawn_task("forever", std::future::pending::<()>());
        session.close("done").await;

        // Child finishes because its scope was cancelled, not aborted
        child.await.unwrap();
    }

    #[tokio::test]
    async fn test_aborted_caller_leaves_no_pending_entry() {
        let (session, peer) = open_session(Dispatcher::new()).await;
        let _reader = session.start();

        let caller = {
            let session = session.clone();
            tokio::spawn(async move { session.call("Heartbeat", json!({})).await })
        };
        next_frame(&peer).await;
        assert_eq!(session.pending_calls().len(), 1);

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert!(session.pending_calls().is_empty());
    }

    #[derive(Default)]
    struct Recorder {
        transitions: parking_lot::Mutex<Vec<(SessionState, SessionState)>>,
    }

    impl SessionObserver for Recorder {
        fn on_state_change(&self, _identity: &str, from: SessionState, to: SessionState) {
            self.transitions.lock().push((from, to));
        }
    }

    #[tokio::test]
    async fn test_observer_sees_every_transition() {
        let recorder = Arc::new(Recorder::default());
        let (local, peer) = ChannelTransport::pair();
        let session = Session::builder("CP_1", Arc::new(local))
            .observer(recorder.clone())
            .build();
        session.open(Some("ocpp2.0.1")).await.unwrap();
        let reader = session.start();

        peer.close().await.unwrap();
        reader.await.unwrap().unwrap();

        assert_eq!(
            *recorder.transitions.lock(),
            vec![
                (SessionState::Connecting, SessionState::Open),
                (SessionState::Open, SessionState::Closing),
                (SessionState::Closing, SessionState::Closed),
            ]
        );
    }

    /// Channel transport whose close has to wait before it completes
    struct SlowClose(ChannelTransport);

    #[async_trait]
    impl Transport for SlowClose {
        async fn send(&self, text: String) -> Result<(), OcppError> {
            self.0.send(text).await
        }

        async fn receive(&self) -> Result<String, OcppError> {
            self.0.receive().await
        }

        async fn close(&self) -> Result<(), OcppError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_child_task_can_close_its_session() {
        let (local, peer) = ChannelTransport::pair();
        let session = Session::builder("CP_1", Arc::new(SlowClose(local))).build();
        session.open(Some("ocpp2.0.1")).await.unwrap();

        let child = Arc::clone(&session);
        session.spawn_task("closer", async move { child.close("closed by child").await });

        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .expect("session stuck in Closing");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(peer.is_closed());
    }
}
