//! Routing of inbound CALLs to action handlers
//!
//! A [`Dispatcher`] is an explicit map from action name to handler, built
//! before the session starts. [`Dispatcher::dispatch`] always produces
//! exactly one reply frame per CALL: the handler's CALLRESULT, or a
//! CALLERROR when no handler exists, the handler fails, or it panics.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::error::OcppError;
use crate::ocpp::messages::{Call, CallError, CallResult, ErrorCode, Frame};

/// Description sent to the peer when a handler fails unexpectedly;
/// the real cause only goes to the log
const INTERNAL_ERROR_DESCRIPTION: &str = "An unexpected error occurred";

/// What a handler knows about the CALL it is serving
#[derive(Debug, Clone)]
pub struct CallContext {
    pub identity: String,
    pub message_id: String,
    pub action: String,
}

/// Handles one action: structured payload in, structured payload out
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value, OcppError>;
}

/// Handler built from an async closure over raw JSON
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f(ctx, payload)` as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CallContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, OcppError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(CallContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, OcppError>> + Send,
{
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value, OcppError> {
        (self.f)(ctx.clone(), payload).await
    }
}

/// Handler that deserializes the request and serializes the response
pub struct TypedHandler<Req, Resp, F> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

/// Wrap `f(ctx, request)` as a handler over typed payloads.
///
/// A payload that does not deserialize into `Req` is answered with
/// `FormatViolation` before `f` runs.
pub fn typed<Req, Resp, F, Fut>(f: F) -> TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, OcppError>> + Send,
{
    TypedHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<Req, Resp, F, Fut> ActionHandler for TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, OcppError>> + Send,
{
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value, OcppError> {
        let request: Req = serde_json::from_value(payload)?;
        let response = (self.f)(ctx.clone(), request).await?;
        Ok(serde_json::to_value(response)?)
    }
}

/// Action name -> handler table
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `action`, replacing any previous binding
    pub fn register_handler(
        &mut self,
        action: impl Into<String>,
        handler: impl ActionHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(action.into(), Arc::new(handler));
        self
    }

    /// Builder form of [`Dispatcher::register_handler`]
    pub fn on(mut self, action: impl Into<String>, handler: impl ActionHandler + 'static) -> Self {
        self.register_handler(action, handler);
        self
    }

    pub fn has_handler(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    /// Run the handler for `call` and build its reply
    pub async fn dispatch(&self, identity: &str, call: Call) -> Frame {
        let Call {
            message_id,
            action,
            payload,
        } = call;

        let Some(handler) = self.handlers.get(&action) else {
            return CallError::new(
                message_id,
                ErrorCode::NotImplemented,
                format!("No handler for {}", action),
            )
            .into();
        };

        let ctx = CallContext {
            identity: identity.to_string(),
            message_id,
            action,
        };

        let outcome = AssertUnwindSafe(handler.handle(&ctx, payload))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(payload)) => CallResult {
                message_id: ctx.message_id,
                payload,
            }
            .into(),
            Ok(Err(err)) => failure_reply(&ctx, err).into(),
            Err(panic) => {
                error!(
                    "Handler for {} from {} panicked: {}",
                    ctx.action,
                    ctx.identity,
                    panic_message(panic.as_ref())
                );
                CallError::new(ctx.message_id, ErrorCode::InternalError, INTERNAL_ERROR_DESCRIPTION)
                    .into()
            }
        }
    }
}

/// Map a handler failure onto the CALLERROR the peer sees
fn failure_reply(ctx: &CallContext, err: OcppError) -> CallError {
    let message_id = ctx.message_id.clone();

    match err {
        OcppError::Handler { code, description } => CallError::new(message_id, code, description),
        OcppError::NotImplemented(what) => CallError::new(
            message_id,
            ErrorCode::NotImplemented,
            format!("{} is not implemented", what),
        ),
        OcppError::Json(e) => CallError::new(
            message_id,
            ErrorCode::FormatViolation,
            format!("Invalid {} payload: {}", ctx.action, e),
        ),
        other => {
            error!(
                "Handler for {} from {} failed: {}",
                ctx.action, ctx.identity, other
            );
            CallError::new(message_id, ErrorCode::InternalError, INTERNAL_ERROR_DESCRIPTION)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
