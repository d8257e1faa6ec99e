//! One asynchronous contract over host primitives that either take a trailing
//! `(err, data)` callback or return a promise.

use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Callback,
    Promise,
}

/// Probe used once to pick a [`CallMode`].
pub trait HostEnvironment {
    /// Whether the promise-only `browser` namespace is reachable.
    fn has_promise_namespace(&self) -> bool;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompatError {
    #[error("host error: {0}")]
    Host(Value),
    #[error("host dropped the completion of a {0:?} call")]
    Abandoned(CallMode),
    #[error("host primitive does not support {0:?} calls")]
    Unsupported(CallMode),
}

impl CompatError {
    /// The untouched error value reported by the host, if any.
    pub fn host_value(&self) -> Option<&Value> {
        match self {
            Self::Host(value) => Some(value),
            _ => None,
        }
    }
}

/// Trailing callback: `(err, data)`.
pub type HostCallback = Box<dyn FnOnce(Option<Value>, Option<Value>) + Send>;
pub type HostPromise = BoxFuture<'static, Result<Value, Value>>;

/// A host function reachable in one or both call styles.
pub trait HostPrimitive: Send + Sync {
    type Args: Send + 'static;

    fn call_with_callback(&self, _args: Self::Args, _done: HostCallback) -> Result<(), CompatError> {
        Err(CompatError::Unsupported(CallMode::Callback))
    }

    fn call_with_promise(&self, _args: Self::Args) -> Result<HostPromise, CompatError> {
        Err(CompatError::Unsupported(CallMode::Promise))
    }
}

/// Hosts report "no error" as a falsy value or as an object without own
/// properties; anything else is a real failure.
pub fn is_host_error(err: &Value) -> bool {
    match err {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) => true,
        Value::Object(map) => !map.is_empty(),
    }
}

fn settle(err: Option<Value>, data: Option<Value>) -> Result<Value, CompatError> {
    match err {
        Some(err) if is_host_error(&err) => Err(CompatError::Host(err)),
        _ => Ok(data.unwrap_or(Value::Null)),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompatibilityLayer {
    mode: CallMode,
}

impl CompatibilityLayer {
    pub fn detect(env: &impl HostEnvironment) -> Self {
        let mode = if env.has_promise_namespace() {
            CallMode::Promise
        } else {
            CallMode::Callback
        };
        Self::new(mode)
    }

    pub fn new(mode: CallMode) -> Self {
        debug!(?mode, "compatibility layer ready");
        Self { mode }
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    /// Calls `primitive` in this layer's mode and completes exactly once.
    pub async fn invoke<P>(&self, primitive: &P, args: P::Args) -> Result<Value, CompatError>
    where
        P: HostPrimitive + ?Sized,
    {
        match self.mode {
            CallMode::Callback => {
                let (tx, rx) = oneshot::channel();
                primitive.call_with_callback(
                    args,
                    Box::new(move |err, data| {
                        // A second completion has nowhere to go.
                        let _ = tx.send((err, data));
                    }),
                )?;
                let (err, data) = rx.await.map_err(|_| CompatError::Abandoned(CallMode::Callback))?;
                settle(err, data)
            }
            CallMode::Promise => match primitive.call_with_promise(args)?.await {
                Ok(data) => Ok(data),
                Err(err) => settle(Some(err), None),
            },
        }
    }
}

/// What an inbound extension-message handler answers.
pub enum Reply {
    Now(Value),
    Later(BoxFuture<'static, Value>),
}

impl Reply {
    pub fn none() -> Self {
        Self::Now(Value::Null)
    }

    pub fn later<F>(future: F) -> Self
    where
        F: Future<Output = Value> + Send + 'static,
    {
        Self::Later(future.boxed())
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Later(_))
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Now(value) => f.debug_tuple("Now").field(value).finish(),
            Self::Later(_) => f.write_str("Later(..)"),
        }
    }
}

pub type Responder = Box<dyn FnOnce(Value) + Send>;

/// Result of handing a [`Reply`] to the host reply callback.
pub enum Settled {
    Answered,
    /// The host must keep the reply channel open until this future is driven
    /// to completion.
    Pending(BoxFuture<'static, ()>),
}

impl Settled {
    pub fn keeps_channel_open(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Answers synchronously when possible, otherwise defers `respond` until the
/// handler's future resolves.
pub fn answer(reply: Reply, respond: Responder) -> Settled {
    match reply {
        Reply::Now(value) => {
            respond(value);
            Settled::Answered
        }
        Reply::Later(future) => Settled::Pending(
            async move {
                let value = future.await;
                if value.is_null() {
                    warn!("deferred reply resolved without a payload");
                }
                respond(value);
            }
            .boxed(),
        ),
    }
}
