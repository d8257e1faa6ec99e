//! Per-context message bus.
//!
//! A [`Messaging`] owns an ordered list of `(tag, selector, handler)` entries
//! for one transport. Inbound raw events go through the transport's
//! sanitizer, then are offered to the handlers in registration order: only
//! the first match in [`DispatchMode::Once`], every match in
//! [`DispatchMode::Many`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bmc_api_types::Message;
use bmc_compat::{CompatError, Reply, Responder};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub mod channel;
pub mod context;
pub mod local;
pub mod runtime;
pub mod window;

pub use channel::{ChannelEvent, ChannelHost, ChannelTransport, PeerSink, PortEvent, PortHost, PortTransport};
pub use context::{BackgroundContext, ContentContext, PanelContext};
pub use runtime::{RuntimeHost, RuntimeRequest, RuntimeTransport};
pub use window::{Frame, OriginPolicy, WindowEvent, WindowHost, WindowTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Single logical recipient: the first matching handler only.
    Once,
    /// Every matching handler.
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Window,
    Runtime,
    Channel,
    Port,
}

/// Opaque identity of a connected channel peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a sanitizer refused an inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    WrongKind(String),
    HostError(Value),
    Origin(String),
    NotAnObject,
    UnknownVariant(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongKind(kind) => write!(f, "unexpected event kind {kind:?}"),
            Self::HostError(err) => write!(f, "host reported {err}"),
            Self::Origin(origin) => write!(f, "origin {origin:?} is not trusted"),
            Self::NotAnObject => f.write_str("payload is not an object"),
            Self::UnknownVariant(reason) => write!(f, "unknown message: {reason}"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MessagingError {
    #[error("rejected inbound message: {0}")]
    Rejected(Rejection),
    #[error("frame {0} is not reachable")]
    UnknownFrame(String),
    #[error("no connected peer {0}")]
    UnknownPeer(ConnectionId),
    #[error(transparent)]
    Host(#[from] CompatError),
    #[error("channel closed: {0}")]
    Closed(String),
}

impl MessagingError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Decodes a raw payload into the closed message union.
pub fn decode_payload(data: Value) -> Result<Message, MessagingError> {
    if !data.is_object() {
        return Err(MessagingError::Rejected(Rejection::NotAnObject));
    }
    Message::from_value(data)
        .map_err(|err| MessagingError::Rejected(Rejection::UnknownVariant(err.to_string())))
}

/// A sanitized inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub origin: Option<String>,
    /// Channel peer that sent the message, when the transport has peers.
    pub sender: Option<ConnectionId>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            origin: None,
            sender: None,
        }
    }
}

pub struct Inbound {
    pub envelope: Envelope,
    /// Host reply callback of a request/response transport.
    pub responder: Option<Responder>,
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("envelope", &self.envelope)
            .field("responder", &self.responder.is_some())
            .finish()
    }
}

impl Inbound {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            responder: None,
        }
    }
}

/// Sender half handed to a host listener.
pub type Inbox<R> = mpsc::UnboundedSender<R>;

pub type Selector = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
pub type Handler = Arc<dyn Fn(&Envelope) -> Reply + Send + Sync>;

pub trait MessagingTransport: Send + Sync + 'static {
    type Raw: Send + 'static;

    fn kind(&self) -> TransportKind;

    fn mode(&self) -> DispatchMode;

    /// Validates a raw event. `Ok(None)` means the event was a transport
    /// control event (peer connect/disconnect) consumed by the transport.
    fn sanitize(&self, raw: Self::Raw) -> Result<Option<Inbound>, MessagingError>;

    /// Registers the single low-level host listener feeding `inbox`.
    fn install(&self, inbox: Inbox<Self::Raw>) -> Result<(), MessagingError>;
}

struct Entry {
    tag: String,
    selector: Selector,
    handler: Handler,
}

pub struct Messaging<T: MessagingTransport> {
    transport: Arc<T>,
    entries: Mutex<Vec<Entry>>,
    installed: AtomicBool,
    inbox: Mutex<Option<Inbox<T::Raw>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<T::Raw>>,
}

async fn resolve(reply: Reply) -> Value {
    match reply {
        Reply::Now(value) => value,
        Reply::Later(pending) => pending.await,
    }
}

impl<T: MessagingTransport> Messaging<T> {
    pub fn new(transport: Arc<T>) -> Self {
        let (inbox, receiver) = mpsc::unbounded_channel();
        Self {
            transport,
            entries: Mutex::new(Vec::new()),
            installed: AtomicBool::new(false),
            inbox: Mutex::new(Some(inbox)),
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn install_once(&self) -> Result<(), MessagingError> {
        if self
            .installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(inbox) = inbox else {
            return Ok(());
        };
        if let Err(err) = self.transport.install(inbox.clone()) {
            *self.inbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbox);
            self.installed.store(false, Ordering::Release);
            return Err(err);
        }
        debug!(kind = ?self.transport.kind(), "transport listener installed");
        Ok(())
    }

    /// Appends a handler; the first call installs the host listener.
    pub fn add_handler<S, H>(&self, tag: impl Into<String>, selector: S, handler: H) -> Result<(), MessagingError>
    where
        S: Fn(&Message) -> bool + Send + Sync + 'static,
        H: Fn(&Envelope) -> Reply + Send + Sync + 'static,
    {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry {
                tag: tag.into(),
                selector: Arc::new(selector),
                handler: Arc::new(handler),
            });
        self.install_once()
    }

    pub fn remove_handlers(&self, tag: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|entry| entry.tag != tag);
        before - entries.len()
    }

    pub fn handler_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Calls the selected handlers and returns their replies in order.
    pub fn route(&self, envelope: &Envelope) -> Vec<Reply> {
        let selected: Vec<Handler> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| (entry.selector)(&envelope.message))
            .map(|entry| entry.handler.clone())
            .collect();

        let handlers = match self.transport.mode() {
            DispatchMode::Many => selected,
            DispatchMode::Once => {
                if selected.len() > 1 {
                    warn!(count = selected.len(), "several handlers match, only the first runs");
                }
                selected.into_iter().take(1).collect()
            }
        };
        if handlers.is_empty() {
            debug!(kind = ?self.transport.kind(), "no handler for message");
        }
        handlers.iter().map(|handler| handler(envelope)).collect()
    }

    /// Sanitizes and routes one raw event, waiting for every reply. A
    /// request/response transport answers with the first reply, or `null`
    /// when nothing matched.
    pub async fn dispatch(&self, raw: T::Raw) -> Result<Vec<Value>, MessagingError> {
        let Some(Inbound { envelope, responder }) = self.transport.sanitize(raw)? else {
            return Ok(Vec::new());
        };
        let replies = self.route(&envelope);

        let mut values = Vec::with_capacity(replies.len());
        for reply in replies {
            values.push(resolve(reply).await);
        }
        if let Some(respond) = responder {
            if values.is_empty() {
                error!(kind = ?self.transport.kind(), "request without handler, answering null");
            }
            respond(values.first().cloned().unwrap_or(Value::Null));
        }
        Ok(values)
    }

    /// Receives and dispatches one event from the installed listener;
    /// `None` once the host side dropped it.
    pub async fn dispatch_next(&self) -> Option<Result<Vec<Value>, MessagingError>> {
        let raw = self.receiver.lock().await.recv().await?;
        Some(self.dispatch(raw).await)
    }

    /// Dispatches events until the host side drops the listener, then waits
    /// for the replies still pending. Events are sanitized and routed in
    /// arrival order; their deferred replies run concurrently. Rejected
    /// events are logged and skipped.
    pub async fn run(&self) {
        let mut receiver = self.receiver.lock().await;
        stream::poll_fn(|cx| receiver.poll_recv(cx))
            .for_each_concurrent(None, |raw| async move {
                if let Err(err) = self.dispatch(raw).await {
                    warn!(kind = ?self.transport.kind(), %err, "inbound event dropped");
                }
            })
            .await;
        debug!(kind = ?self.transport.kind(), "listener closed");
    }
}
