//! Extension runtime messaging: request/response between a page context and
//! the background.

use std::sync::Arc;

use bmc_api_types::Message;
use bmc_compat::{CompatibilityLayer, HostPrimitive, Responder};
use serde_json::Value;

use crate::{DispatchMode, Envelope, Inbound, Inbox, MessagingError, MessagingTransport, TransportKind, decode_payload};

/// A request delivered by the host `onMessage` listener.
pub struct RuntimeRequest {
    pub data: Value,
    pub origin: Option<String>,
    /// The host `sendResponse`; `None` when the sender expects no answer.
    pub respond: Option<Responder>,
}

impl RuntimeRequest {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            origin: None,
            respond: None,
        }
    }

    pub fn with_responder(mut self, respond: Responder) -> Self {
        self.respond = Some(respond);
        self
    }
}

/// `runtime.sendMessage` plus `runtime.onMessage`.
pub trait RuntimeHost: HostPrimitive<Args = Value> {
    fn listen(&self, inbox: Inbox<RuntimeRequest>) -> Result<(), MessagingError>;
}

pub struct RuntimeTransport {
    host: Arc<dyn RuntimeHost>,
    compat: CompatibilityLayer,
}

impl RuntimeTransport {
    pub fn new(host: Arc<dyn RuntimeHost>, compat: CompatibilityLayer) -> Self {
        Self { host, compat }
    }

    /// Sends `message` and waits for the single answer.
    pub async fn send(&self, message: &Message) -> Result<Value, MessagingError> {
        Ok(self.compat.invoke(self.host.as_ref(), message.to_value()).await?)
    }
}

impl MessagingTransport for RuntimeTransport {
    type Raw = RuntimeRequest;

    fn kind(&self) -> TransportKind {
        TransportKind::Runtime
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Once
    }

    fn sanitize(&self, raw: RuntimeRequest) -> Result<Option<Inbound>, MessagingError> {
        let message = decode_payload(raw.data)?;
        Ok(Some(Inbound {
            envelope: Envelope {
                message,
                origin: raw.origin,
                sender: None,
            },
            responder: raw.respond,
        }))
    }

    fn install(&self, inbox: Inbox<RuntimeRequest>) -> Result<(), MessagingError> {
        self.host.listen(inbox)
    }
}
