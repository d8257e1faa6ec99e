//! Long-lived connections: the background hub side ([`ChannelTransport`])
//! and the page side of one connection ([`PortTransport`]).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use bmc_api_types::Message;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::window::OriginPolicy;
use crate::{
    ConnectionId, DispatchMode, Envelope, Inbound, Inbox, MessagingError, MessagingTransport, Rejection,
    TransportKind, decode_payload,
};

/// Outbound half of a connected peer.
pub trait PeerSink: Send + Sync {
    fn post(&self, data: Value) -> Result<(), MessagingError>;
}

pub enum ChannelEvent {
    Connect {
        id: ConnectionId,
        /// Port name chosen by the connecting context.
        label: String,
        origin: Option<String>,
        sink: Arc<dyn PeerSink>,
    },
    Message {
        id: ConnectionId,
        data: Value,
    },
    Disconnect {
        id: ConnectionId,
    },
    Error {
        id: Option<ConnectionId>,
        error: Value,
    },
}

/// `runtime.onConnect` on the hub side.
pub trait ChannelHost: Send + Sync {
    fn listen(&self, inbox: Inbox<ChannelEvent>) -> Result<(), MessagingError>;
}

struct Peer {
    label: String,
    origin: Option<String>,
    sink: Arc<dyn PeerSink>,
}

pub struct ChannelTransport {
    host: Arc<dyn ChannelHost>,
    policy: Option<OriginPolicy>,
    peers: Mutex<BTreeMap<ConnectionId, Peer>>,
}

impl ChannelTransport {
    pub fn new(host: Arc<dyn ChannelHost>) -> Self {
        Self {
            host,
            policy: None,
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Refuses connections whose origin the policy does not allow.
    pub fn with_policy(mut self, policy: OriginPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn peer_label(&self, id: ConnectionId) -> Option<String> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|peer| peer.label.clone())
    }

    fn sink(&self, id: ConnectionId) -> Option<Arc<dyn PeerSink>> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|peer| peer.sink.clone())
    }

    fn forget(&self, id: ConnectionId) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Sends to one peer. A peer whose sink fails is dropped.
    pub fn send(&self, id: ConnectionId, message: &Message) -> Result<(), MessagingError> {
        let sink = self.sink(id).ok_or(MessagingError::UnknownPeer(id))?;
        sink.post(message.to_value()).inspect_err(|err| {
            warn!(peer = %id, %err, "send failed, dropping peer");
            self.forget(id);
        })
    }

    /// Sends to every connected peer, returning how many were reached.
    pub fn broadcast(&self, message: &Message) -> usize {
        let ids: Vec<ConnectionId> = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.into_iter().filter(|id| self.send(*id, message).is_ok()).count()
    }
}

impl MessagingTransport for ChannelTransport {
    type Raw = ChannelEvent;

    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Many
    }

    fn sanitize(&self, raw: ChannelEvent) -> Result<Option<Inbound>, MessagingError> {
        match raw {
            ChannelEvent::Connect {
                id,
                label,
                origin,
                sink,
            } => {
                if let Some(policy) = &self.policy
                    && !origin.as_deref().is_some_and(|origin| policy.allows(origin))
                {
                    return Err(MessagingError::Rejected(Rejection::Origin(origin.unwrap_or_default())));
                }
                info!(peer = %id, %label, "peer connected");
                self.peers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id, Peer { label, origin, sink });
                Ok(None)
            }
            ChannelEvent::Disconnect { id } => {
                if self.forget(id) {
                    info!(peer = %id, "peer disconnected");
                }
                Ok(None)
            }
            ChannelEvent::Error { id, error } => {
                if let Some(id) = id {
                    self.forget(id);
                }
                Err(MessagingError::Rejected(Rejection::HostError(error)))
            }
            ChannelEvent::Message { id, data } => {
                let origin = {
                    let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
                    let peer = peers.get(&id).ok_or(MessagingError::UnknownPeer(id))?;
                    peer.origin.clone()
                };
                let message = decode_payload(data)?;
                Ok(Some(Inbound::new(Envelope {
                    message,
                    origin,
                    sender: Some(id),
                })))
            }
        }
    }

    fn install(&self, inbox: Inbox<ChannelEvent>) -> Result<(), MessagingError> {
        self.host.listen(inbox)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Message(Value),
    Disconnected,
    Error(Value),
}

/// The page end of a `runtime.connect` port.
pub trait PortHost: Send + Sync {
    fn listen(&self, inbox: Inbox<PortEvent>) -> Result<(), MessagingError>;

    fn post(&self, data: Value) -> Result<(), MessagingError>;
}

pub struct PortTransport {
    host: Arc<dyn PortHost>,
}

impl PortTransport {
    pub fn new(host: Arc<dyn PortHost>) -> Self {
        Self { host }
    }

    pub fn send(&self, message: &Message) -> Result<(), MessagingError> {
        self.host.post(message.to_value())
    }
}

impl MessagingTransport for PortTransport {
    type Raw = PortEvent;

    fn kind(&self) -> TransportKind {
        TransportKind::Port
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Many
    }

    fn sanitize(&self, raw: PortEvent) -> Result<Option<Inbound>, MessagingError> {
        match raw {
            PortEvent::Message(data) => Ok(Some(Inbound::new(Envelope::new(decode_payload(data)?)))),
            PortEvent::Disconnected => {
                debug!("port disconnected");
                Ok(None)
            }
            PortEvent::Error(error) => Err(MessagingError::Rejected(Rejection::HostError(error))),
        }
    }

    fn install(&self, inbox: Inbox<PortEvent>) -> Result<(), MessagingError> {
        self.host.listen(inbox)
    }
}
