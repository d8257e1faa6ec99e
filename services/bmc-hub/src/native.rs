//! Native-messaging framing: a little-endian `u32` length, then UTF-8 JSON.
//!
//! Inbound frames carry `{port, event, origin, data}`; every port label maps
//! to one channel peer. Outbound frames are `{port, data}`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, bail};
use bmc_messaging::{ChannelEvent, ChannelHost, ConnectionId, Inbox, MessagingError, PeerSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Largest frame accepted from the browser.
pub(crate) const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum FrameEvent {
    Connect,
    Message,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct InboundFrame {
    pub(crate) port: String,
    pub(crate) event: FrameEvent,
    #[serde(default)]
    pub(crate) origin: Option<String>,
    #[serde(default)]
    pub(crate) data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct OutboundFrame {
    pub(crate) port: String,
    pub(crate) data: Value,
}

/// Reads one frame; `None` on a clean end of input.
pub(crate) async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let length = match reader.read_u32_le().await {
        Ok(length) => length as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("reading frame length"),
    };
    if length > MAX_FRAME {
        bail!("frame of {length} bytes exceeds the {MAX_FRAME} byte limit");
    }
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await.context("reading frame body")?;
    Ok(Some(body))
}

pub(crate) async fn write_frame<W>(writer: &mut W, body: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let length = u32::try_from(body.len()).context("frame too large")?;
    writer.write_u32_le(length).await.context("writing frame length")?;
    writer.write_all(body).await.context("writing frame body")?;
    writer.flush().await.context("flushing frame")?;
    Ok(())
}

/// One browser port, seen from the hub.
struct NativePeer {
    port: String,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl PeerSink for NativePeer {
    fn post(&self, data: Value) -> Result<(), MessagingError> {
        self.outbound
            .send(OutboundFrame {
                port: self.port.clone(),
                data,
            })
            .map_err(|_| MessagingError::Closed(format!("port {} output closed", self.port)))
    }
}

/// Channel host fed by stdin frames.
pub(crate) struct NativeChannel {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    inbox: Mutex<Option<Inbox<ChannelEvent>>>,
    ports: Mutex<HashMap<String, ConnectionId>>,
}

impl NativeChannel {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            outbound,
            inbox: Mutex::new(None),
            ports: Mutex::new(HashMap::new()),
        }
    }

    fn ports(&self) -> MutexGuard<'_, HashMap<String, ConnectionId>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ChannelEvent) {
        let inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        match inbox.as_ref() {
            Some(inbox) if inbox.send(event).is_ok() => {}
            _ => warn!("no listener for native frames"),
        }
    }

    /// Turns one decoded frame into a channel event.
    pub(crate) fn accept(&self, frame: InboundFrame) {
        let InboundFrame {
            port,
            event,
            origin,
            data,
        } = frame;
        match event {
            FrameEvent::Connect => {
                let id = ConnectionId::new();
                if let Some(previous) = self.ports().insert(port.clone(), id) {
                    warn!(%port, %previous, "port reconnected, replacing the old peer");
                    self.emit(ChannelEvent::Disconnect { id: previous });
                }
                info!(%port, peer = %id, "port connected");
                let sink = Arc::new(NativePeer {
                    port: port.clone(),
                    outbound: self.outbound.clone(),
                });
                self.emit(ChannelEvent::Connect {
                    id,
                    label: port,
                    origin,
                    sink,
                });
            }
            FrameEvent::Message => {
                let id = self.ports().get(&port).copied();
                match id {
                    Some(id) => self.emit(ChannelEvent::Message { id, data }),
                    None => warn!(%port, "message on a port that never connected"),
                }
            }
            FrameEvent::Disconnect => {
                let id = self.ports().remove(&port);
                match id {
                    Some(id) => {
                        info!(%port, peer = %id, "port disconnected");
                        self.emit(ChannelEvent::Disconnect { id });
                    }
                    None => debug!(%port, "disconnect of an unknown port"),
                }
            }
        }
    }

    /// Drops the listener so the dispatch loop ends.
    pub(crate) fn close(&self) {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.ports().clear();
    }
}

impl ChannelHost for NativeChannel {
    fn listen(&self, inbox: Inbox<ChannelEvent>) -> Result<(), MessagingError> {
        *self.inbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbox);
        Ok(())
    }
}

/// Feeds frames from `reader` to `channel` until the browser closes the pipe.
pub(crate) async fn read_loop<R>(mut reader: R, channel: &NativeChannel) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(body) = read_frame(&mut reader).await? {
        match serde_json::from_slice::<InboundFrame>(&body) {
            Ok(frame) => channel.accept(frame),
            Err(err) => warn!(%err, bytes = body.len(), "malformed frame skipped"),
        }
    }
    info!("input closed");
    Ok(())
}

/// Writes queued frames until every sender is gone.
pub(crate) async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<OutboundFrame>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        let body = serde_json::to_vec(&frame).context("encoding outbound frame")?;
        write_frame(&mut writer, &body).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> Vec<u8> {
        let body = serde_json::to_vec(&value).unwrap();
        let mut framed = (body.len() as u32).to_le_bytes().to_vec();
        framed.extend(body);
        framed
    }

    #[tokio::test]
    async fn frames_round_trip_through_a_pipe() -> anyhow::Result<()> {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, br#"{"port":"sidebar"}"#).await?;
        drop(client);

        assert_eq!(read_frame(&mut server).await?, Some(br#"{"port":"sidebar"}"#.to_vec()));
        assert_eq!(read_frame(&mut server).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() -> anyhow::Result<()> {
        let header = ((MAX_FRAME + 1) as u32).to_le_bytes();
        let mut reader: &[u8] = &header;
        assert!(read_frame(&mut reader).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn port_events_become_channel_events() -> anyhow::Result<()> {
        let (outbound, mut sent) = mpsc::unbounded_channel();
        let channel = NativeChannel::new(outbound);
        let (inbox, mut events) = mpsc::unbounded_channel();
        channel.listen(inbox)?;

        let mut input = frame(json!({"port": "sidebar", "event": "connect", "origin": "chrome-extension://abc/"}));
        input.extend(frame(json!({"port": "sidebar", "event": "message", "data": {"type": "action"}})));
        input.extend(b"\x03\x00\x00\x00{x}");
        input.extend(frame(json!({"port": "ghost", "event": "message", "data": {}})));
        input.extend(frame(json!({"port": "sidebar", "event": "disconnect"})));
        read_loop(input.as_slice(), &channel).await?;

        let Some(ChannelEvent::Connect { id, label, origin, sink }) = events.recv().await else {
            panic!("expected a connect event");
        };
        assert_eq!(label, "sidebar");
        assert_eq!(origin.as_deref(), Some("chrome-extension://abc/"));
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Message { id: message_id, data }) if message_id == id && data == json!({"type": "action"})
        ));
        assert!(matches!(events.recv().await, Some(ChannelEvent::Disconnect { id: gone }) if gone == id));
        assert!(events.try_recv().is_err());

        sink.post(json!({"type": "action", "action": "notification"}))?;
        let written = sent.recv().await.unwrap();
        assert_eq!(written.port, "sidebar");
        assert_eq!(written.data["action"], json!("notification"));
        Ok(())
    }

    #[tokio::test]
    async fn write_loop_frames_every_queued_message() -> anyhow::Result<()> {
        let (outbound, queued) = mpsc::unbounded_channel();
        outbound.send(OutboundFrame {
            port: "options".to_owned(),
            data: json!({"operation": "export"}),
        })?;
        drop(outbound);

        let mut written = Vec::new();
        write_loop(&mut written, queued).await?;
        let mut reader = written.as_slice();
        let body = read_frame(&mut reader).await?.unwrap();
        let frame: OutboundFrame = serde_json::from_slice(&body)?;
        assert_eq!(frame.port, "options");
        assert_eq!(read_frame(&mut reader).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn closing_ends_the_listener() -> anyhow::Result<()> {
        let (outbound, _sent) = mpsc::unbounded_channel();
        let channel = NativeChannel::new(outbound);
        let (inbox, mut events) = mpsc::unbounded_channel();
        channel.listen(inbox)?;
        channel.close();
        assert!(events.recv().await.is_none());
        Ok(())
    }
}
