//! In-process hosts. They back the native hub and every test that needs a
//! window, runtime or channel without a browser.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bmc_compat::{CompatError, HostCallback, HostPrimitive, HostPromise};
use futures::FutureExt;
use serde_json::Value;

use crate::channel::{ChannelEvent, ChannelHost, PeerSink, PortEvent, PortHost};
use crate::runtime::{RuntimeHost, RuntimeRequest};
use crate::window::{Frame, WindowEvent, WindowHost};
use crate::{ConnectionId, Inbox, MessagingError};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where posts to an attached frame end up.
struct Link {
    window: Arc<LocalWindow>,
    origin: String,
}

#[derive(Default)]
pub struct LocalWindow {
    listeners: Mutex<Vec<Inbox<WindowEvent>>>,
    frames: Mutex<BTreeMap<Frame, Option<Link>>>,
    posted: Mutex<Vec<(Frame, Value)>>,
}

impl LocalWindow {
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Hands `event` to every listener of this window.
    pub fn deliver(&self, event: WindowEvent) {
        lock(&self.listeners).retain(|inbox| inbox.send(event.clone()).is_ok());
    }

    /// Makes `frame` reachable; posts to it are only recorded.
    pub fn attach(&self, frame: Frame) {
        lock(&self.frames).insert(frame, None);
    }

    /// Makes `frame` reachable and forwards posts to `window` as coming
    /// from `origin`.
    pub fn link(&self, frame: Frame, window: Arc<LocalWindow>, origin: impl Into<String>) {
        let link = Link {
            window,
            origin: origin.into(),
        };
        lock(&self.frames).insert(frame, Some(link));
    }

    pub fn detach(&self, frame: &Frame) {
        lock(&self.frames).remove(frame);
    }

    pub fn posted(&self) -> Vec<(Frame, Value)> {
        lock(&self.posted).clone()
    }

    pub fn take_posted(&self) -> Vec<(Frame, Value)> {
        std::mem::take(&mut *lock(&self.posted))
    }
}

impl WindowHost for LocalWindow {
    fn listen(&self, inbox: Inbox<WindowEvent>) -> Result<(), MessagingError> {
        lock(&self.listeners).push(inbox);
        Ok(())
    }

    fn post(&self, frame: &Frame, data: Value) -> Result<(), MessagingError> {
        let target = {
            let frames = lock(&self.frames);
            match frames.get(frame) {
                None => return Err(MessagingError::UnknownFrame(frame.to_string())),
                Some(link) => link.as_ref().map(|link| (link.window.clone(), link.origin.clone())),
            }
        };
        lock(&self.posted).push((frame.clone(), data.clone()));
        if let Some((window, origin)) = target {
            window.deliver(WindowEvent::message(origin, data));
        }
        Ok(())
    }
}

/// Runtime whose outgoing requests are answered from a queue.
#[derive(Default)]
pub struct LocalRuntime {
    listeners: Mutex<Vec<Inbox<RuntimeRequest>>>,
    answers: Mutex<VecDeque<Result<Value, Value>>>,
    sent: Mutex<Vec<Value>>,
}

impl LocalRuntime {
    /// Queues the outcome of the next `send`; an empty queue answers `null`.
    pub fn answer_with(&self, outcome: Result<Value, Value>) {
        lock(&self.answers).push_back(outcome);
    }

    pub fn sent(&self) -> Vec<Value> {
        lock(&self.sent).clone()
    }

    /// Delivers a request to the first listener.
    pub fn deliver(&self, request: RuntimeRequest) -> bool {
        match lock(&self.listeners).first() {
            Some(inbox) => inbox.send(request).is_ok(),
            None => false,
        }
    }

    fn next_outcome(&self, data: Value) -> Result<Value, Value> {
        lock(&self.sent).push(data);
        lock(&self.answers).pop_front().unwrap_or(Ok(Value::Null))
    }
}

impl HostPrimitive for LocalRuntime {
    type Args = Value;

    fn call_with_callback(&self, data: Value, done: HostCallback) -> Result<(), CompatError> {
        match self.next_outcome(data) {
            Ok(answer) => done(None, Some(answer)),
            Err(err) => done(Some(err), None),
        }
        Ok(())
    }

    fn call_with_promise(&self, data: Value) -> Result<HostPromise, CompatError> {
        let outcome = self.next_outcome(data);
        Ok(async move { outcome }.boxed())
    }
}

impl RuntimeHost for LocalRuntime {
    fn listen(&self, inbox: Inbox<RuntimeRequest>) -> Result<(), MessagingError> {
        lock(&self.listeners).push(inbox);
        Ok(())
    }
}

/// Connected end of a [`LocalChannel`]; records what the hub sent it.
#[derive(Default)]
pub struct LocalPeer {
    received: Mutex<Vec<Value>>,
    closed: AtomicBool,
    forward: Mutex<Option<Inbox<PortEvent>>>,
}

impl LocalPeer {
    pub fn received(&self) -> Vec<Value> {
        lock(&self.received).clone()
    }

    pub fn take_received(&self) -> Vec<Value> {
        std::mem::take(&mut *lock(&self.received))
    }

    /// Later posts fail as if the page went away.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Also forwards posts as port events, e.g. into a [`LocalPort`] listener.
    pub fn forward_to(&self, inbox: Inbox<PortEvent>) {
        *lock(&self.forward) = Some(inbox);
    }
}

impl PeerSink for LocalPeer {
    fn post(&self, data: Value) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed("peer closed".to_owned()));
        }
        if let Some(inbox) = lock(&self.forward).as_ref() {
            // The page side may have stopped listening; the record below stays.
            let _ = inbox.send(PortEvent::Message(data.clone()));
        }
        lock(&self.received).push(data);
        Ok(())
    }
}

#[derive(Default)]
pub struct LocalChannel {
    listeners: Mutex<Vec<Inbox<ChannelEvent>>>,
}

impl LocalChannel {
    fn emit(&self, event: ChannelEvent) {
        if let Some(inbox) = lock(&self.listeners).first() {
            // Without a listener the event has nowhere to go.
            let _ = inbox.send(event);
        }
    }

    pub fn connect(&self, label: &str, origin: Option<String>) -> (ConnectionId, Arc<LocalPeer>) {
        let id = ConnectionId::new();
        let peer = Arc::new(LocalPeer::default());
        self.emit(ChannelEvent::Connect {
            id,
            label: label.to_owned(),
            origin,
            sink: peer.clone(),
        });
        (id, peer)
    }

    pub fn message(&self, id: ConnectionId, data: Value) {
        self.emit(ChannelEvent::Message { id, data });
    }

    pub fn disconnect(&self, id: ConnectionId) {
        self.emit(ChannelEvent::Disconnect { id });
    }

    pub fn fail(&self, id: Option<ConnectionId>, error: Value) {
        self.emit(ChannelEvent::Error { id, error });
    }
}

impl ChannelHost for LocalChannel {
    fn listen(&self, inbox: Inbox<ChannelEvent>) -> Result<(), MessagingError> {
        lock(&self.listeners).push(inbox);
        Ok(())
    }
}

#[derive(Default)]
pub struct LocalPort {
    listeners: Mutex<Vec<Inbox<PortEvent>>>,
    posted: Mutex<Vec<Value>>,
}

impl LocalPort {
    pub fn deliver(&self, event: PortEvent) {
        lock(&self.listeners).retain(|inbox| inbox.send(event.clone()).is_ok());
    }

    pub fn posted(&self) -> Vec<Value> {
        lock(&self.posted).clone()
    }

    pub fn take_posted(&self) -> Vec<Value> {
        std::mem::take(&mut *lock(&self.posted))
    }
}

impl PortHost for LocalPort {
    fn listen(&self, inbox: Inbox<PortEvent>) -> Result<(), MessagingError> {
        lock(&self.listeners).push(inbox);
        Ok(())
    }

    fn post(&self, data: Value) -> Result<(), MessagingError> {
        lock(&self.posted).push(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn linked_frames_receive_posts_as_window_events() -> anyhow::Result<()> {
        let top = Arc::new(LocalWindow::default());
        let panel = Arc::new(LocalWindow::default());
        top.link(Frame::SidePanel, panel.clone(), "https://mangakakalot.com");
        let (inbox, mut events) = mpsc::unbounded_channel();
        panel.listen(inbox)?;

        top.post(&Frame::SidePanel, json!({"action": "toggle"}))?;
        let event = events.recv().await.unwrap();
        assert_eq!(event.origin, "https://mangakakalot.com");
        assert_eq!(event.data, json!({"action": "toggle"}));

        top.detach(&Frame::SidePanel);
        assert!(top.post(&Frame::SidePanel, json!({})).is_err());
        assert_eq!(top.take_posted().len(), 1);
        assert!(top.posted().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn peers_forward_to_a_port_listener() -> anyhow::Result<()> {
        let channel = LocalChannel::default();
        let (hub, mut hub_events) = mpsc::unbounded_channel();
        channel.listen(hub)?;
        let (_, peer) = channel.connect("sidebar", None);
        assert!(matches!(hub_events.recv().await, Some(ChannelEvent::Connect { .. })));

        let (inbox, mut port_events) = mpsc::unbounded_channel();
        peer.forward_to(inbox);
        peer.post(json!(1))?;
        assert_eq!(port_events.recv().await, Some(PortEvent::Message(json!(1))));
        assert_eq!(peer.take_received(), vec![json!(1)]);
        Ok(())
    }
}
