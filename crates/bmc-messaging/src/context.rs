//! The buses each extension context owns, wired to their transports.

use std::sync::Arc;

use bmc_api_types::Message;
use bmc_compat::Reply;
use serde_json::Value;

use crate::channel::{ChannelTransport, PortTransport};
use crate::runtime::RuntimeTransport;
use crate::window::{Frame, WindowTransport};
use crate::{ConnectionId, Envelope, Messaging, MessagingError};

/// Content script: window messages from the side panel, runtime requests to
/// and from the background.
pub struct ContentContext {
    window: Messaging<WindowTransport>,
    runtime: Messaging<RuntimeTransport>,
}

impl ContentContext {
    pub fn new(window: WindowTransport, runtime: RuntimeTransport) -> Self {
        Self {
            window: Messaging::new(Arc::new(window)),
            runtime: Messaging::new(Arc::new(runtime)),
        }
    }

    pub fn window(&self) -> &Messaging<WindowTransport> {
        &self.window
    }

    pub fn runtime(&self) -> &Messaging<RuntimeTransport> {
        &self.runtime
    }

    pub fn add_window_handler<S, H>(&self, tag: &str, selector: S, handler: H) -> Result<(), MessagingError>
    where
        S: Fn(&Message) -> bool + Send + Sync + 'static,
        H: Fn(&Envelope) -> Reply + Send + Sync + 'static,
    {
        self.window.add_handler(tag, selector, handler)
    }

    pub fn add_extension_handler<S, H>(&self, tag: &str, selector: S, handler: H) -> Result<(), MessagingError>
    where
        S: Fn(&Message) -> bool + Send + Sync + 'static,
        H: Fn(&Envelope) -> Reply + Send + Sync + 'static,
    {
        self.runtime.add_handler(tag, selector, handler)
    }

    pub fn send_window(&self, frame: &Frame, message: &Message) -> Result<(), MessagingError> {
        self.window.transport().post_to(frame, message)
    }

    pub async fn send_extension(&self, message: &Message) -> Result<Value, MessagingError> {
        self.runtime.transport().send(message).await
    }

    /// Removes `tag` from both buses.
    pub fn remove_handlers(&self, tag: &str) -> usize {
        self.window.remove_handlers(tag) + self.runtime.remove_handlers(tag)
    }

    pub async fn run(&self) {
        futures::join!(self.window.run(), self.runtime.run());
    }
}

/// Background: the hub every page connects to.
pub struct BackgroundContext {
    channel: Messaging<ChannelTransport>,
}

impl BackgroundContext {
    pub fn new(channel: ChannelTransport) -> Self {
        Self {
            channel: Messaging::new(Arc::new(channel)),
        }
    }

    pub fn channel(&self) -> &Messaging<ChannelTransport> {
        &self.channel
    }

    pub fn add_handler<S, H>(&self, tag: &str, selector: S, handler: H) -> Result<(), MessagingError>
    where
        S: Fn(&Message) -> bool + Send + Sync + 'static,
        H: Fn(&Envelope) -> Reply + Send + Sync + 'static,
    {
        self.channel.add_handler(tag, selector, handler)
    }

    pub fn remove_handlers(&self, tag: &str) -> usize {
        self.channel.remove_handlers(tag)
    }

    pub fn send(&self, peer: ConnectionId, message: &Message) -> Result<(), MessagingError> {
        self.channel.transport().send(peer, message)
    }

    pub fn broadcast(&self, message: &Message) -> usize {
        self.channel.transport().broadcast(message)
    }

    pub async fn run(&self) {
        self.channel.run().await
    }
}

/// Side panel: window messages from the content script, a port to the
/// background.
pub struct PanelContext {
    window: Messaging<WindowTransport>,
    port: Messaging<PortTransport>,
}

impl PanelContext {
    pub fn new(window: WindowTransport, port: PortTransport) -> Self {
        Self {
            window: Messaging::new(Arc::new(window)),
            port: Messaging::new(Arc::new(port)),
        }
    }

    pub fn window(&self) -> &Messaging<WindowTransport> {
        &self.window
    }

    pub fn port(&self) -> &Messaging<PortTransport> {
        &self.port
    }

    pub fn add_window_handler<S, H>(&self, tag: &str, selector: S, handler: H) -> Result<(), MessagingError>
    where
        S: Fn(&Message) -> bool + Send + Sync + 'static,
        H: Fn(&Envelope) -> Reply + Send + Sync + 'static,
    {
        self.window.add_handler(tag, selector, handler)
    }

    pub fn add_extension_handler<S, H>(&self, tag: &str, selector: S, handler: H) -> Result<(), MessagingError>
    where
        S: Fn(&Message) -> bool + Send + Sync + 'static,
        H: Fn(&Envelope) -> Reply + Send + Sync + 'static,
    {
        self.port.add_handler(tag, selector, handler)
    }

    /// Posts to the reader page hosting the panel.
    pub fn send_window(&self, message: &Message) -> Result<(), MessagingError> {
        self.window.transport().post_to(&Frame::Top, message)
    }

    pub fn send_extension(&self, message: &Message) -> Result<(), MessagingError> {
        self.port.transport().send(message)
    }

    pub fn remove_handlers(&self, tag: &str) -> usize {
        self.window.remove_handlers(tag) + self.port.remove_handlers(tag)
    }

    pub async fn run(&self) {
        futures::join!(self.window.run(), self.port.run());
    }
}
