//! Cross-frame window messaging: origin-checked, fire-and-forget.

use std::fmt;
use std::sync::Arc;

use bmc_api_types::Message;
use serde_json::Value;
use tracing::error;

use crate::{
    DispatchMode, Envelope, Inbound, Inbox, MessagingError, MessagingTransport, Rejection, TransportKind,
    decode_payload,
};

/// Frames a context posts to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Frame {
    /// The reader page hosting the content script.
    Top,
    /// The injected side-panel iframe.
    SidePanel,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Top => f.write_str("top"),
            Self::SidePanel => f.write_str("side-panel"),
        }
    }
}

/// A raw `message` event as the host window delivers it.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEvent {
    pub kind: String,
    pub origin: String,
    pub data: Value,
    /// Set when the host delivered an error object instead of an event.
    pub error: Option<Value>,
}

impl WindowEvent {
    pub fn message(origin: impl Into<String>, data: Value) -> Self {
        Self {
            kind: "message".to_owned(),
            origin: origin.into(),
            data,
            error: None,
        }
    }
}

pub trait WindowHost: Send + Sync {
    /// Adds the one `message` listener of this window.
    fn listen(&self, inbox: Inbox<WindowEvent>) -> Result<(), MessagingError>;

    /// Posts to `frame`, failing with [`MessagingError::UnknownFrame`] when
    /// the frame cannot be found.
    fn post(&self, frame: &Frame, data: Value) -> Result<(), MessagingError>;
}

/// Accepts the extension's own origin and the configured top-frame origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    self_origin: String,
    top_origin: Option<String>,
}

impl OriginPolicy {
    pub fn new(self_origin: impl Into<String>, top_origin: Option<String>) -> Self {
        Self {
            self_origin: self_origin.into(),
            top_origin,
        }
    }

    /// `self_origin` is the extension base URL (`chrome-extension://<id>/`)
    /// while event origins carry no trailing slash.
    pub fn allows(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return false;
        }
        self.self_origin.trim_end_matches('/') == origin.trim_end_matches('/')
            || self.top_origin.as_deref() == Some(origin)
    }
}

pub struct WindowTransport {
    host: Arc<dyn WindowHost>,
    policy: OriginPolicy,
}

impl WindowTransport {
    pub fn new(host: Arc<dyn WindowHost>, policy: OriginPolicy) -> Self {
        Self { host, policy }
    }

    pub fn policy(&self) -> &OriginPolicy {
        &self.policy
    }

    pub fn post_to(&self, frame: &Frame, message: &Message) -> Result<(), MessagingError> {
        self.host.post(frame, message.to_value()).inspect_err(|err| {
            if matches!(err, MessagingError::UnknownFrame(_)) {
                error!(%frame, "required frame is missing");
            }
        })
    }
}

impl MessagingTransport for WindowTransport {
    type Raw = WindowEvent;

    fn kind(&self) -> TransportKind {
        TransportKind::Window
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Many
    }

    fn sanitize(&self, raw: WindowEvent) -> Result<Option<Inbound>, MessagingError> {
        if raw.kind != "message" {
            return Err(MessagingError::Rejected(Rejection::WrongKind(raw.kind)));
        }
        if let Some(err) = raw.error {
            return Err(MessagingError::Rejected(Rejection::HostError(err)));
        }
        if !self.policy.allows(&raw.origin) {
            return Err(MessagingError::Rejected(Rejection::Origin(raw.origin)));
        }
        let message = decode_payload(raw.data)?;
        Ok(Some(Inbound::new(Envelope {
            message,
            origin: Some(raw.origin),
            sender: None,
        })))
    }

    fn install(&self, inbox: Inbox<WindowEvent>) -> Result<(), MessagingError> {
        self.host.listen(inbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Messaging;
    use crate::local::LocalWindow;
    use bmc_api_types::Action;
    use bmc_compat::Reply;
    use serde_json::json;

    const SELF: &str = "moz-extension://4a1c7e/";
    const TOP: &str = "https://mangakakalot.com";

    fn transport(window: &Arc<LocalWindow>) -> Arc<WindowTransport> {
        Arc::new(WindowTransport::new(
            window.clone(),
            OriginPolicy::new(SELF, Some(TOP.to_owned())),
        ))
    }

    #[test]
    fn origin_policy_accepts_extension_and_top_frame() {
        let policy = OriginPolicy::new(SELF, Some(TOP.to_owned()));
        assert!(policy.allows("moz-extension://4a1c7e"));
        assert!(policy.allows(TOP));
        assert!(!policy.allows("https://evil.example"));
        assert!(!policy.allows("https://mangakakalot.com.evil.example"));
        assert!(!policy.allows(""));
    }

    #[test]
    fn origin_policy_refuses_fragments_of_the_extension_url() {
        let policy = OriginPolicy::new(SELF, None);
        assert!(policy.allows("moz-extension://4a1c7e/"));
        for fragment in ["moz-extension://4a1c", "moz-extension:", "4a1c7e", "/", "moz-extension://4a1c7e//x"] {
            assert!(!policy.allows(fragment), "{fragment} accepted");
        }
    }

    #[tokio::test]
    async fn sanitizer_rejects_each_bad_shape() -> anyhow::Result<()> {
        let window = Arc::new(LocalWindow::default());
        let transport = transport(&window);
        let show = json!({"type": "action", "action": "ShowSidePanel"});

        let mut wrong_kind = WindowEvent::message(TOP, show.clone());
        wrong_kind.kind = "messageerror".to_owned();
        let mut host_error = WindowEvent::message(TOP, show.clone());
        host_error.error = Some(json!({"message": "DataCloneError"}));
        let cases = [
            wrong_kind,
            host_error,
            WindowEvent::message("https://evil.example", show.clone()),
            WindowEvent::message(TOP, json!("ShowSidePanel")),
            WindowEvent::message(TOP, json!({"type": "action", "action": "selfdestruct"})),
        ];
        for case in cases {
            assert!(transport.sanitize(case).unwrap_err().is_rejection());
        }

        let accepted = transport.sanitize(WindowEvent::message(TOP, show))?.unwrap();
        assert_eq!(accepted.envelope.origin.as_deref(), Some(TOP));
        Ok(())
    }

    #[tokio::test]
    async fn one_listener_feeds_every_handler() -> anyhow::Result<()> {
        let window = Arc::new(LocalWindow::default());
        let bus = Messaging::new(transport(&window));
        bus.add_handler("a", |m| matches!(m, Message::Action(Action::HideSidePanel)), |_| {
            Reply::Now(json!("a"))
        })?;
        bus.add_handler("b", |m| matches!(m, Message::Action(Action::HideSidePanel)), |_| {
            Reply::Now(json!("b"))
        })?;
        assert_eq!(window.listener_count(), 1);

        window.deliver(WindowEvent::message(SELF, json!({"type": "action", "action": "HideSidePanel"})));
        let values = bus.dispatch_next().await.unwrap()?;
        assert_eq!(values, vec![json!("a"), json!("b")]);
        Ok(())
    }

    #[test]
    fn posting_to_a_missing_frame_fails() {
        let window = Arc::new(LocalWindow::default());
        let transport = transport(&window);
        let message = Message::Action(Action::Refresh);

        assert_eq!(
            transport.post_to(&Frame::SidePanel, &message),
            Err(MessagingError::UnknownFrame("side-panel".to_owned()))
        );
        window.attach(Frame::SidePanel);
        transport.post_to(&Frame::SidePanel, &message).unwrap();
        assert_eq!(window.posted(), vec![(Frame::SidePanel, message.to_value())]);
    }
}
