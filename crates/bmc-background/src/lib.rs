//! Background handlers: every data mutation the pages ask for, each one
//! broadcasting a notification with its outcome.
//!
//! The extension runs them in its background page over `runtime.onConnect`
//! ports; the hub runs them over native messaging. Both own the store the
//! content scripts read.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use bmc_api_types::{
    Action, ComicId, ComicInfo, ComicSnapshot, ComicSource, CommonInfo, Computation, ComputationKind, Message,
    Notification, UrlResource,
};
use bmc_compat::{CompatibilityLayer, Reply};
use bmc_datamodel::{DataApi, DataError};
use bmc_messaging::{BackgroundContext, ConnectionId, Envelope, MessagingError};
use bmc_source_localhost::LocalhostReader;
use bmc_sources::SourceRegistry;
use bmc_storage::settings::STORAGE_ENGINE;
use bmc_storage::{AreaSet, Settings, StorageEngine};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const BACKGROUND_TAG: &str = "BookMyComics::Background";

const STORAGE_MODULE: &str = "storage";

/// Adapters the background knows about.
pub fn sources() -> Arc<SourceRegistry> {
    let mut registry = SourceRegistry::default();
    LocalhostReader::new(None).install(&mut registry);
    Arc::new(registry)
}

fn comic_info(comic: &ComicSnapshot, source: &ComicSource) -> ComicInfo {
    ComicInfo {
        common: CommonInfo {
            name: source.name.clone(),
            chapter: comic.tracking.chapter,
            page: comic.tracking.page,
        },
        extra: source.info.clone(),
    }
}

fn missing_id() -> String {
    "the comic has no id".to_owned()
}

fn is_action(message: &Message, pick: impl Fn(&Action) -> bool) -> bool {
    message.as_action().is_some_and(pick)
}

/// The store the background currently writes to.
struct Active {
    engine: StorageEngine,
    data: DataApi,
}

pub struct Background {
    context: Arc<BackgroundContext>,
    areas: AreaSet,
    compat: CompatibilityLayer,
    settings: Mutex<Settings>,
    /// Held by every mutating handler; their replies run concurrently.
    writes: Mutex<()>,
    active: RwLock<Active>,
    sources: Arc<SourceRegistry>,
    allow_duplicate_labels: bool,
}

struct BackgroundParts {
    areas: AreaSet,
    compat: CompatibilityLayer,
    settings: Settings,
    engine: StorageEngine,
    data: DataApi,
    sources: Arc<SourceRegistry>,
    allow_duplicate_labels: bool,
}

impl Background {
    fn new(context: Arc<BackgroundContext>, parts: BackgroundParts) -> Self {
        Self {
            context,
            areas: parts.areas,
            compat: parts.compat,
            settings: Mutex::new(parts.settings),
            writes: Mutex::new(()),
            active: RwLock::new(Active {
                engine: parts.engine,
                data: parts.data,
            }),
            sources: parts.sources,
            allow_duplicate_labels: parts.allow_duplicate_labels,
        }
    }

    /// Loads the settings from `areas`, opens the chosen store and repairs
    /// it before any handler runs.
    pub async fn open(
        context: Arc<BackgroundContext>,
        areas: AreaSet,
        compat: CompatibilityLayer,
        sources: Arc<SourceRegistry>,
        allow_duplicate_labels: bool,
    ) -> Result<Self, DataError> {
        let (settings, engine, storage) = areas.open(compat).await?;
        let data = DataApi::new(storage);
        let report = data.reconcile().await?;
        if !report.is_clean() {
            warn!(?report, "store repaired at start-up");
        }
        info!(%engine, "background store open");
        Ok(Self::new(
            context,
            BackgroundParts {
                areas,
                compat,
                settings,
                engine,
                data,
                sources,
                allow_duplicate_labels,
            },
        ))
    }

    pub fn data(&self) -> DataApi {
        self.active.read().unwrap_or_else(PoisonError::into_inner).data.clone()
    }

    pub fn engine(&self) -> StorageEngine {
        self.active.read().unwrap_or_else(PoisonError::into_inner).engine
    }

    fn on<S, F, Fut>(self: &Arc<Self>, selector: S, run: F) -> Result<(), MessagingError>
    where
        S: Fn(&Message) -> bool + Send + Sync + 'static,
        F: Fn(Arc<Self>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let background = self.clone();
        self.context.add_handler(BACKGROUND_TAG, selector, move |envelope| {
            let pending = run(background.clone(), envelope.clone());
            Reply::later(async move {
                pending.await;
                Value::Null
            })
        })
    }

    pub fn install(self: &Arc<Self>) -> Result<(), MessagingError> {
        self.on(
            |message| is_action(message, |action| matches!(action, Action::Register { .. })),
            |background, envelope| async move { background.on_register(&envelope).await },
        )?;
        self.on(
            |message| is_action(message, |action| matches!(action, Action::Alias { .. })),
            |background, envelope| async move { background.on_alias(&envelope).await },
        )?;
        self.on(
            |message| is_action(message, |action| matches!(action, Action::Delete { .. })),
            |background, envelope| async move { background.on_delete(&envelope).await },
        )?;
        self.on(
            |message| {
                matches!(message, Message::Computation(computation)
                    if computation.computation == ComputationKind::UrlGenerateRequest)
            },
            |background, envelope| async move { background.on_url_request(&envelope).await },
        )?;
        self.on(
            |message| is_action(message, |action| matches!(action, Action::Export)),
            |background, envelope| async move { background.on_export(&envelope).await },
        )?;
        self.on(
            |message| is_action(message, |action| matches!(action, Action::Import { .. })),
            |background, envelope| async move { background.on_import(&envelope).await },
        )?;
        self.on(
            |message| is_action(message, |action| matches!(action, Action::Configure { .. })),
            |background, envelope| async move { background.on_configure(&envelope).await },
        )?;
        info!(handlers = self.context.channel().handler_count(), "background handlers installed");
        Ok(())
    }

    /// Removes the handlers, which also releases their hold on `self`.
    pub fn uninstall(&self) -> usize {
        self.context.remove_handlers(BACKGROUND_TAG)
    }

    fn broadcast(&self, notification: Notification) {
        if let Some(error) = &notification.error {
            warn!(operation = ?notification.operation, %error, "operation failed");
        }
        let reached = self.context.broadcast(&Message::notification(notification));
        debug!(reached, "notification broadcast");
    }

    fn reply(&self, sender: Option<ConnectionId>, message: &Message) {
        let Some(sender) = sender else {
            self.context.broadcast(message);
            return;
        };
        if let Err(err) = self.context.send(sender, message) {
            warn!(peer = %sender, %err, "reply not delivered");
        }
    }

    async fn on_register(&self, envelope: &Envelope) {
        let Some(Action::Register { label, comic, source }) = envelope.message.as_action() else {
            return;
        };
        let _writes = self.writes.lock().await;
        let registered = self.register(label, comic, source).await;
        let snapshot = ComicSnapshot {
            label: Some(label.clone()),
            id: registered.as_ref().ok().copied(),
            tracking: comic.tracking,
        };
        self.broadcast(
            Notification::new("Register Comic")
                .with_error(registered.err().map(|err| err.message()))
                .with_comic(Some(snapshot), Some(source.clone())),
        );
    }

    async fn register(&self, label: &str, comic: &ComicSnapshot, source: &ComicSource) -> Result<ComicId, DataError> {
        let data = self.data();
        if !self.allow_duplicate_labels {
            data.ensure_label_available(label).await?;
        }
        data.register_comic(label, &source.reader, &comic_info(comic, source)).await
    }

    async fn on_alias(&self, envelope: &Envelope) {
        let Some(Action::Alias { comic, source }) = envelope.message.as_action() else {
            return;
        };
        let _writes = self.writes.lock().await;
        let aliased = match comic.id {
            Some(id) => self
                .data()
                .alias_comic(id, &source.reader, &comic_info(comic, source))
                .await
                .map_err(|err| err.message()),
            None => Err(missing_id()),
        };
        self.broadcast(
            Notification::new("Alias Comic")
                .with_error(aliased.err())
                .with_comic(Some(comic.clone()), Some(source.clone())),
        );
    }

    async fn on_delete(&self, envelope: &Envelope) {
        let Some(Action::Delete { comic, source }) = envelope.message.as_action() else {
            return;
        };
        let _writes = self.writes.lock().await;
        let data = self.data();
        let deleted = match (comic.id, source) {
            (None, _) => Err(missing_id()),
            (Some(id), None) => data.unregister_comic(id).await.map_err(|err| err.message()),
            (Some(id), Some(source)) => data
                .unalias_comic(id, &source.reader, &source.name)
                .await
                .map_err(|err| err.message()),
        };
        let operation = if source.is_some() { "Delete Comic Source" } else { "Delete Comic" };
        self.broadcast(
            Notification::new(operation)
                .with_error(deleted.err())
                .with_comic(Some(comic.clone()), source.clone()),
        );
    }

    async fn on_url_request(&self, envelope: &Envelope) {
        let Message::Computation(request) = &envelope.message else {
            return;
        };
        let response = match self.compute_url(&request.resource).await {
            Ok(url) => Computation::url_response(Some(url), None),
            Err(err) => {
                warn!(resource = ?request.resource, %err, "no resume URL");
                Computation::url_response(None, Some(err))
            }
        };
        self.reply(envelope.sender, &Message::Computation(response));
    }

    async fn compute_url(&self, resource: &UrlResource) -> Result<String, String> {
        let (Some(id), Some(reader)) = (resource.id, resource.reader.as_deref()) else {
            return Err("URL request without a comic id or reader".to_owned());
        };
        let comic = self
            .data()
            .get_comic(id)
            .await
            .map_err(|err| err.message())?
            .ok_or_else(|| DataError::NotFound { id }.message())?;
        self.sources.compute_url(reader, &comic).map_err(|err| err.to_string())
    }

    async fn on_export(&self, envelope: &Envelope) {
        let notification = match self.data().export().await {
            Ok(payload) => Notification {
                payload: Some(payload),
                ..Notification::new("export")
            },
            Err(err) => Notification::new("export").with_error(Some(err.message())),
        };
        self.reply(envelope.sender, &Message::notification(notification));
    }

    async fn on_import(&self, envelope: &Envelope) {
        let Some(Action::Import { payload }) = envelope.message.as_action() else {
            return;
        };
        let _writes = self.writes.lock().await;
        let imported = self.data().import(payload).await;
        if imported.is_ok() {
            info!(engine = %self.engine(), "store replaced by import");
        }
        self.broadcast(Notification::new("import").with_error(imported.err().map(|err| err.message())));
    }

    async fn on_configure(&self, envelope: &Envelope) {
        let Some(Action::Configure { module, source, target }) = envelope.message.as_action() else {
            return;
        };
        let configured = self.configure(module, source.as_deref(), target).await;
        self.broadcast(Notification {
            module: Some(module.clone()),
            ..Notification::new("configure").with_error(configured.err())
        });
    }

    /// Copies the store into the `target` area, persists the choice, then
    /// moves every later operation onto the new store.
    pub async fn configure(&self, module: &str, source: Option<&str>, target: &str) -> Result<(), String> {
        if module != STORAGE_MODULE {
            return Err(format!("module {module} cannot be configured"));
        }
        let target = StorageEngine::from_name(target).ok_or_else(|| format!("unknown storage engine {target}"))?;
        let _writes = self.writes.lock().await;
        let mut settings = self.settings.lock().await;
        let current = self.engine();
        if let Some(source) = source
            && StorageEngine::from_name(source) != Some(current)
        {
            warn!(%source, %current, "configure request assumed another storage engine");
        }
        if current == target {
            debug!(%target, "storage engine unchanged");
            return Ok(());
        }

        let storage = self
            .areas
            .facade(self.compat, target)
            .ok_or_else(|| format!("storage engine {target} is not available"))?;
        let next = DataApi::new(storage);
        let copied = self.data().copy_into(&next).await.map_err(|err| err.message())?;
        settings
            .set(STORAGE_ENGINE, Value::String(target.name().to_owned()))
            .await
            .map_err(|err| err.message())?;
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Active {
            engine: target,
            data: next,
        };
        info!(from = %current, to = %target, copied, "storage engine switched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmc_api_types::Tracking;
    use bmc_compat::CallMode;
    use bmc_messaging::{ChannelEvent, ChannelTransport};
    use bmc_messaging::local::{LocalChannel, LocalPeer};
    use bmc_storage::{InMemoryArea, SETTINGS_KEY};
    use serde_json::json;

    struct Hub {
        background: Arc<Background>,
        context: Arc<BackgroundContext>,
        channel: Arc<LocalChannel>,
        local: Arc<InMemoryArea>,
        sync: Arc<InMemoryArea>,
    }

    async fn hub(allow_duplicate_labels: bool) -> anyhow::Result<Hub> {
        let local = Arc::new(InMemoryArea::new("LocalStorage"));
        let sync = Arc::new(InMemoryArea::new("SyncStorage"));
        let areas = AreaSet::new(local.clone(), Some(sync.clone()));
        let compat = CompatibilityLayer::new(CallMode::Callback);
        let channel = Arc::new(LocalChannel::default());
        let context = Arc::new(BackgroundContext::new(ChannelTransport::new(channel.clone())));
        let background = Arc::new(
            Background::open(context.clone(), areas, compat, sources(), allow_duplicate_labels).await?,
        );
        background.install()?;
        Ok(Hub {
            background,
            context,
            channel,
            local,
            sync,
        })
    }

    impl Hub {
        async fn connect(&self, label: &str) -> anyhow::Result<(ConnectionId, Arc<LocalPeer>)> {
            let (id, peer) = self.channel.connect(label, None);
            self.context.channel().dispatch_next().await.unwrap()?;
            Ok((id, peer))
        }

        async fn send(&self, from: ConnectionId, data: Value) -> anyhow::Result<()> {
            self.channel.message(from, data);
            self.context.channel().dispatch_next().await.unwrap()?;
            Ok(())
        }
    }

    fn register(label: &str, name: &str) -> Value {
        json!({
            "type": "action",
            "action": "register",
            "label": label,
            "comic": {"label": label, "tracking": {"chapter": 3, "page": 2}},
            "source": {"reader": "localhost", "name": name},
        })
    }

    #[tokio::test]
    async fn register_broadcasts_to_every_peer() -> anyhow::Result<()> {
        let hub = hub(false).await?;
        let (sidebar, sidebar_peer) = hub.connect("sidebar").await?;
        let (_, options_peer) = hub.connect("options").await?;

        hub.send(sidebar, register("Naruto", "naruto")).await?;

        for peer in [&sidebar_peer, &options_peer] {
            let received = peer.take_received();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0]["operation"], json!("Register Comic"));
            assert_eq!(received[0]["comic"]["id"], json!(0));
            assert!(received[0].get("error").is_none());
        }
        let comic = hub.background.data().get_comic(0).await?.unwrap();
        assert_eq!(comic.tracking(), Tracking::new(3, Some(2)));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_labels_are_refused_unless_allowed() -> anyhow::Result<()> {
        let strict = hub(false).await?;
        let (peer_id, peer) = strict.connect("sidebar").await?;
        strict.send(peer_id, register("Naruto", "naruto")).await?;
        strict.send(peer_id, register("Naruto", "naruto-shippuden")).await?;
        let received = peer.take_received();
        assert!(received[1]["error"].is_string());
        assert_eq!(strict.background.data().list().await?.len(), 1);

        let lenient = hub(true).await?;
        let (peer_id, _) = lenient.connect("sidebar").await?;
        lenient.send(peer_id, register("Naruto", "naruto")).await?;
        lenient.send(peer_id, register("Naruto", "naruto-shippuden")).await?;
        assert_eq!(lenient.background.data().list().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn alias_then_delete_source_then_comic() -> anyhow::Result<()> {
        let hub = hub(false).await?;
        let (peer_id, peer) = hub.connect("sidebar").await?;
        hub.send(peer_id, register("Naruto", "naruto")).await?;
        hub.send(
            peer_id,
            json!({
                "type": "action",
                "action": "alias",
                "comic": {"label": "Naruto", "id": 0, "tracking": {"chapter": 3}},
                "source": {"reader": "localhost", "name": "naruto-alt"},
            }),
        )
        .await?;
        assert_eq!(hub.background.data().get_comic(0).await?.unwrap().sources().len(), 2);

        hub.send(
            peer_id,
            json!({
                "type": "action",
                "action": "delete",
                "comic": {"id": 0},
                "source": {"reader": "localhost", "name": "naruto-alt"},
            }),
        )
        .await?;
        hub.send(peer_id, json!({"type": "action", "action": "delete", "comic": {"id": 0}}))
            .await?;

        let operations: Vec<Value> = peer
            .take_received()
            .into_iter()
            .map(|data| data["operation"].clone())
            .collect();
        assert_eq!(
            operations,
            vec![
                json!("Register Comic"),
                json!("Alias Comic"),
                json!("Delete Comic Source"),
                json!("Delete Comic")
            ]
        );
        assert!(hub.background.data().get_comic(0).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn url_response_goes_to_the_requester_only() -> anyhow::Result<()> {
        let hub = hub(false).await?;
        let (sidebar, sidebar_peer) = hub.connect("sidebar").await?;
        let (_, other_peer) = hub.connect("sidebar").await?;
        hub.send(sidebar, register("Naruto", "naruto")).await?;
        sidebar_peer.take_received();
        other_peer.take_received();

        let request = Message::Computation(Computation::url_request(0, "localhost")).to_value();
        hub.send(sidebar, request).await?;
        let missing = Message::Computation(Computation::url_request(9, "localhost")).to_value();
        hub.send(sidebar, missing).await?;

        let received = sidebar_peer.take_received();
        assert_eq!(received[0]["computation"], json!("URL:Generate:Response"));
        assert_eq!(received[0]["resource"]["url"], json!("http://localhost:5000/naruto/3/2"));
        assert!(received[1]["err"].is_string());
        assert!(other_peer.take_received().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn export_then_import_restores_the_store() -> anyhow::Result<()> {
        let hub = hub(false).await?;
        let (peer_id, peer) = hub.connect("options").await?;
        hub.send(peer_id, register("Naruto", "naruto")).await?;
        hub.send(peer_id, json!({"type": "action", "action": "export"})).await?;
        let exported = peer.take_received().pop().unwrap();
        assert_eq!(exported["operation"], json!("export"));
        let payload = exported["payload"].as_str().unwrap().to_owned();

        hub.send(peer_id, json!({"type": "action", "action": "delete", "comic": {"id": 0}}))
            .await?;
        assert!(hub.background.data().list().await?.is_empty());

        hub.send(peer_id, json!({"type": "action", "action": "import", "payload": payload}))
            .await?;
        let imported = peer.take_received().pop().unwrap();
        assert_eq!(imported["operation"], json!("import"));
        assert!(imported.get("error").is_none());
        assert_eq!(hub.background.data().list().await?.len(), 1);

        hub.send(peer_id, json!({"type": "action", "action": "import", "payload": "not json"}))
            .await?;
        assert!(peer.take_received().pop().unwrap()["error"].is_string());
        Ok(())
    }

    #[tokio::test]
    async fn configure_moves_the_store_and_persists_the_choice() -> anyhow::Result<()> {
        let hub = hub(false).await?;
        assert_eq!(hub.background.engine(), StorageEngine::Sync);
        let (peer_id, peer) = hub.connect("options").await?;
        hub.send(peer_id, register("Naruto", "naruto")).await?;

        hub.send(
            peer_id,
            json!({
                "type": "action",
                "action": "configure",
                "module": "storage",
                "source": "SyncStorage",
                "target": "LocalStorage",
            }),
        )
        .await?;
        let configured = peer.take_received().pop().unwrap();
        assert_eq!(configured["operation"], json!("configure"));
        assert_eq!(configured["module"], json!("storage"));
        assert!(configured.get("error").is_none());

        assert_eq!(hub.background.engine(), StorageEngine::Local);
        assert_eq!(hub.background.data().storage().area_name(), "LocalStorage");
        assert_eq!(hub.background.data().find_comic("localhost", "naruto").await?, Some(0));
        assert_eq!(
            hub.local.snapshot()[SETTINGS_KEY][STORAGE_ENGINE],
            json!("LocalStorage")
        );
        assert!(!hub.sync.snapshot().is_empty());

        let err = hub.background.configure("sidebar", None, "LocalStorage").await.unwrap_err();
        assert!(err.contains("sidebar"));
        assert!(hub.background.configure("storage", None, "Cloud").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn uninstall_releases_every_handler() -> anyhow::Result<()> {
        let hub = hub(false).await?;
        assert_eq!(hub.background.uninstall(), 7);
        assert_eq!(hub.context.channel().handler_count(), 0);
        assert_eq!(Arc::strong_count(&hub.background), 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_registrations_keep_labels_unique() -> anyhow::Result<()> {
        let hub = hub(false).await?;
        let (peer_id, peer) = hub.connect("sidebar").await?;
        let channel = hub.context.channel();
        let event = |name: &str| ChannelEvent::Message {
            id: peer_id,
            data: register("Naruto", name),
        };

        let (first, second) = tokio::join!(
            channel.dispatch(event("naruto")),
            channel.dispatch(event("naruto-shippuden"))
        );
        first?;
        second?;

        let errors = peer
            .take_received()
            .iter()
            .filter(|data| data["error"].is_string())
            .count();
        assert_eq!(errors, 1);
        assert_eq!(hub.background.data().list().await?.len(), 1);
        Ok(())
    }
}
