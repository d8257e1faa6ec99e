mod config;
mod native;

use std::sync::Arc;

use anyhow::Context;
use bmc_background::Background;
use bmc_compat::{CallMode, CompatibilityLayer};
use bmc_messaging::{BackgroundContext, ChannelTransport, OriginPolicy};
use bmc_storage::{AreaSet, RocksDbArea};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::HubConfig;
use crate::native::NativeChannel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the native-messaging frames.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = HubConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;
    let local = RocksDbArea::open_default("LocalStorage", config.data_dir.join("local"))
        .context("opening the local store")?;
    let sync = RocksDbArea::open_default("SyncStorage", config.data_dir.join("sync"))
        .context("opening the sync store")?;
    let areas = AreaSet::new(Arc::new(local), Some(Arc::new(sync)));

    let compat = CompatibilityLayer::new(CallMode::Callback);

    let (outbound, queued) = mpsc::unbounded_channel();
    let host = Arc::new(NativeChannel::new(outbound));
    let mut channel = ChannelTransport::new(host.clone());
    if let Some(origin) = config.extension_origin.clone() {
        channel = channel.with_policy(OriginPolicy::new(origin, config.top_origin.clone()));
    }
    let context = Arc::new(BackgroundContext::new(channel));
    let background = Arc::new(
        Background::open(
            context.clone(),
            areas,
            compat,
            bmc_background::sources(),
            config.allow_duplicate_labels,
        )
        .await
        .context("opening the store")?,
    );
    background.install().context("installing background handlers")?;

    let writer = tokio::spawn(native::write_loop(tokio::io::stdout(), queued));
    let dispatcher = {
        let context = context.clone();
        tokio::spawn(async move { context.run().await })
    };
    info!(data_dir = %config.data_dir.display(), engine = %background.engine(), "bookmycomics hub ready");

    tokio::select! {
        read = native::read_loop(tokio::io::stdin(), &host) => read?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    host.close();
    dispatcher.await.context("dispatch loop panicked")?;
    background.uninstall();
    drop(background);
    drop(context);
    drop(host);
    writer.await.context("writer panicked")??;
    info!("hub stopped");
    Ok(())
}
