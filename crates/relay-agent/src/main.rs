use std::{path::Path, sync::Arc};

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod acquisition;
mod cleanup;
mod command;
mod config;
mod dispatch;
mod error;
mod messenger;
mod pipeline;
mod runner;
mod store;
mod support;
mod telegram;
mod throttle;
mod thumbnail;
mod upload;

#[cfg(test)]
mod testing;

use crate::acquisition::AcquisitionMonitor;
use crate::cleanup::ArtifactLayout;
use crate::dispatch::Dispatcher;
use crate::messenger::Messenger;
use crate::pipeline::DeliveryPipeline;
use crate::runner::JobRunner;
use crate::store::{AppStore, SeaOrmStore};
use crate::telegram::TelegramClient;
use crate::thumbnail::HttpThumbnails;
use crate::upload::Uploader;

/// Console always; a daily-rolling file as well when a log dir is configured.
/// The returned guard must live until exit so buffered lines get flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let Some(dir) = log_dir else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    };

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "relay-agent.log"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::AgentConfig::from_env()?;
    let _log_guard = init_tracing(cfg.log_dir.as_deref());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        artifact_root = %cfg.artifact_root.display(),
        tool = %cfg.tool.command,
        queue_capacity = cfg.queue_capacity,
        "relay-agent starting"
    );

    let store = Arc::new(SeaOrmStore::new(cfg.database_url.clone()));
    store.migrate().await?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("relay-agent/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build http client")?;
    let telegram = TelegramClient::new(http.clone(), &cfg.telegram_api_url, &cfg.telegram_token);
    let messenger: Arc<dyn Messenger> = Arc::new(telegram.clone());
    let layout = ArtifactLayout::new(&cfg.artifact_root);

    let acquirer = Arc::new(AcquisitionMonitor::new(
        cfg.tool.clone(),
        messenger.clone(),
        cfg.timeouts.tool,
    ));
    let uploader = Uploader::new(
        messenger.clone(),
        store.clone(),
        Arc::new(HttpThumbnails::new(http)),
        layout.clone(),
        cfg.progress_window,
        cfg.timeouts.upload,
    );
    let pipeline = DeliveryPipeline::new(
        store.clone(),
        acquirer,
        uploader,
        messenger.clone(),
        layout.clone(),
    );
    let runner = JobRunner::new(cfg.queue_capacity, Arc::new(pipeline));
    let dispatcher = Arc::new(Dispatcher::new(
        runner.clone(),
        messenger,
        store.clone(),
        layout,
        cfg.access.clone(),
        cfg.queue_capacity,
    ));

    tokio::select! {
        _ = telegram::run_update_loop(telegram, dispatcher) => {}
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            tracing::info!("shutdown requested");
        }
    }

    let snapshot = runner.snapshot();
    if let Some(item_id) = &snapshot.in_flight {
        tracing::warn!(
            %item_id,
            pending = snapshot.pending.len(),
            completed = runner.completed_count(),
            "shutting down with jobs outstanding"
        );
    }
    store.close().await;
    Ok(())
}
