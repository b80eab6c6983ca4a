//! Service wiring: builds the index, storages and adapters, then runs the
//! pipeline stages until shutdown.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::adapters::{Browser, Fetcher, Updater, YoutubeClient};
use crate::config::Config;
use crate::index::Index;
use crate::pipeline::{discover, Downloader, Enqueuer};
use crate::storage::Storages;
use crate::supervisor;

/// Run the archival service until shutdown: crawlers and the enqueuer stop
/// on the first termination signal, an in-flight fetch only on the second.
pub async fn run(config: Config, disable_download: bool) -> Result<()> {
    let signals = supervisor::install().context("could not install signal handlers")?;

    let storages = Arc::new(Storages::new(
        config
            .storages
            .iter()
            .map(|entry| entry.path.clone())
            .collect(),
    ));
    storages.verify().context("storage configuration error")?;

    if !config.youtube.oauth.is_complete() {
        bail!("youtube.oauth.{{access_token, token_type, refresh_token}} are required to start");
    }

    let index = Index::open(config.index_path(), config.index.options())
        .await
        .context("could not open index")?;

    let client = Arc::new(YoutubeClient::new(&config.youtube.oauth)?);

    let mut tasks = JoinSet::new();

    if config.sources.history.enable {
        let browser = Arc::new(Browser::new(&config.browser)?);
        tasks.spawn(discover::run_history(
            signals.graceful.clone(),
            index.clone(),
            browser,
            config.sources.update_interval,
        ));
    }

    if !config.sources.playlists.is_empty() {
        tasks.spawn(discover::run_playlists(
            signals.graceful.clone(),
            index.clone(),
            client.clone(),
            config.sources.playlists.clone(),
            config.sources.update_interval,
        ));
    }

    let enqueuer = Enqueuer::new(
        index.clone(),
        client,
        config.sources.max_duration,
        config.downloader.cooldown,
    );
    let graceful = signals.graceful.clone();
    tasks.spawn(async move { enqueuer.run(graceful).await });

    if disable_download {
        warn!("downloader is disabled");
    } else {
        let updater = Updater::new(
            config.tool_root(),
            config.python.youtube_dl.version.clone(),
            config.python.youtube_dl.update_interval,
        )?;
        let graceful = signals.graceful.clone();
        tasks.spawn(async move { updater.run(graceful).await });

        let fetcher = Arc::new(Fetcher::new(
            config.python.executable.clone(),
            config.fetcher_script(),
            config.tool_root(),
            config.fetch_cache(),
            ydl_opts(&config),
        ));
        let downloader = Downloader::new(
            index.clone(),
            storages,
            fetcher,
            config.logs_dir(),
            config.downloader.clone(),
            signals.critical.clone(),
        );
        let graceful = signals.graceful.clone();
        tasks.spawn(async move { downloader.run(graceful).await });
    }

    info!("service started");
    signals.graceful.cancelled().await;
    info!("shutting down");

    while tasks.join_next().await.is_some() {}

    index.close().await?;
    Ok(())
}

/// Tool options forwarded to the fetcher through `YDL_OPTS`.
fn ydl_opts(config: &Config) -> Option<serde_json::Value> {
    let mut opts = config.python.youtube_dl.options.clone();
    if config.python.youtube_dl.lite {
        let mut map = match opts.take() {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        map.insert("lite".to_string(), serde_json::Value::Bool(true));
        opts = Some(serde_json::Value::Object(map));
    }
    opts
}
