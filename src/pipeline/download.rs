//! The downloader: a serial supervisor over the fetcher subprocess.
//!
//! One item at a time by design: the fetcher is network- and CPU-heavy and
//! the upstream has its own rate limits. While a fetch runs, a progress
//! tracker watches its logs and a heartbeat loop keeps the lease alive; the
//! outcome is classified into done, retriable, permanent failure, or a
//! system error with a cooldown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{FetchError, FetchRequest, FetchResult, Fetcher};
use crate::config::DownloaderSettings;
use crate::index::{Index, Item, RetryMode, Status, StorageRef};
use crate::pipeline::progress::{self, TrackerConfig};
use crate::storage::{Storages, Volume};
use crate::util::{ibytes, sleep_cancellable};

const TICK: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

#[derive(Debug, PartialEq)]
enum Outcome {
    Continue,
    Cooldown,
}

pub struct Downloader {
    index: Arc<Index>,
    storages: Arc<Storages>,
    fetcher: Arc<Fetcher>,
    logs_dir: PathBuf,
    settings: DownloaderSettings,
    critical: CancellationToken,
    tick: Duration,
}

impl Downloader {
    pub fn new(
        index: Arc<Index>,
        storages: Arc<Storages>,
        fetcher: Arc<Fetcher>,
        logs_dir: PathBuf,
        settings: DownloaderSettings,
        critical: CancellationToken,
    ) -> Self {
        Self {
            index,
            storages,
            fetcher,
            logs_dir,
            settings,
            critical,
            tick: TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Serve until `graceful` fires. An in-flight fetch keeps running: its
    /// context derives from the critical token, not the graceful one.
    pub async fn run(&self, graceful: CancellationToken) {
        info!("downloader: starting");

        loop {
            if !sleep_cancellable(&graceful, self.tick).await {
                return;
            }

            let popped = match self.index.pop(1).await {
                Ok(popped) => popped,
                Err(err) => {
                    error!(error = %err, "index pop failed");
                    continue;
                }
            };
            let Some(item) = popped.into_iter().next() else {
                continue;
            };

            let volume = match self.storages.get() {
                Ok(volume) => volume,
                Err(err) => {
                    warn!(error = %err, "could not find a suitable storage");
                    if let Err(err) = self.index.retry(&item.id, RetryMode::Infinite).await {
                        error!(id = %item.id, error = %err, "index error");
                    }
                    sleep_cancellable(&graceful, self.settings.cooldown).await;
                    continue;
                }
            };

            if self.process(&item, &volume).await == Outcome::Cooldown {
                sleep_cancellable(&graceful, self.settings.cooldown).await;
            }
        }
    }

    /// Run one fetch for a leased item: launch the fetcher with progress
    /// tracking and heartbeats, then classify the outcome.
    async fn process(&self, item: &Item, volume: &Volume) -> Outcome {
        info!(id = %item.id, "downloading");

        // Destination subpath is derived from the publish time; an item can
        // only get here through admission, which sets it.
        let published = match item.meta.as_ref().and_then(|meta| meta.published_at) {
            Some(at) => at,
            None => {
                warn!(id = %item.id, "item has no publish time");
                Utc::now()
            }
        };
        let dst = volume
            .path
            .join(published.format("%Y").to_string())
            .join(published.format("%m").to_string())
            .join(format!("{}_{}", published.format("%Y%m%d"), item.id));

        let log_path = self.logs_dir.join(format!(
            "{}_{}.log",
            Utc::now().format("%Y%m%d-%H%M%S"),
            item.id
        ));
        let url = format!("{}{}", WATCH_URL_PREFIX, item.id);

        let fetch = self.critical.child_token();

        let tracker = tokio::spawn(progress::track(
            fetch.clone(),
            log_path.clone(),
            Some(companion_log(&log_path)),
            TrackerConfig::default(),
        ));
        let heartbeat = tokio::spawn(beat_loop(
            fetch.clone(),
            self.index.clone(),
            item.id.clone(),
        ));

        let result = self
            .fetcher
            .run(
                &fetch,
                FetchRequest {
                    url: &url,
                    log_path: &log_path,
                    root: &volume.path,
                    dst: &dst,
                },
                self.settings.fetch_timeout,
            )
            .await;

        fetch.cancel();
        let _ = tracker.await;
        let _ = heartbeat.await;

        self.settle(item, volume, result).await
    }

    /// Commit the fetch outcome to the index: DONE, limited or infinite
    /// retry, or permanent failure.
    async fn settle(
        &self,
        item: &Item,
        volume: &Volume,
        result: Result<Vec<FetchResult>, FetchError>,
    ) -> Outcome {
        match result {
            Ok(results) => {
                let mut matched = false;
                for res in results {
                    if res.id != item.id {
                        debug!(id = %res.id, leased = %item.id, "ignoring result for another id");
                        continue;
                    }
                    matched = true;

                    let total: u64 = res.files.iter().map(|file| file.size).sum();
                    let mut done = item.clone();
                    done.status = Status::Done;
                    done.storages = vec![StorageRef {
                        id: volume.id.clone(),
                    }];
                    done.files = res.files;
                    done.reason.clear();

                    if let Err(err) = self.index.put(vec![done]).await {
                        error!(id = %item.id, error = %err, "index error");
                        self.retry(&item.id, RetryMode::Limited).await;
                        return Outcome::Continue;
                    }
                    info!(id = %item.id, size = %ibytes(total), "download completed");
                }

                if !matched {
                    warn!(id = %item.id, "fetcher returned no result for the leased item");
                    self.retry(&item.id, RetryMode::Limited).await;
                }
                Outcome::Continue
            }

            Err(err) if err.is_system() => {
                warn!(id = %item.id, error = %err, "system error, cooling down");
                self.retry(&item.id, RetryMode::Infinite).await;
                Outcome::Cooldown
            }

            Err(FetchError::Script { error, .. }) => {
                if let Some(pattern) = self.match_non_retriable(&error) {
                    info!(id = %item.id, pattern, "permanent failure");
                    let mut failed = item.clone();
                    failed.status = Status::Failed;
                    failed.reason = error;
                    if let Err(err) = self.index.put(vec![failed]).await {
                        error!(id = %item.id, error = %err, "index error");
                    }
                } else {
                    warn!(id = %item.id, error = %error, "download error");
                    self.retry(&item.id, RetryMode::Limited).await;
                }
                Outcome::Continue
            }

            Err(FetchError::Cancelled) if self.critical.is_cancelled() => {
                // Shutting down: hand the lease back without counting it.
                self.retry(&item.id, RetryMode::Infinite).await;
                Outcome::Continue
            }

            // Timeouts, idle-watchdog cancellations, unknown exits.
            Err(err) => {
                warn!(id = %item.id, error = %err, "download error");
                self.retry(&item.id, RetryMode::Limited).await;
                Outcome::Continue
            }
        }
    }

    /// Hand a lease back to the queue, logging instead of failing
    async fn retry(&self, id: &str, mode: RetryMode) {
        if let Err(err) = self.index.retry(id, mode).await {
            error!(id, error = %err, "index error");
        }
    }

    /// First configured permanent-failure pattern the error text contains
    fn match_non_retriable(&self, error: &str) -> Option<&str> {
        let lowered = error.to_lowercase();
        self.settings
            .non_retriable
            .iter()
            .find(|pattern| lowered.contains(&pattern.to_lowercase()))
            .map(|pattern| pattern.as_str())
    }
}

async fn beat_loop(token: CancellationToken, index: Arc<Index>, id: String) {
    loop {
        index.beat(&id);
        if !sleep_cancellable(&token, HEARTBEAT_INTERVAL).await {
            return;
        }
    }
}

/// `dl.log → dl-ffmpeg.log`, the companion tool's log next to the main one.
fn companion_log(log_path: &Path) -> PathBuf {
    let stem = log_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    log_path.with_file_name(format!("{}-ffmpeg.log", stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn companion_log_sits_next_to_the_main_log() {
        assert_eq!(
            companion_log(Path::new("/logs/20240102-030405_VIDEOAAAAAA.log")),
            Path::new("/logs/20240102-030405_VIDEOAAAAAA-ffmpeg.log")
        );
    }
}
