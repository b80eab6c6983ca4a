//! Keeps the upstream download tool current.
//!
//! The fetcher imports `youtube_dl` from its working directory; this task
//! installs the configured release there and refreshes it on a fixed
//! cadence. Failures only log: the downloader keeps using whatever is
//! already installed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::util::sleep_cancellable;

const RELEASES_URL: &str = "https://api.github.com/repos/ytdl-org/youtube-dl/releases";
const VERSION_FILENAME: &str = "youtube-dl-version";
const PACKAGE_DIR: &str = "youtube_dl";

/// Individual files larger than this are not plausible package sources.
const ZIP_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Default, Deserialize)]
struct Release {
    #[serde(default)]
    tag_name: String,
    #[serde(default)]
    zipball_url: String,
}

pub struct Updater {
    http: reqwest::Client,
    root: PathBuf,
    version: String,
    interval: Duration,
}

impl Updater {
    /// `version` is a release tag or `latest`; `root` is the fetcher's
    /// working directory.
    pub fn new(root: PathBuf, version: String, interval: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("reelvault")
            .build()
            .context("could not build http client")?;

        Ok(Self {
            http,
            root,
            version,
            interval,
        })
    }

    /// Check immediately, then on every tick until cancelled.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            if let Err(err) = self.ensure().await {
                warn!(error = %err, "youtube-dl update failed");
            }
            if !sleep_cancellable(&token, self.interval).await {
                return;
            }
        }
    }

    /// Install or refresh the tool if the configured release differs from
    /// what the version file records.
    pub async fn ensure(&self) -> Result<()> {
        info!("checking for youtube-dl updates");

        let current = self.read_version().await;
        if let Some(version) = &current {
            info!(version, "current youtube-dl");
        }

        let release = self.release().await?;
        info!(version = %release.tag_name, "available youtube-dl");

        if current.as_deref() == Some(release.tag_name.as_str()) {
            info!("youtube-dl is up to date");
            return Ok(());
        }

        info!(tag = %release.tag_name, "downloading youtube-dl");
        let body = self
            .http
            .get(&release.zipball_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || unpack_package(&root, body.as_ref()))
            .await
            .context("unpack task failed")??;

        tokio::fs::write(self.root.join(VERSION_FILENAME), &release.tag_name).await?;
        info!(version = %release.tag_name, "youtube-dl installed");
        Ok(())
    }

    /// Resolve the configured release (`latest` or a pinned tag)
    async fn release(&self) -> Result<Release> {
        let url = if self.version == "latest" {
            format!("{}/latest", RELEASES_URL)
        } else {
            format!("{}/tags/{}", RELEASES_URL, self.version)
        };

        let release: Release = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if release.tag_name.is_empty() || release.zipball_url.is_empty() {
            bail!("release info is missing tag_name and/or zipball_url");
        }
        Ok(release)
    }

    /// Currently installed version, if the version file is present
    async fn read_version(&self) -> Option<String> {
        tokio::fs::read_to_string(self.root.join(VERSION_FILENAME))
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Extract the package directory from a release zipball into the tool root,
/// replacing any previous install. Zipball layout: `<repo>-<sha>/<pkg>/**`.
fn unpack_package(root: &Path, data: &[u8]) -> Result<()> {
    let target = root.join(PACKAGE_DIR);
    if target.exists() {
        std::fs::remove_dir_all(&target)?;
    }

    let marker = format!("/{}/", PACKAGE_DIR);
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(data))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || entry.size() > ZIP_MAX_FILE_SIZE {
            continue;
        }

        let name = entry.name().to_string();
        let Some((_, rel)) = name.split_once(marker.as_str()) else {
            continue;
        };
        if rel.is_empty() || rel.split('/').any(|part| part == "..") {
            continue;
        }

        let dest = target.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}
