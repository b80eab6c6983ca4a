//! External collaborators: the metadata/playlist REST API, the headless
//! browser, the fetcher subprocess, and the upstream-tool updater.
//!
//! The pipeline stages only see the traits defined here, so tests can swap
//! in deterministic fakes.

pub mod browser;
pub mod fetcher;
pub mod ydl;
pub mod youtube;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub use browser::Browser;
pub use fetcher::{FetchError, FetchRequest, FetchResult, Fetcher};
pub use ydl::Updater;
pub use youtube::YoutubeClient;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("api quota exceeded")]
    QuotaExceeded,

    #[error("api error {code}: {message}")]
    Status { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Upstream record for one video, as returned by the metadata API with the
/// `snippet,contentDetails` part selectors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub id: String,
    #[serde(default)]
    pub snippet: Snippet,
    #[serde(default)]
    pub content_details: ContentDetails,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub channel_title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// RFC 3339 publish time, parsed at admission.
    #[serde(default)]
    pub published_at: String,
    /// `"live"` marks an ongoing broadcast.
    #[serde(default)]
    pub live_broadcast_content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentDetails {
    /// ISO-8601 duration, parsed at admission.
    #[serde(default)]
    pub duration: String,
}

/// One page of playlist items.
#[derive(Debug, Clone, Default)]
pub struct PlaylistPage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Batch metadata lookup. Ids missing from the result are unavailable or
/// deleted upstream.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn videos(&self, ids: &[String]) -> Result<Vec<VideoInfo>, ApiError>;
}

/// Paginated read of a user-owned playlist.
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, ApiError>;
}

/// The decoded page-data blob from the user's watch-history feed.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn history_blob(&self) -> anyhow::Result<serde_json::Value>;
}
