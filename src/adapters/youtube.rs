//! Authenticated client for the upstream REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{ApiError, MetadataSource, PlaylistPage, PlaylistSource, VideoInfo};
use crate::config::OAuth;

const VIDEOS_URL: &str = "https://www.googleapis.com/youtube/v3/videos";
const PLAYLIST_ITEMS_URL: &str = "https://www.googleapis.com/youtube/v3/playlistItems";

/// Upstream page size for playlist pagination.
pub const PAGE_SIZE: &str = "50";

pub struct YoutubeClient {
    http: reqwest::Client,
    access_token: String,
}

#[derive(Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsResponse {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    #[serde(default)]
    content_details: PlaylistItemDetails,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemDetails {
    #[serde(default)]
    video_id: String,
}

#[derive(Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorInfo,
}

#[derive(Default, Deserialize)]
struct ErrorInfo {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Default, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

impl YoutubeClient {
    pub fn new(oauth: &OAuth) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            access_token: oauth.access_token.clone(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        debug!(url, "api request");

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            if body.error.errors.iter().any(|e| e.reason == "quotaExceeded") {
                return Err(ApiError::QuotaExceeded);
            }
            return Err(ApiError::Status {
                code: status.as_u16(),
                message: body.error.message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl MetadataSource for YoutubeClient {
    async fn videos(&self, ids: &[String]) -> Result<Vec<VideoInfo>, ApiError> {
        let joined = ids.join(",");
        let response: VideoListResponse = self
            .get_json(
                VIDEOS_URL,
                &[("part", "snippet,contentDetails"), ("id", joined.as_str())],
            )
            .await?;
        Ok(response.items)
    }
}

#[async_trait]
impl PlaylistSource for YoutubeClient {
    async fn playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, ApiError> {
        let mut query = vec![
            ("part", "contentDetails"),
            ("maxResults", PAGE_SIZE),
            ("playlistId", playlist_id),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let response: PlaylistItemsResponse =
            self.get_json(PLAYLIST_ITEMS_URL, &query).await?;

        Ok(PlaylistPage {
            ids: response
                .items
                .into_iter()
                .map(|item| item.content_details.video_id)
                .filter(|id| !id.is_empty())
                .collect(),
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}
