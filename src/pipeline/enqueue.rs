//! Metadata enrichment and the admission policy.
//!
//! Every tick, a batch of `NEW` items is looked up in one metadata request
//! and each item is admitted, skipped, or failed. The whole batch commits
//! through one `put`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::{MetadataSource, VideoInfo};
use crate::index::{Index, Item, Meta, Status};
use crate::util::{parse_iso8601_duration, sleep_cancellable};

/// Upstream batch lookups take at most this many ids per request.
pub const BATCH_SIZE: usize = 50;

const DEFAULT_TICK: Duration = Duration::from_secs(5);

pub struct Enqueuer {
    index: Arc<Index>,
    client: Arc<dyn MetadataSource>,
    max_duration: Duration,
    cooldown: Duration,
    tick: Duration,
}

impl Enqueuer {
    pub fn new(
        index: Arc<Index>,
        client: Arc<dyn MetadataSource>,
        max_duration: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            index,
            client,
            max_duration,
            cooldown,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub async fn run(&self, token: CancellationToken) {
        info!("enqueuer: starting");

        loop {
            if let Err(err) = self.tick_once().await {
                warn!(error = %err, "enqueuer error");
                if !sleep_cancellable(&token, self.cooldown).await {
                    return;
                }
            }
            if !sleep_cancellable(&token, self.tick).await {
                return;
            }
        }
    }

    async fn tick_once(&self) -> anyhow::Result<()> {
        let mut batch = self.index.get(Status::New, BATCH_SIZE).await?;
        if batch.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = batch.iter().map(|item| item.id.clone()).collect();
        let results = self.client.videos(&ids).await?;

        let by_id: HashMap<&str, &VideoInfo> =
            results.iter().map(|info| (info.id.as_str(), info)).collect();

        for item in &mut batch {
            admit(item, by_id.get(item.id.as_str()).copied(), self.max_duration);
        }

        let summary = status_summary(&batch);
        self.index.put(batch).await?;
        info!(%summary, "enqueuer");
        Ok(())
    }
}

/// Decide what happens to a `NEW` item given its metadata lookup result.
pub fn admit(item: &mut Item, info: Option<&VideoInfo>, max_duration: Duration) {
    let Some(info) = info else {
        item.status = Status::Failed;
        item.reason = "unavailable or deleted".to_string();
        return;
    };

    let published_at = match DateTime::parse_from_rfc3339(&info.snippet.published_at) {
        Ok(at) => at.with_timezone(&Utc),
        Err(err) => {
            item.status = Status::Failed;
            item.reason = format!("could not parse upload time: {}", err);
            return;
        }
    };

    let duration = match parse_iso8601_duration(&info.content_details.duration) {
        Ok(duration) => duration,
        Err(err) => {
            item.status = Status::Failed;
            item.reason = format!("could not parse duration: {}", err);
            return;
        }
    };

    item.meta = Some(Meta {
        title: info.snippet.title.clone(),
        description: info.snippet.description.clone(),
        channel_id: info.snippet.channel_id.clone(),
        channel_title: info.snippet.channel_title.clone(),
        tags: info.snippet.tags.clone(),
        published_at: Some(published_at),
    });
    item.status = Status::Enqueued;

    if info.snippet.live_broadcast_content == "live" {
        item.status = Status::Skipped;
        item.reason = "live".to_string();
    }
    if duration > max_duration {
        item.status = Status::Skipped;
        item.reason = "too long".to_string();
    }
}

fn status_summary(items: &[Item]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for item in items {
        *counts.entry(item.status.as_str()).or_default() += 1;
    }
    counts
        .iter()
        .map(|(status, n)| format!("{}={}", status, n))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ContentDetails, Snippet};

    fn info(id: &str) -> VideoInfo {
        VideoInfo {
            id: id.to_string(),
            snippet: Snippet {
                title: "T".to_string(),
                published_at: "2024-01-02T03:04:05Z".to_string(),
                live_broadcast_content: "none".to_string(),
                ..Snippet::default()
            },
            content_details: ContentDetails {
                duration: "PT1M30S".to_string(),
            },
        }
    }

    fn max() -> Duration {
        Duration::from_secs(9 * 3600)
    }

    #[test]
    fn admits_an_ordinary_video() {
        let mut item = Item::new("VIDEOAAAAAA");
        admit(&mut item, Some(&info("VIDEOAAAAAA")), max());

        assert_eq!(item.status, Status::Enqueued);
        let meta = item.meta.unwrap();
        assert_eq!(meta.title, "T");
        assert_eq!(
            meta.published_at.unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn missing_lookup_fails_the_item() {
        let mut item = Item::new("VIDEOAAAAAA");
        admit(&mut item, None, max());

        assert_eq!(item.status, Status::Failed);
        assert_eq!(item.reason, "unavailable or deleted");
    }

    #[test]
    fn live_broadcasts_are_skipped() {
        let mut item = Item::new("VIDEOAAAAAA");
        let mut live = info("VIDEOAAAAAA");
        live.snippet.live_broadcast_content = "live".to_string();
        admit(&mut item, Some(&live), max());

        assert_eq!(item.status, Status::Skipped);
        assert_eq!(item.reason, "live");
        assert!(item.meta.is_some());
    }

    #[test]
    fn overlong_videos_are_skipped() {
        let mut item = Item::new("VIDEOAAAAAA");
        let mut long = info("VIDEOAAAAAA");
        long.content_details.duration = "PT10H".to_string();
        admit(&mut item, Some(&long), max());

        assert_eq!(item.status, Status::Skipped);
        assert_eq!(item.reason, "too long");
    }

    #[test]
    fn parse_failures_fail_the_item() {
        let mut item = Item::new("VIDEOAAAAAA");
        let mut bad = info("VIDEOAAAAAA");
        bad.content_details.duration = "ninety seconds".to_string();
        admit(&mut item, Some(&bad), max());
        assert_eq!(item.status, Status::Failed);
        assert!(item.reason.starts_with("could not parse duration"));

        let mut item = Item::new("VIDEOBBBBBB");
        let mut bad = info("VIDEOBBBBBB");
        bad.snippet.published_at = "yesterday".to_string();
        admit(&mut item, Some(&bad), max());
        assert_eq!(item.status, Status::Failed);
        assert!(item.reason.starts_with("could not parse upload time"));
    }

    #[test]
    fn summary_counts_by_status() {
        let mut a = Item::new("a");
        a.status = Status::Enqueued;
        let mut b = Item::new("b");
        b.status = Status::Enqueued;
        let mut c = Item::new("c");
        c.status = Status::Skipped;

        assert_eq!(status_summary(&[a, b, c]), "ENQUEUED=2 SKIPPED=1");
    }
}
