//! Source crawlers: watch history, playlists, one-shot imports.
//!
//! All crawlers are fire-and-forget into the index, which de-duplicates on
//! `push`; back-pressure comes from the downloader stage, never from here.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::adapters::{ApiError, HistorySource, PlaylistSource};
use crate::index::Index;
use crate::util::sleep_cancellable;

const VIDEO_ID_KEY: &str = "videoId";
const TITLE_URL_KEY: &str = "titleUrl";

/// Periodically pull the watch-history blob and push every id it mentions.
pub async fn run_history(
    token: CancellationToken,
    index: Arc<Index>,
    source: Arc<dyn HistorySource>,
    interval: Duration,
) {
    info!(interval = ?interval, "watch history crawler: starting");

    loop {
        debug!("watch history: checking for new videos");

        match source.history_blob().await {
            Ok(blob) => {
                let ids = extract_history_ids(&blob);
                match index.push(&ids).await {
                    Ok(n) if n > 0 => info!(count = n, "new videos from watch history"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "index push failed"),
                }
            }
            Err(err) => warn!(error = %err, "watch history error"),
        }

        debug!("watch history: done");
        if !sleep_cancellable(&token, interval).await {
            return;
        }
    }
}

/// Periodically page through the configured playlists.
pub async fn run_playlists(
    token: CancellationToken,
    index: Arc<Index>,
    source: Arc<dyn PlaylistSource>,
    playlists: BTreeMap<String, String>,
    interval: Duration,
) {
    info!(interval = ?interval, "playlists crawler: starting");

    loop {
        debug!("playlists: checking for new videos");
        crawl_playlists_once(&index, source.as_ref(), &playlists).await;
        debug!("playlists: done");

        if !sleep_cancellable(&token, interval).await {
            return;
        }
    }
}

/// One crawl over every playlist. Pagination continues while the upstream
/// yields a next page token and the last page contained at least one id the
/// index had not seen; zero accepted means we have caught up. A quota error
/// ends the whole batch, any other error only the current playlist.
pub async fn crawl_playlists_once(
    index: &Index,
    source: &dyn PlaylistSource,
    playlists: &BTreeMap<String, String>,
) {
    'batch: for (title, playlist_id) in playlists {
        let mut total = 0usize;
        let mut page_token: Option<String> = None;

        loop {
            let page = match source.playlist_page(playlist_id, page_token.as_deref()).await {
                Ok(page) => page,
                Err(ApiError::QuotaExceeded) => {
                    warn!("api quota exceeded, stopping playlist batch");
                    break 'batch;
                }
                Err(err) => {
                    warn!(playlist = %title, error = %err, "playlist error");
                    break;
                }
            };

            let accepted = match index.push(&page.ids).await {
                Ok(n) => n,
                Err(err) => {
                    warn!(playlist = %title, error = %err, "index push failed");
                    break;
                }
            };
            total += accepted;

            if accepted == 0 {
                break;
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        if total > 0 {
            info!(playlist = %title, count = total, "new videos from playlist");
        }
    }
}

/// One-shot takeout import: direct ids under `videoId` keys plus watch URLs
/// under `titleUrl` keys, from which the id is the `v` query parameter.
/// Returns `(extracted, inserted)`.
pub async fn import_file(index: &Index, path: &Path) -> Result<(usize, usize)> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("could not read file: {}", path.display()))?;
    let blob: Value = serde_json::from_str(&data).context("import file is not valid JSON")?;

    let ids = extract_import_ids(&blob);
    let inserted = index.push(&ids).await?;
    Ok((ids.len(), inserted))
}

/// Pull every `videoId` string value out of the page-data blob. A value
/// repeated immediately after itself is skipped, and the first occurrence
/// wins globally within the pass.
pub fn extract_history_ids(blob: &Value) -> Vec<String> {
    struct Pass {
        ids: Vec<String>,
        seen: HashSet<String>,
        last: Option<String>,
    }

    impl Pass {
        fn offer(&mut self, id: &str) {
            let repeat = self.last.as_deref() == Some(id);
            self.last = Some(id.to_string());
            if repeat {
                return;
            }
            if self.seen.insert(id.to_string()) {
                self.ids.push(id.to_string());
            }
        }
    }

    fn walk(value: &Value, pass: &mut Pass) {
        match value {
            Value::Object(map) => {
                for (key, val) in map {
                    if key == VIDEO_ID_KEY {
                        if let Some(id) = val.as_str() {
                            pass.offer(id);
                            continue;
                        }
                    }
                    walk(val, pass);
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, pass);
                }
            }
            _ => {}
        }
    }

    let mut pass = Pass {
        ids: Vec::new(),
        seen: HashSet::new(),
        last: None,
    };
    walk(blob, &mut pass);
    pass.ids
}

pub fn extract_import_ids(blob: &Value) -> Vec<String> {
    let mut ids = Vec::new();

    collect_key_strings(blob, VIDEO_ID_KEY, &mut |value| {
        ids.push(value.to_string());
    });
    collect_key_strings(blob, TITLE_URL_KEY, &mut |value| {
        let Ok(url) = Url::parse(value) else {
            return;
        };
        if let Some((_, id)) = url.query_pairs().find(|(key, _)| key == "v") {
            if !id.is_empty() {
                ids.push(id.into_owned());
            }
        }
    });

    ids
}

fn collect_key_strings(value: &Value, key: &str, f: &mut impl FnMut(&str)) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if k == key {
                    if let Some(s) = v.as_str() {
                        f(s);
                        continue;
                    }
                }
                collect_key_strings(v, key, f);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_key_strings(item, key, f);
            }
        }
        _ => {}
    }
}
