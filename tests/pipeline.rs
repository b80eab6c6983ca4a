//! End-to-end pipeline tests: admission through the enqueuer with a fake
//! metadata client, and outcome classification through the downloader with
//! stub fetcher scripts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use reelvault::adapters::{
    ApiError, ContentDetails, Fetcher, MetadataSource, PlaylistPage, PlaylistSource, Snippet,
    VideoInfo,
};
use reelvault::config::DownloaderSettings;
use reelvault::index::{Index, IndexOptions, Item, Status};
use reelvault::pipeline::discover;
use reelvault::pipeline::{Downloader, Enqueuer};
use reelvault::Storages;

const ID: &str = "VIDEOAAAAAA";

fn fast_opts() -> IndexOptions {
    IndexOptions {
        lease_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_millis(100),
        retry_delay: Duration::from_millis(10),
        max_attempts: 3,
    }
}

fn video_info(id: &str, duration: &str, live: &str) -> VideoInfo {
    VideoInfo {
        id: id.to_string(),
        snippet: Snippet {
            title: "T".to_string(),
            published_at: "2024-01-02T03:04:05Z".to_string(),
            live_broadcast_content: live.to_string(),
            ..Snippet::default()
        },
        content_details: ContentDetails {
            duration: duration.to_string(),
        },
    }
}

struct FakeMetadata {
    videos: HashMap<String, VideoInfo>,
    fail: bool,
}

impl FakeMetadata {
    fn with(videos: Vec<VideoInfo>) -> Self {
        Self {
            videos: videos.into_iter().map(|v| (v.id.clone(), v)).collect(),
            fail: false,
        }
    }
}

#[async_trait]
impl MetadataSource for FakeMetadata {
    async fn videos(&self, ids: &[String]) -> Result<Vec<VideoInfo>, ApiError> {
        if self.fail {
            return Err(ApiError::Status {
                code: 500,
                message: "boom".to_string(),
            });
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.videos.get(id).cloned())
            .collect())
    }
}

async fn wait_for_status(index: &Index, id: &str, status: Status) -> Item {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let item = index
            .dump()
            .await
            .into_iter()
            .find(|item| item.id == id);
        if let Some(item) = item {
            if item.status == status {
                return item;
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {} to become {}",
            id,
            status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Run the enqueuer against a fake metadata client until the item settles.
async fn enqueue_one(info: Option<VideoInfo>) -> Item {
    let dir = TempDir::new().unwrap();
    let index = Index::open(dir.path().join("index.db"), fast_opts())
        .await
        .unwrap();
    index.push(&[ID.to_string()]).await.unwrap();

    let client = Arc::new(FakeMetadata::with(info.into_iter().collect()));
    let enqueuer = Enqueuer::new(
        index.clone(),
        client,
        Duration::from_secs(9 * 3600),
        Duration::from_millis(50),
    )
    .with_tick(Duration::from_millis(20));

    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { enqueuer.run(run_token).await });

    // Wait until the item left NEW.
    let deadline = Instant::now() + Duration::from_secs(30);
    let item = loop {
        let item = index.dump().await.into_iter().next().unwrap();
        if item.status != Status::New {
            break item;
        }
        assert!(Instant::now() < deadline, "item never left NEW");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    token.cancel();
    handle.await.unwrap();
    index.close().await.unwrap();
    item
}

#[tokio::test]
async fn enqueuer_admits_an_ordinary_video() {
    let item = enqueue_one(Some(video_info(ID, "PT1M30S", "none"))).await;

    assert_eq!(item.status, Status::Enqueued);
    let meta = item.meta.expect("admitted item must carry metadata");
    assert_eq!(meta.title, "T");
}

#[tokio::test]
async fn enqueuer_skips_live_broadcasts() {
    let item = enqueue_one(Some(video_info(ID, "PT1M30S", "live"))).await;

    assert_eq!(item.status, Status::Skipped);
    assert_eq!(item.reason, "live");
}

#[tokio::test]
async fn enqueuer_skips_overlong_videos() {
    let item = enqueue_one(Some(video_info(ID, "PT10H", "none"))).await;

    assert_eq!(item.status, Status::Skipped);
    assert_eq!(item.reason, "too long");
}

#[tokio::test]
async fn enqueuer_fails_missing_videos() {
    let item = enqueue_one(None).await;

    assert_eq!(item.status, Status::Failed);
    assert_eq!(item.reason, "unavailable or deleted");
}

#[tokio::test]
async fn enqueuer_leaves_items_new_on_transport_errors() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(dir.path().join("index.db"), fast_opts())
        .await
        .unwrap();
    index.push(&[ID.to_string()]).await.unwrap();

    let client = Arc::new(FakeMetadata {
        videos: HashMap::new(),
        fail: true,
    });
    let enqueuer = Enqueuer::new(
        index.clone(),
        client,
        Duration::from_secs(9 * 3600),
        Duration::from_millis(30),
    )
    .with_tick(Duration::from_millis(20));

    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { enqueuer.run(run_token).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let item = index.dump().await.into_iter().next().unwrap();
    assert_eq!(item.status, Status::New, "failed lookups must not consume the item");

    token.cancel();
    handle.await.unwrap();
    index.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Downloader

struct DownloaderRig {
    _dir: TempDir,
    index: Arc<Index>,
    volume_root: std::path::PathBuf,
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl DownloaderRig {
    /// Seed one ENQUEUED item and run a downloader whose fetcher is a shell
    /// script; `stub` is the script body.
    async fn start(stub: &str, settings: DownloaderSettings) -> Self {
        let dir = TempDir::new().unwrap();

        let volume_root = dir.path().join("vol");
        std::fs::create_dir_all(&volume_root).unwrap();
        let logs_dir = dir.path().join("logs");
        std::fs::create_dir_all(&logs_dir).unwrap();
        let script = dir.path().join("stub.sh");
        std::fs::write(&script, stub).unwrap();

        let index = Index::open(dir.path().join("index.db"), fast_opts())
            .await
            .unwrap();
        let mut item = Item::new(ID);
        item.status = Status::Enqueued;
        item.meta = Some(reelvault::index::Meta {
            title: "T".to_string(),
            published_at: Some("2024-01-02T03:04:05Z".parse().unwrap()),
            ..Default::default()
        });
        index.put(vec![item]).await.unwrap();

        let storages = Arc::new(Storages::new(vec![volume_root.clone()]));
        let fetcher = Arc::new(Fetcher::new(
            "/bin/sh".into(),
            script,
            dir.path().to_path_buf(),
            dir.path().join("cache"),
            None,
        ));

        let critical = CancellationToken::new();
        let downloader = Downloader::new(
            index.clone(),
            storages,
            fetcher,
            logs_dir,
            settings,
            critical,
        )
        .with_tick(Duration::from_millis(20));

        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { downloader.run(run_token).await });

        Self {
            _dir: dir,
            index,
            volume_root,
            token,
            handle,
        }
    }

    async fn stop(self) -> Arc<Index> {
        self.token.cancel();
        self.handle.await.unwrap();
        self.index
    }
}

fn fast_settings() -> DownloaderSettings {
    DownloaderSettings {
        fetch_timeout: Duration::from_secs(10),
        cooldown: Duration::from_millis(50),
        ..DownloaderSettings::default()
    }
}

#[tokio::test]
async fn successful_fetch_finishes_the_item() {
    let stub = r#"
echo '[{"id":"VIDEOAAAAAA","files":[{"path":"2024/01/20240102_VIDEOAAAAAA/a.mp4","hash":"deadbeef","size":1234}]}]'
"#;
    let rig = DownloaderRig::start(stub, fast_settings()).await;

    let item = wait_for_status(&rig.index, ID, Status::Done).await;
    assert_eq!(item.files.len(), 1);
    assert_eq!(item.files[0].path, "2024/01/20240102_VIDEOAAAAAA/a.mp4");
    assert_eq!(item.files[0].hash, "deadbeef");
    assert_eq!(item.files[0].size, 1234);
    assert_eq!(item.storages.len(), 1);

    // The storage reference is the volume's manifest id.
    let manifest = std::fs::read_to_string(rig.volume_root.join("storage")).unwrap();
    assert!(manifest.contains(&item.storages[0].id));

    let index = rig.stop().await;
    index.check().await.unwrap();
    index.close().await.unwrap();
}

#[tokio::test]
async fn non_retriable_failure_is_terminal() {
    let stub = r#"
echo '{"error":"Video is private","reason":"download"}'
exit 231
"#;
    let rig = DownloaderRig::start(stub, fast_settings()).await;

    let item = wait_for_status(&rig.index, ID, Status::Failed).await;
    assert_eq!(item.reason, "Video is private");
    assert_eq!(item.attempt, 0, "permanent failures do not count attempts");

    rig.stop().await.close().await.unwrap();
}

#[tokio::test]
async fn system_errors_retry_without_counting() {
    let stub = r#"
echo '{"error":"urlopen error: network is unreachable","reason":"system"}'
exit 231
"#;
    let rig = DownloaderRig::start(stub, fast_settings()).await;

    let item = wait_for_status(&rig.index, ID, Status::Enqueued).await;
    assert_eq!(item.attempt, 0);

    // After the cooldown the loop pops the same item again.
    wait_for_status(&rig.index, ID, Status::InProgress).await;

    rig.stop().await.close().await.unwrap();
}

#[tokio::test]
async fn unknown_failures_exhaust_the_retry_budget() {
    let stub = r#"
echo 'something exploded' >&2
exit 1
"#;
    let rig = DownloaderRig::start(stub, fast_settings()).await;

    let item = wait_for_status(&rig.index, ID, Status::Failed).await;
    assert_eq!(item.attempt, 4, "failed after max_attempts limited retries");

    rig.stop().await.close().await.unwrap();
}

#[tokio::test]
async fn hung_fetcher_times_out_and_retries() {
    let stub = "sleep 600\n";
    let settings = DownloaderSettings {
        fetch_timeout: Duration::from_millis(200),
        cooldown: Duration::from_millis(50),
        ..DownloaderSettings::default()
    };
    let rig = DownloaderRig::start(stub, settings).await;

    let deadline = Instant::now() + Duration::from_secs(30);
    let item = loop {
        let item = rig
            .index
            .dump()
            .await
            .into_iter()
            .find(|item| item.id == ID)
            .unwrap();
        if item.status == Status::Enqueued && item.attempt > 0 {
            break item;
        }
        assert!(Instant::now() < deadline, "timed out waiting for retry");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert!(item.attempt >= 1);

    rig.stop().await.close().await.unwrap();
}

#[tokio::test]
async fn full_pipeline_archives_a_discovered_video() {
    let dir = TempDir::new().unwrap();

    let volume_root = dir.path().join("vol");
    std::fs::create_dir_all(&volume_root).unwrap();
    let logs_dir = dir.path().join("logs");
    std::fs::create_dir_all(&logs_dir).unwrap();
    let script = dir.path().join("stub.sh");
    std::fs::write(
        &script,
        r#"
echo '[{"id":"VIDEOAAAAAA","files":[{"path":"2024/01/20240102_VIDEOAAAAAA/a.mp4","hash":"deadbeef","size":1234}]}]'
"#,
    )
    .unwrap();

    let index = Index::open(dir.path().join("index.db"), fast_opts())
        .await
        .unwrap();

    // Discovery: the id enters as NEW.
    index.push(&[ID.to_string()]).await.unwrap();

    let client = Arc::new(FakeMetadata::with(vec![video_info(ID, "PT1M30S", "none")]));
    let enqueuer = Enqueuer::new(
        index.clone(),
        client,
        Duration::from_secs(9 * 3600),
        Duration::from_millis(50),
    )
    .with_tick(Duration::from_millis(20));

    let storages = Arc::new(Storages::new(vec![volume_root]));
    let fetcher = Arc::new(Fetcher::new(
        "/bin/sh".into(),
        script,
        dir.path().to_path_buf(),
        dir.path().join("cache"),
        None,
    ));
    let downloader = Downloader::new(
        index.clone(),
        storages,
        fetcher,
        logs_dir,
        fast_settings(),
        CancellationToken::new(),
    )
    .with_tick(Duration::from_millis(20));

    let token = CancellationToken::new();
    let enqueuer_token = token.clone();
    let downloader_token = token.clone();
    let enqueuer_handle = tokio::spawn(async move { enqueuer.run(enqueuer_token).await });
    let downloader_handle = tokio::spawn(async move { downloader.run(downloader_token).await });

    let item = wait_for_status(&index, ID, Status::Done).await;
    assert_eq!(item.meta.as_ref().unwrap().title, "T");
    assert_eq!(item.files[0].hash, "deadbeef");
    assert_eq!(item.storages.len(), 1);

    token.cancel();
    enqueuer_handle.await.unwrap();
    downloader_handle.await.unwrap();

    index.check().await.unwrap();
    index.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Playlist crawler

#[derive(Default)]
struct FakePlaylists {
    pages: HashMap<String, Vec<PlaylistPage>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
    quota_exceeded: bool,
}

#[async_trait]
impl PlaylistSource for FakePlaylists {
    async fn playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, ApiError> {
        self.calls
            .lock()
            .unwrap()
            .push((playlist_id.to_string(), page_token.map(String::from)));

        if self.quota_exceeded {
            return Err(ApiError::QuotaExceeded);
        }

        let pages = self.pages.get(playlist_id).cloned().unwrap_or_default();
        let page_index = match page_token {
            None => 0,
            Some(token) => token.parse::<usize>().unwrap_or(0),
        };
        Ok(pages.into_iter().nth(page_index).unwrap_or_default())
    }
}

fn page(ids: &[&str], next: Option<&str>) -> PlaylistPage {
    PlaylistPage {
        ids: ids.iter().map(|s| s.to_string()).collect(),
        next_page_token: next.map(String::from),
    }
}

#[tokio::test]
async fn playlist_crawl_stops_once_caught_up() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(dir.path().join("index.db"), fast_opts())
        .await
        .unwrap();

    // The last id of page two is already known: that page still accepts one
    // new id, so pagination continues; page three is all-known and stops it.
    index.push(&["VIDEOCCCCCC".to_string()]).await.unwrap();

    let source = FakePlaylists {
        pages: HashMap::from([(
            "PL1".to_string(),
            vec![
                page(&["VIDEOAAAAAA", "VIDEOBBBBBB"], Some("1")),
                page(&["VIDEODDDDDD", "VIDEOCCCCCC"], Some("2")),
                page(&["VIDEOCCCCCC"], Some("3")),
                page(&["VIDEOZZZZZZ"], None),
            ],
        )]),
        ..FakePlaylists::default()
    };

    let playlists = BTreeMap::from([("music".to_string(), "PL1".to_string())]);
    discover::crawl_playlists_once(&index, &source, &playlists).await;

    let all = index.dump().await;
    let got: Vec<&str> = all.iter().map(|item| item.id.as_str()).collect();
    assert!(got.contains(&"VIDEOAAAAAA"));
    assert!(got.contains(&"VIDEODDDDDD"));
    assert!(
        !got.contains(&"VIDEOZZZZZZ"),
        "pagination must stop after an all-known page"
    );
    assert_eq!(source.calls.lock().unwrap().len(), 3);

    index.close().await.unwrap();
}

#[tokio::test]
async fn quota_errors_stop_the_whole_batch() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(dir.path().join("index.db"), fast_opts())
        .await
        .unwrap();

    let source = FakePlaylists {
        quota_exceeded: true,
        ..FakePlaylists::default()
    };
    let playlists = BTreeMap::from([
        ("first".to_string(), "PL1".to_string()),
        ("second".to_string(), "PL2".to_string()),
    ]);

    discover::crawl_playlists_once(&index, &source, &playlists).await;

    assert_eq!(
        source.calls.lock().unwrap().len(),
        1,
        "remaining playlists must be skipped after a quota error"
    );
    assert!(index.dump().await.is_empty());

    index.close().await.unwrap();
}
