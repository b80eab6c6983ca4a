//! Progress tracking and the idle watchdog for a running fetch.
//!
//! The fetcher writes human-readable lines to its log file and, through the
//! companion tool, to a second log next to it. Any line on either file
//! counts as liveness; lines on the main log carrying the progress marker
//! additionally decode into throttled progress events. Progress records are
//! advisory; the idle watchdog is the contract: when no line arrives within
//! the idle bound, the fetch is cancelled.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::util::{ibytes, sleep_cancellable};

/// Sentinel the fetcher embeds in log lines that carry a progress record.
pub const PROGRESS_MARKER: &str = "__progress__";

/// Upper bound on bytes consumed from a log file per poll.
const READ_CHUNK: u64 = 1 << 20;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub downloaded: u64,
    #[serde(default)]
    pub done: String,
    #[serde(default)]
    pub finished: bool,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// At most one progress event per this interval (`finished` always emits).
    pub emit_interval: Duration,
    /// Cancel the fetch when no log line arrived for this long.
    pub idle_timeout: Duration,
    /// Start warning when this little headroom remains.
    pub warn_margin: Duration,
    pub poll_interval: Duration,
    pub watchdog_tick: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            emit_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(3 * 60),
            warn_margin: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            watchdog_tick: Duration::from_secs(10),
        }
    }
}

/// Decode the record after the progress marker. `None` for ordinary lines
/// and for malformed records; liveness is counted by the caller either way.
pub fn parse_progress_line(line: &str) -> Option<Progress> {
    let (_, tail) = line.split_once(PROGRESS_MARKER)?;
    serde_json::from_str(tail.trim()).ok()
}

/// Follow the fetch log and its companion, emit throttled progress events,
/// and cancel `fetch` when the idle bound is hit. Returns once `fetch` is
/// cancelled, whether by us, by the downloader, or by shutdown.
pub async fn track(
    fetch: CancellationToken,
    log_path: PathBuf,
    companion: Option<PathBuf>,
    cfg: TrackerConfig,
) {
    let last_event = Mutex::new(Instant::now());
    let touch = |at: Instant| {
        *last_event
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = at;
    };
    let idle = || {
        last_event
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    };

    let watchdog = async {
        loop {
            let idle = idle();
            if idle >= cfg.idle_timeout {
                error!("stopping idle download");
                fetch.cancel();
                return;
            }

            let left = cfg.idle_timeout - idle;
            if left <= cfg.warn_margin {
                warn!(left = ?left, "download is idle, will be stopped soon");
            }

            if !sleep_cancellable(&fetch, cfg.watchdog_tick.min(left)).await {
                return;
            }
        }
    };

    let tail = async {
        let mut main_tail = Tail::new(log_path);
        let mut tool_tail = companion.map(Tail::new);
        let mut last_emit: Option<Instant> = None;

        loop {
            if !sleep_cancellable(&fetch, cfg.poll_interval).await {
                return;
            }

            for line in main_tail.read_lines().await {
                touch(Instant::now());

                let Some(progress) = parse_progress_line(&line) else {
                    continue;
                };
                let due = last_emit.map_or(true, |at| at.elapsed() >= cfg.emit_interval);
                if due || progress.finished {
                    emit(&progress);
                    last_emit = Some(Instant::now());
                }
            }

            // The companion log is an independent liveness signal: the
            // fetcher can be blocked on slow muxing without reporting.
            if let Some(tool_tail) = tool_tail.as_mut() {
                if !tool_tail.read_lines().await.is_empty() {
                    touch(Instant::now());
                }
            }
        }
    };

    tokio::join!(watchdog, tail);
}

fn emit(progress: &Progress) {
    info!(
        done = %progress.done,
        downloaded = %ibytes(progress.downloaded),
        total = %ibytes(progress.total),
        finished = progress.finished,
        "progress"
    );
}

/// Incremental reader for a log file that may not exist yet and may be
/// appended to while we read.
struct Tail {
    path: PathBuf,
    file: Option<File>,
    offset: u64,
    partial: String,
}

impl Tail {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            offset: 0,
            partial: String::new(),
        }
    }

    async fn read_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();

        if self.file.is_none() {
            match File::open(&self.path).await {
                Ok(file) => {
                    self.file = Some(file);
                    self.offset = 0;
                }
                Err(_) => return lines,
            }
        }
        let Some(file) = self.file.as_mut() else {
            return lines;
        };

        let len = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(_) => return lines,
        };
        if len < self.offset {
            // Truncated under us: start over.
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return lines;
        }

        if file.seek(SeekFrom::Start(self.offset)).await.is_err() {
            return lines;
        }
        let take = (len - self.offset).min(READ_CHUNK);
        let mut buf = vec![0u8; take as usize];
        if file.read_exact(&mut buf).await.is_err() {
            return lines;
        }
        self.offset += take;

        self.partial.push_str(&String::from_utf8_lossy(&buf));
        while let Some(idx) = self.partial.find('\n') {
            let line = self.partial[..idx].trim_end().to_string();
            self.partial.drain(..=idx);
            if !line.is_empty() {
                lines.push(line);
            }
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            emit_interval: ms(50),
            idle_timeout: ms(250),
            warn_margin: ms(50),
            poll_interval: ms(20),
            watchdog_tick: ms(20),
        }
    }

    async fn append(path: &std::path::Path, line: &str) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        file.flush().await.unwrap();
    }

    #[test]
    fn decodes_marked_lines() {
        let progress = parse_progress_line(
            r#"12:00:01 INFO __progress__ {"total":100,"downloaded":50,"done":"50.00%","finished":false}"#,
        )
        .unwrap();
        assert_eq!(progress.total, 100);
        assert_eq!(progress.downloaded, 50);
        assert_eq!(progress.done, "50.00%");
        assert!(!progress.finished);
    }

    #[test]
    fn malformed_records_are_ignored() {
        assert!(parse_progress_line("plain log line").is_none());
        assert!(parse_progress_line("__progress__ not json").is_none());
        assert!(parse_progress_line("__progress__ {\"total\":").is_none());
    }

    #[tokio::test]
    async fn watchdog_cancels_an_idle_fetch() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("dl.log");
        append(&log, "started").await;

        let fetch = CancellationToken::new();
        let tracker = track(fetch.clone(), log, None, fast_config());

        tokio::time::timeout(Duration::from_secs(5), tracker)
            .await
            .expect("tracker should stop itself");
        assert!(fetch.is_cancelled());
    }

    #[tokio::test]
    async fn log_activity_defers_the_watchdog() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("dl.log");

        let fetch = CancellationToken::new();
        let handle = tokio::spawn(track(
            fetch.clone(),
            log.clone(),
            None,
            fast_config(),
        ));

        // Keep writing for well past the idle bound.
        for i in 0..10 {
            append(&log, &format!("line {}", i)).await;
            tokio::time::sleep(ms(60)).await;
        }
        assert!(!fetch.is_cancelled());

        // Silence: the watchdog fires.
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("tracker should stop itself")
            .unwrap();
        assert!(fetch.is_cancelled());
    }

    #[tokio::test]
    async fn companion_log_counts_as_liveness() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("dl.log");
        let companion = dir.path().join("dl-ffmpeg.log");

        let fetch = CancellationToken::new();
        let _handle = tokio::spawn(track(
            fetch.clone(),
            log,
            Some(companion.clone()),
            fast_config(),
        ));

        // Only the tool log shows activity.
        for i in 0..10 {
            append(&companion, &format!("frame={}", i)).await;
            tokio::time::sleep(ms(60)).await;
        }
        assert!(!fetch.is_cancelled());
        fetch.cancel();
    }

    #[tokio::test]
    async fn tracker_exits_on_cancellation() {
        let dir = TempDir::new().unwrap();
        let fetch = CancellationToken::new();
        fetch.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            track(fetch, dir.path().join("missing.log"), None, fast_config()),
        )
        .await
        .expect("cancelled tracker must return promptly");
    }
}
