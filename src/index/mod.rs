//! Crash-safe item index: the single source of truth for the pipeline.
//!
//! The index is an append-only JSONL transaction log plus two in-memory maps
//! rebuilt by replay on open: a primary map `id → Item` and a secondary map
//! `STATUS::id → id` that makes status-prefix scans cheap. One log line is
//! one committed transaction carrying the full post-state of every item it
//! touched, so a torn trailing line (crash mid-append) is simply discarded
//! on the next open.
//!
//! Exactly one process may hold the index: an exclusive `flock` on a sibling
//! lock file fails fast with [`IndexError::AlreadyOpen`].
//!
//! A background sweeper reclaims leases whose deadline passed without a
//! heartbeat; it is the only mechanism that repossesses abandoned work.

mod item;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use item::{FileRecord, Item, Meta, Status, StorageRef};
use item::status_prefix;

/// Compact the log on open once it holds this many transactions more than
/// four times the live item count.
const COMPACT_MIN_RECORDS: usize = 1024;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index database is locked (probably by another reelvault instance)")]
    AlreadyOpen,

    #[error("index is corrupt: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How a failed lease returns to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Counted against `max_attempts`; the item waits out `retry_delay`
    /// before it is eligible for `pop` again.
    Limited,
    /// Environmental failures: put the item straight back without touching
    /// the attempt counter.
    Infinite,
}

/// Tuning knobs for lease handling. `sweep_interval` should stay well below
/// `lease_timeout` (config validation enforces a 1:5 ratio).
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub lease_timeout: Duration,
    pub sweep_interval: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

#[derive(Serialize)]
struct TxnOut<'a> {
    items: &'a [Item],
}

#[derive(Deserialize)]
struct TxnIn {
    items: Vec<Item>,
}

struct State {
    items: BTreeMap<String, Item>,
    statuses: BTreeMap<String, String>,
    log: File,
}

pub struct Index {
    opts: IndexOptions,
    state: Mutex<State>,
    beats: StdMutex<HashMap<String, DateTime<Utc>>>,
    cancel: CancellationToken,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    _lock: Flock<std::fs::File>,
}

impl Index {
    /// Open (or create) the index at `path` and start the lease sweeper.
    ///
    /// Fails with [`IndexError::AlreadyOpen`] when another process holds the
    /// database.
    pub async fn open(path: impl Into<PathBuf>, opts: IndexOptions) -> Result<Arc<Self>, IndexError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let lock_path = path.with_extension("lock");
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        let lock = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| IndexError::AlreadyOpen)?;

        let (items, statuses, records, valid_len) = replay(&path).await?;
        truncate_torn_tail(&path, valid_len).await?;
        compact_if_needed(&path, &items, records).await?;

        let log = OpenOptions::new().create(true).append(true).open(&path).await?;

        let index = Arc::new(Self {
            opts,
            state: Mutex::new(State { items, statuses, log }),
            beats: StdMutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            sweeper: StdMutex::new(None),
            _lock: lock,
        });
        Self::spawn_sweeper(&index);

        Ok(index)
    }

    /// Insert each id not present in any status as a fresh `NEW` item.
    /// Existing items are left untouched. Returns the number inserted.
    pub async fn push(&self, ids: &[String]) -> Result<usize, IndexError> {
        let mut state = self.state.lock().await;

        let mut fresh = HashSet::new();
        let mut batch = Vec::new();
        for id in ids {
            if state.items.contains_key(id) || !fresh.insert(id.clone()) {
                continue;
            }
            batch.push(Item::new(id.clone()));
        }

        let inserted = batch.len();
        commit(&mut state, batch).await?;
        Ok(inserted)
    }

    /// Lease up to `n` eligible `ENQUEUED` items: each is flipped to
    /// `INPROGRESS` with a fresh deadline before it is returned, so no two
    /// concurrent calls can observe the same item.
    pub async fn pop(&self, n: usize) -> Result<Vec<Item>, IndexError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let prefix = status_prefix(Status::Enqueued);
        let mut batch = Vec::new();
        for (_, id) in state
            .statuses
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            let item = state
                .items
                .get(id)
                .ok_or_else(|| IndexError::Corrupt(format!("missing item for status entry {}", id)))?;

            if matches!(item.retry_after, Some(after) if after > now) {
                continue;
            }

            let mut leased = item.clone();
            leased.deadline = Some(now + self.lease());
            leased.status = Status::InProgress;
            batch.push(leased);

            if batch.len() >= n {
                break;
            }
        }

        commit(&mut state, batch.clone()).await?;
        Ok(batch)
    }

    /// Replace each item atomically. The caller sets the target status;
    /// system scheduling fields are cleared when the status is terminal.
    pub async fn put(&self, items: Vec<Item>) -> Result<(), IndexError> {
        let mut batch = items;
        for item in &mut batch {
            if item.status.is_terminal() {
                item.clear_system();
            }
        }

        let mut state = self.state.lock().await;
        commit(&mut state, batch).await
    }

    /// Return a leased item to `ENQUEUED`. No-op if the id is unknown.
    ///
    /// [`RetryMode::Limited`] increments the attempt counter, delays the next
    /// lease by `retry_delay`, and flips the item to `FAILED` once the
    /// counter exceeds `max_attempts`.
    pub async fn retry(&self, id: &str, mode: RetryMode) -> Result<(), IndexError> {
        let mut state = self.state.lock().await;

        let Some(item) = state.items.get(id) else {
            return Ok(());
        };
        let mut item = item.clone();

        item.status = Status::Enqueued;
        item.deadline = None;

        if mode == RetryMode::Limited {
            item.attempt += 1;
            item.retry_after = Some(Utc::now() + self.retry_delay());

            if item.attempt > self.opts.max_attempts {
                info!(id, "retry limit reached");
                item.status = Status::Failed;
            }
        }

        info!(id, "retry later");
        commit(&mut state, vec![item]).await
    }

    /// Extend the effective lease of the item currently being processed.
    /// Heartbeats live only in memory: after a crash the sweeper reclaims
    /// whatever deadlines have lapsed, which is exactly the right recovery.
    pub fn beat(&self, id: &str) {
        let mut beats = self
            .beats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        beats.clear();
        beats.insert(id.to_string(), Utc::now() + self.lease());
    }

    /// Read-only scan over all items with `status`, in secondary-key order.
    /// Return `ControlFlow::Break(())` from `f` to stop early.
    pub async fn for_each<F>(&self, status: Status, mut f: F) -> Result<(), IndexError>
    where
        F: FnMut(&Item) -> ControlFlow<()>,
    {
        let state = self.state.lock().await;
        let prefix = status_prefix(status);

        for (_, id) in state
            .statuses
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            let item = state
                .items
                .get(id)
                .ok_or_else(|| IndexError::Corrupt(format!("missing item for status entry {}", id)))?;
            if let ControlFlow::Break(()) = f(item) {
                break;
            }
        }
        Ok(())
    }

    /// Up to `n` items with `status`, in secondary-key order.
    pub async fn get(&self, status: Status, n: usize) -> Result<Vec<Item>, IndexError> {
        let mut items = Vec::new();
        self.for_each(status, |item| {
            items.push(item.clone());
            if items.len() >= n {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await?;
        Ok(items)
    }

    /// Snapshot of every item, in id order.
    pub async fn dump(&self) -> Vec<Item> {
        let state = self.state.lock().await;
        state.items.values().cloned().collect()
    }

    /// Force previously terminal items back to `NEW` so they are picked up
    /// again. Unknown ids are skipped. Returns the number reopened.
    pub async fn reopen(&self, ids: &[String]) -> Result<usize, IndexError> {
        let mut state = self.state.lock().await;

        let mut batch = Vec::new();
        for id in ids {
            let Some(item) = state.items.get(id) else {
                continue;
            };
            let mut item = item.clone();
            item.status = Status::New;
            item.clear_system();
            item.reason.clear();
            item.storages.clear();
            item.files.clear();
            batch.push(item);
        }

        let reopened = batch.len();
        commit(&mut state, batch).await?;
        Ok(reopened)
    }

    /// Exhaustively verify that the primary and secondary maps agree:
    /// every item has exactly one status entry and vice versa. Returns the
    /// first inconsistency found.
    pub async fn check(&self) -> Result<(), IndexError> {
        let state = self.state.lock().await;

        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (key, id) in &state.statuses {
            let Some((status, key_id)) = key.split_once("::") else {
                return Err(IndexError::Corrupt(format!("invalid status key: {:?}", key)));
            };
            if key_id != id {
                return Err(IndexError::Corrupt(format!(
                    "invalid status value: [{:?}] = {:?}",
                    key, id
                )));
            }
            if let Some(previous) = seen.insert(id, status) {
                return Err(IndexError::Corrupt(format!(
                    "multiple statuses for id {:?}: {} and {}",
                    id, previous, status
                )));
            }
            let Some(item) = state.items.get(id) else {
                return Err(IndexError::Corrupt(format!("missing item for status {:?}", key)));
            };
            if item.status.as_str() != status {
                return Err(IndexError::Corrupt(format!(
                    "status mismatch: {:?} vs item {{id: {:?}, status: {}}}",
                    key, item.id, item.status
                )));
            }
        }

        for (id, item) in &state.items {
            if *id != item.id {
                return Err(IndexError::Corrupt(format!(
                    "invalid item key: [{:?}] = item {{id: {:?}}}",
                    id, item.id
                )));
            }
            if !state.statuses.contains_key(&item.status_key()) {
                return Err(IndexError::Corrupt(format!(
                    "missing status entry for item {:?} ({})",
                    item.id, item.status
                )));
            }
        }

        Ok(())
    }

    /// Stop the sweeper and flush the log. The exclusive lock is released
    /// when the index is dropped.
    pub async fn close(&self) -> Result<(), IndexError> {
        self.cancel.cancel();

        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut state = self.state.lock().await;
        state.log.sync_all().await?;
        debug!("index closed");
        Ok(())
    }

    fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.opts.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }

    fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.opts.retry_delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    fn spawn_sweeper(index: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(index);
        let cancel = index.cancel.clone();
        let interval = index.opts.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let Some(index) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = index.sweep_once().await {
                    warn!(error = %err, "lease sweep failed");
                }
            }
        });

        *index
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// One sweep pass: adopt future heartbeats as deadlines, re-enqueue
    /// items whose deadline lapsed without one.
    async fn sweep_once(&self) -> Result<(), IndexError> {
        let beats: HashMap<String, DateTime<Utc>> = {
            self.beats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        };

        let now = Utc::now();
        let mut state = self.state.lock().await;
        let prefix = status_prefix(Status::InProgress);

        let mut batch = Vec::new();
        for (_, id) in state
            .statuses
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            let item = state
                .items
                .get(id)
                .ok_or_else(|| IndexError::Corrupt(format!("missing item for status entry {}", id)))?;

            let Some(deadline) = item.deadline else {
                error!(id = %item.id, status = %item.status, "item has no deadline");
                continue;
            };

            if let Some(beat) = beats.get(&item.id) {
                if *beat > now {
                    if item.deadline != Some(*beat) {
                        let mut extended = item.clone();
                        extended.deadline = Some(*beat);
                        batch.push(extended);
                    }
                    continue;
                }
            }

            if deadline < now {
                debug!(id = %item.id, "download timed out, re-enqueueing");
                let mut reclaimed = item.clone();
                reclaimed.deadline = None;
                reclaimed.status = Status::Enqueued;
                batch.push(reclaimed);
            }
        }

        commit(&mut state, batch).await
    }
}

/// Append one transaction record and, once durable, fold it into the maps.
async fn commit(state: &mut State, batch: Vec<Item>) -> Result<(), IndexError> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut line = serde_json::to_string(&TxnOut { items: &batch })?;
    line.push('\n');
    state.log.write_all(line.as_bytes()).await?;
    state.log.sync_data().await?;

    for item in batch {
        apply(&mut state.items, &mut state.statuses, item);
    }
    Ok(())
}

/// Dual-map update: drop the old status entry (looked up from the previous
/// item record), then write the new item and its new status entry.
fn apply(items: &mut BTreeMap<String, Item>, statuses: &mut BTreeMap<String, String>, item: Item) {
    if let Some(old) = items.get(&item.id) {
        statuses.remove(&old.status_key());
    }
    statuses.insert(item.status_key(), item.id.clone());
    items.insert(item.id.clone(), item);
}

type Replayed = (BTreeMap<String, Item>, BTreeMap<String, String>, usize, u64);

async fn replay(path: &Path) -> Result<Replayed, IndexError> {
    let mut items = BTreeMap::new();
    let mut statuses = BTreeMap::new();
    let mut records = 0usize;
    let mut valid_len = 0u64;

    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok((items, statuses, records, valid_len));
        }
        Err(err) => return Err(err.into()),
    };

    let mut lines = data.split_inclusive('\n').peekable();
    while let Some(raw) = lines.next() {
        let terminated = raw.ends_with('\n');
        let line = raw.trim_end();
        if line.is_empty() {
            valid_len += raw.len() as u64;
            continue;
        }

        match serde_json::from_str::<TxnIn>(line) {
            Ok(txn) => {
                records += 1;
                valid_len += raw.len() as u64;
                for item in txn.items {
                    apply(&mut items, &mut statuses, item);
                }
            }
            Err(err) => {
                if lines.peek().is_none() && !terminated {
                    warn!("discarding torn trailing record in index log");
                    break;
                }
                return Err(IndexError::Corrupt(format!(
                    "invalid record after {} transactions: {}",
                    records, err
                )));
            }
        }
    }

    Ok((items, statuses, records, valid_len))
}

/// Cut a torn trailing record off so new appends start on a record
/// boundary.
async fn truncate_torn_tail(path: &Path, valid_len: u64) -> Result<(), IndexError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if meta.len() == valid_len {
        return Ok(());
    }

    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(valid_len).await?;
    file.sync_all().await?;
    Ok(())
}

/// Rewrite the log as one snapshot when replay shows it has grown far past
/// the live item count. Atomic: write a temp file, fsync, rename over.
async fn compact_if_needed(
    path: &Path,
    items: &BTreeMap<String, Item>,
    records: usize,
) -> Result<(), IndexError> {
    if records < COMPACT_MIN_RECORDS || records < items.len().saturating_mul(4) {
        return Ok(());
    }

    let all: Vec<Item> = items.values().cloned().collect();
    let mut out = String::new();
    for chunk in all.chunks(128) {
        out.push_str(&serde_json::to_string(&TxnOut { items: chunk })?);
        out.push('\n');
    }

    let tmp = path.with_extension("compact");
    tokio::fs::write(&tmp, out).await?;
    File::open(&tmp).await?.sync_all().await?;
    tokio::fs::rename(&tmp, path).await?;

    info!(records, items = all.len(), "compacted index log");
    Ok(())
}
