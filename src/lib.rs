//! reelvault - personal video archival service
//!
//! Discovers video ids from a watch-history feed, user-owned playlists and
//! one-shot imports, enriches them with metadata, decides what to archive,
//! and supervises an external fetcher process that writes the artifacts
//! onto local storage volumes.
//!
//! # Architecture
//!
//! All coordination goes through a crash-safe item index with transactional
//! status transitions; the stages never call each other directly:
//!
//! - `index`: the durable item store, leases, retries, and the sweeper
//! - `storage`: volume discovery and selection
//! - `pipeline`: discoverers, enqueuer, downloader, progress tracker
//! - `adapters`: the REST API, the headless browser, the fetcher subprocess
//! - `supervisor` / `service`: signal handling and stage wiring
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the service
//! reelvault start
//!
//! # Inspect the index
//! reelvault list --status failed
//!
//! # Retry a failed download
//! reelvault add --force dQw4w9WgXcQ
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod index;
pub mod pipeline;
pub mod service;
pub mod storage;
pub mod supervisor;
pub mod util;

// Re-export the types most callers need at the crate root.
pub use config::Config;
pub use index::{Index, IndexError, IndexOptions, Item, RetryMode, Status};
pub use storage::{StorageError, Storages, Volume};
