//! Command-line interface for reelvault.
//!
//! Provides the long-running `start` command plus the offline maintenance
//! surface: listing, manual adds, takeout imports, exports, and consistency
//! checks.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

use crate::config::Config;
use crate::index::{Index, Item, Status};
use crate::pipeline::discover;
use crate::storage::Storages;
use crate::util::expand_home;

const VIDEO_ID_LENGTH: usize = 11;

/// reelvault - personal video archival service
#[derive(Parser, Debug)]
#[command(name = "reelvault")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Custom config path
    #[arg(short, long, global = true, env = "REELVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true, env = "REELVAULT_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the archival service
    Start {
        /// Do not download new videos
        #[arg(long)]
        disable_download: bool,
    },

    /// List indexed items
    List {
        /// Only items with this status
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,

        /// Print items as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add video ids by hand
    Add {
        /// Reset existing items back to NEW (e.g. to retry failed downloads)
        #[arg(short, long)]
        force: bool,

        /// 11-character video ids
        ids: Vec<String>,
    },

    /// Import ids from a takeout JSON file
    Import {
        file: PathBuf,
    },

    /// Dump archived items as JSON
    Export,

    /// Consistency checks
    Check {
        #[command(subcommand)]
        command: CheckCommands,
    },

    /// Show the resolved configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum CheckCommands {
    /// Verify the index invariants
    Index,

    /// Verify archived files against the index
    Files {
        /// Also verify content hashes (slow)
        #[arg(long)]
        hashes: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    New,
    Enqueued,
    Inprogress,
    Done,
    Skipped,
    Failed,
}

impl From<StatusArg> for Status {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::New => Status::New,
            StatusArg::Enqueued => Status::Enqueued,
            StatusArg::Inprogress => Status::InProgress,
            StatusArg::Done => Status::Done,
            StatusArg::Skipped => Status::Skipped,
            StatusArg::Failed => Status::Failed,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;

        match self.command {
            Commands::Start { disable_download } => {
                crate::service::run(config, disable_download).await
            }
            Commands::List { status, json } => list(&config, status.map(Into::into), json).await,
            Commands::Add { force, ids } => add(&config, force, ids).await,
            Commands::Import { file } => import(&config, &file).await,
            Commands::Export => export(&config).await,
            Commands::Check { command } => match command {
                CheckCommands::Index => check_index(&config).await,
                CheckCommands::Files { hashes } => check_files(&config, hashes).await,
            },
            Commands::Config => show_config(&config),
        }
    }
}

/// Open the configured index for an offline command
async fn open_index(config: &Config) -> Result<Arc<Index>> {
    Ok(Index::open(config.index_path(), config.index.options()).await?)
}

/// Print indexed items, one row per item or as pretty JSON
async fn list(config: &Config, status: Option<Status>, json: bool) -> Result<()> {
    let index = open_index(config).await?;

    let items = match status {
        Some(status) => collect(&index, status).await?,
        None => index.dump().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for item in &items {
            println!("{}", item.row());
        }
    }

    index.close().await?;
    Ok(())
}

/// Push ids by hand; with `--force`, reset existing items back to NEW
async fn add(config: &Config, force: bool, ids: Vec<String>) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    let invalid: Vec<&str> = ids
        .iter()
        .filter(|id| id.chars().count() != VIDEO_ID_LENGTH)
        .map(|id| id.as_str())
        .collect();
    if !invalid.is_empty() {
        bail!("invalid video ids: {:?}", invalid);
    }

    let index = open_index(config).await?;

    let mut count = 0;
    if force {
        count += index.reopen(&ids).await?;
    }
    count += index.push(&ids).await?;

    println!("Videos added: {}", count);
    index.close().await?;
    Ok(())
}

/// Import ids from a takeout JSON file
async fn import(config: &Config, file: &Path) -> Result<()> {
    let path = expand_home(&file.to_string_lossy());
    let index = open_index(config).await?;

    let (extracted, inserted) = discover::import_file(&index, &path).await?;
    println!("Imported: {}", extracted);
    println!("Added with status NEW: {}", inserted);

    index.close().await?;
    Ok(())
}

/// Dump archived items to stdout as pretty JSON
async fn export(config: &Config) -> Result<()> {
    let index = open_index(config).await?;
    let items = collect(&index, Status::Done).await?;

    println!("{}", serde_json::to_string_pretty(&items)?);
    index.close().await?;
    Ok(())
}

/// Verify the index invariants and report the first inconsistency
async fn check_index(config: &Config) -> Result<()> {
    let index = open_index(config).await?;
    let result = index.check().await;
    index.close().await?;

    result?;
    println!("index is consistent");
    Ok(())
}

/// Verify archived files against the index: sizes always, hashes on demand
async fn check_files(config: &Config, hashes: bool) -> Result<()> {
    let storages = Storages::new(
        config
            .storages
            .iter()
            .map(|entry| entry.path.clone())
            .collect(),
    );
    let volumes: HashMap<String, PathBuf> = storages
        .list()
        .into_iter()
        .map(|volume| (volume.id, volume.path))
        .collect();

    let index = open_index(config).await?;
    let items = collect(&index, Status::Done).await?;
    index.close().await?;

    let mut problems = 0usize;
    for item in &items {
        for storage in &item.storages {
            let Some(root) = volumes.get(&storage.id) else {
                continue;
            };
            for file in &item.files {
                let path = root.join(&file.path);

                let meta = match std::fs::metadata(&path) {
                    Ok(meta) => meta,
                    Err(err) => {
                        warn!(id = %item.id, path = %file.path, error = %err, "could not stat file");
                        problems += 1;
                        continue;
                    }
                };

                if meta.len() != file.size {
                    warn!(
                        id = %item.id,
                        path = %file.path,
                        fs_size = meta.len(),
                        db_size = file.size,
                        "size does not match"
                    );
                    problems += 1;
                    continue;
                }

                if hashes {
                    match hash_file(&path) {
                        Ok(digest) if digest == file.hash => {}
                        Ok(_) => {
                            warn!(id = %item.id, path = %file.path, "hash does not match");
                            problems += 1;
                        }
                        Err(err) => {
                            warn!(id = %item.id, path = %file.path, error = %err, "could not hash file");
                            problems += 1;
                        }
                    }
                }
            }
        }
    }

    if problems > 0 {
        bail!("{} file problems found", problems);
    }
    println!("all files are consistent");
    Ok(())
}

/// Print the resolved configuration with secrets blanked
fn show_config(config: &Config) -> Result<()> {
    print!("{}", serde_yaml::to_string(&config.redacted())?);
    Ok(())
}

/// Collect every item with the given status
async fn collect(index: &Index, status: Status) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    index
        .for_each(status, |item| {
            items.push(item.clone());
            ControlFlow::Continue(())
        })
        .await?;
    Ok(items)
}

/// Hex-encoded sha256 of a file's content
fn hash_file(path: &Path) -> std::io::Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
