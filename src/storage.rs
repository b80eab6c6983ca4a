//! Storage volume discovery and selection.
//!
//! Each configured root directory carries a small manifest file with a
//! stable, randomly assigned volume id. Selection returns the first writable
//! volume with enough free space for another download.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::util::ibytes;

/// Minimum free space a volume must have to accept new downloads.
pub const FREE_REQUIRED: u64 = 1 << 30; // 1 GiB

/// Manifest file name written on first use; `volume` is accepted as a
/// legacy spelling.
const MANIFEST_NAMES: [&str; 2] = ["storage", "volume"];

const MANIFEST_HEADER: &str = "\
# Created by reelvault to identify the storage volume.
# Do not delete or edit this file!
";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no storage with >= {} free space", ibytes(FREE_REQUIRED))]
    NoStorageAvailable,

    #[error("duplicate volume id {id} at {first} and {second}")]
    DuplicateVolume {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("storage path is not a writable directory: {0}")]
    NotWritable(PathBuf),

    #[error("invalid volume manifest at {0}")]
    BadManifest(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A usable volume: stable id, root path, current free bytes.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
    pub path: PathBuf,
    pub free: u64,
}

pub struct Storages {
    roots: Vec<PathBuf>,
}

impl Storages {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Fail fast on configuration errors: every root must be a writable
    /// directory and no two roots may share a volume id.
    pub fn verify(&self) -> Result<(), StorageError> {
        let mut seen: HashMap<String, PathBuf> = HashMap::new();

        for root in &self.roots {
            writable_probe(root).map_err(|_| StorageError::NotWritable(root.clone()))?;
            let id = volume_id(root)?;

            if let Some(first) = seen.get(&id) {
                return Err(StorageError::DuplicateVolume {
                    id,
                    first: first.clone(),
                    second: root.clone(),
                });
            }
            seen.insert(id, root.clone());
        }
        Ok(())
    }

    /// Enumerate currently usable volumes. Roots that are unwritable or
    /// whose manifest cannot be read are skipped with a debug log so a
    /// temporarily unmounted disk does not take the service down.
    pub fn list(&self) -> Vec<Volume> {
        let mut volumes = Vec::with_capacity(self.roots.len());

        for root in &self.roots {
            if let Err(err) = writable_probe(root) {
                debug!(path = %root.display(), error = %err, "storage path is not writable");
                continue;
            }

            let id = match volume_id(root) {
                Ok(id) => id,
                Err(err) => {
                    debug!(path = %root.display(), error = %err, "could not read storage id");
                    continue;
                }
            };

            let volume = Volume {
                id,
                path: root.clone(),
                free: free_space(root),
            };
            debug!(
                path = %volume.path.display(),
                id = %volume.id,
                free = %ibytes(volume.free),
                "storage found"
            );
            volumes.push(volume);
        }

        volumes
    }

    /// First volume with enough free space, or `NoStorageAvailable`.
    pub fn get(&self) -> Result<Volume, StorageError> {
        for volume in self.list() {
            if volume.free > FREE_REQUIRED {
                debug!(
                    path = %volume.path.display(),
                    id = %volume.id,
                    free = %ibytes(volume.free),
                    "storage selected"
                );
                return Ok(volume);
            }
        }
        Err(StorageError::NoStorageAvailable)
    }
}

/// Read the volume id from the root's manifest, assigning and persisting a
/// fresh v4 UUID on first use.
fn volume_id(root: &Path) -> Result<String, StorageError> {
    #[derive(Deserialize)]
    struct Manifest {
        #[serde(rename = "ID")]
        id: String,
    }

    for name in MANIFEST_NAMES {
        let path = root.join(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };

        let manifest: Manifest =
            serde_yaml::from_str(&content).map_err(|_| StorageError::BadManifest(path.clone()))?;
        if manifest.id.is_empty() {
            return Err(StorageError::BadManifest(path));
        }
        return Ok(manifest.id);
    }

    // First use: stamp the volume.
    let id = Uuid::new_v4().to_string();
    let path = root.join(MANIFEST_NAMES[0]);
    let mut file = std::fs::File::create(&path)?;
    write!(file, "ID: {}\n{}", id, MANIFEST_HEADER)?;
    file.sync_all()?;

    Ok(id)
}

/// A directory is considered writable if we can actually create a file in
/// it; permission bits alone lie too often.
fn writable_probe(root: &Path) -> std::io::Result<()> {
    let meta = std::fs::metadata(root)?;
    if !meta.is_dir() {
        return Err(std::io::Error::other("not a directory"));
    }

    let probe = tempfile::Builder::new().prefix(".reelvault").tempfile_in(root)?;
    probe.close()?;
    Ok(())
}

fn free_space(path: &Path) -> u64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => stat.blocks_available() as u64 * stat.fragment_size() as u64,
        Err(_) => 0,
    }
}
