//! Service configuration.
//!
//! A single YAML file (`~/.config/reelvault/reelvault.yaml` by default,
//! overridable with `--config`) describing sources, storage volumes, data
//! directories, and the external tools. Loading expands home directories,
//! creates the data subdirectories, and validates everything the service
//! cannot degrade around.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::expand_home;

/// Default failure texts that terminate an item instead of retrying it.
/// Substring-matched case-insensitively against the fetcher's error text.
pub const NON_RETRIABLE_DEFAULTS: [&str; 9] = [
    "video is private",
    "no longer available",
    "not available",
    "video has been removed",
    "copyright grounds",
    "in your country",
    "confirm your age",
    "recording is not available",
    "video is unavailable",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sources: Sources,
    #[serde(default)]
    pub storages: Vec<StorageEntry>,
    #[serde(default)]
    pub dirs: Dirs,
    #[serde(default)]
    pub index: IndexSettings,
    #[serde(default)]
    pub downloader: DownloaderSettings,
    #[serde(default)]
    pub python: Python,
    #[serde(default)]
    pub youtube: Youtube,
    #[serde(default)]
    pub browser: Browser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sources {
    #[serde(default)]
    pub history: History,
    /// `playlist title → playlist id`, crawled through the REST API.
    #[serde(default)]
    pub playlists: BTreeMap<String, String>,
    /// Discoverer cadence.
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,
    /// Videos longer than this are skipped at admission.
    #[serde(default = "default_max_duration", with = "humantime_serde")]
    pub max_duration: Duration,
}

impl Default for Sources {
    fn default() -> Self {
        Self {
            history: History::default(),
            playlists: BTreeMap::new(),
            update_interval: default_update_interval(),
            max_duration: default_max_duration(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEntry {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dirs {
    /// Index database and fetch logs live under here.
    #[serde(default = "default_data_dir")]
    pub data: PathBuf,
    /// Fetcher cache and the managed upstream tool.
    #[serde(default = "default_cache_dir")]
    pub cache: PathBuf,
}

impl Default for Dirs {
    fn default() -> Self {
        Self {
            data: default_data_dir(),
            cache: default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    #[serde(default = "default_lease_timeout", with = "humantime_serde")]
    pub lease_timeout: Duration,
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            lease_timeout: default_lease_timeout(),
            sweep_interval: default_sweep_interval(),
            retry_delay: default_retry_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl IndexSettings {
    pub fn options(&self) -> crate::index::IndexOptions {
        crate::index::IndexOptions {
            lease_timeout: self.lease_timeout,
            sweep_interval: self.sweep_interval,
            retry_delay: self.retry_delay,
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderSettings {
    /// Wall-clock cap on a single fetcher run.
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Cooldown after a system-level error (network down, storage full).
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
    /// Failure texts that terminate an item as FAILED instead of retrying.
    #[serde(default = "default_non_retriable")]
    pub non_retriable: Vec<String>,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: default_fetch_timeout(),
            cooldown: default_cooldown(),
            non_retriable: default_non_retriable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Python {
    #[serde(default = "default_python_executable")]
    pub executable: PathBuf,
    /// Fetcher entry script; defaults to `<dirs.data>/dl.py`.
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default, rename = "youtube-dl", alias = "youtube_dl")]
    pub youtube_dl: YoutubeDl,
}

impl Default for Python {
    fn default() -> Self {
        Self {
            executable: default_python_executable(),
            script: None,
            youtube_dl: YoutubeDl::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoutubeDl {
    /// Release tag to install, or `latest`.
    #[serde(default = "default_ydl_version")]
    pub version: String,
    #[serde(default = "default_ydl_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,
    /// Reduced download preset (no thumbnails/subtitles).
    #[serde(default)]
    pub lite: bool,
    /// Forwarded to the fetcher verbatim through the `YDL_OPTS` env var.
    #[serde(default)]
    pub options: Option<serde_json::Value>,
}

impl Default for YoutubeDl {
    fn default() -> Self {
        Self {
            version: default_ydl_version(),
            update_interval: default_ydl_update_interval(),
            lite: false,
            options: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Youtube {
    #[serde(default)]
    pub oauth: OAuth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuth {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl OAuth {
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty()
            && !self.token_type.is_empty()
            && !self.refresh_token.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Browser {
    #[serde(default = "default_browser_executable")]
    pub executable: String,
    #[serde(default = "default_debug_port")]
    pub debug_port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
}

impl Default for Browser {
    fn default() -> Self {
        Self {
            executable: default_browser_executable(),
            debug_port: default_debug_port(),
            data_dir: None,
            extra_args: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load from `explicit`, or from the default location under the user's
    /// config directory.
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        let path = match explicit {
            Some(path) => expand_home(&path.to_string_lossy()),
            None => default_config_path().context("could not determine config directory")?,
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("could not read config file: {}", path.display()))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("could not parse config file: {}", path.display()))?;
        config.validate()?;

        Ok(config)
    }

    /// Expand paths, create the data layout, and reject configurations the
    /// service cannot run with.
    pub fn validate(&mut self) -> Result<()> {
        self.dirs.data = expand_home(&self.dirs.data.to_string_lossy());
        self.dirs.cache = expand_home(&self.dirs.cache.to_string_lossy());

        for dir in [
            self.dirs.data.clone(),
            self.dirs.data.join("metadata"),
            self.logs_dir(),
            self.dirs.cache.clone(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("could not create directory: {}", dir.display()))?;
        }

        if self.storages.is_empty() {
            bail!("at least one storage directory must be configured");
        }
        for entry in &mut self.storages {
            entry.path = expand_home(&entry.path.to_string_lossy());
        }

        if !self.sources.playlists.is_empty() && !self.youtube.oauth.is_complete() {
            bail!(
                "playlists are enabled, but youtube config is invalid:\n\
                 oauth.{{access_token, token_type, refresh_token}} are required"
            );
        }

        if self.sources.history.enable {
            self.validate_browser()
                .context("watch history is enabled, but browser is misconfigured")?;
        }

        if self.index.sweep_interval > self.index.lease_timeout / 5 {
            bail!(
                "index.sweep_interval ({:?}) must be at most a fifth of index.lease_timeout ({:?})",
                self.index.sweep_interval,
                self.index.lease_timeout
            );
        }

        if self.python.script.is_none() {
            self.python.script = Some(self.dirs.data.join("dl.py"));
        }
        self.python.executable = expand_home(&self.python.executable.to_string_lossy());

        Ok(())
    }

    fn validate_browser(&mut self) -> Result<()> {
        if self.browser.executable.is_empty() {
            bail!("`browser.executable` is required");
        }
        if self.browser.debug_port == 0 {
            bail!("`browser.debug_port` is required");
        }
        let Some(data_dir) = &self.browser.data_dir else {
            bail!("`browser.data_dir` is required");
        };
        self.browser.data_dir = Some(expand_home(&data_dir.to_string_lossy()));
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.dirs.data.join("metadata").join("index.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dirs.data.join("logs")
    }

    /// Root directory the managed upstream tool is unpacked into; also the
    /// fetcher's working directory.
    pub fn tool_root(&self) -> PathBuf {
        self.dirs.cache.join("tools")
    }

    pub fn fetch_cache(&self) -> PathBuf {
        self.dirs.cache.join("ydl_cache")
    }

    pub fn fetcher_script(&self) -> PathBuf {
        self.python
            .script
            .clone()
            .unwrap_or_else(|| self.dirs.data.join("dl.py"))
    }

    /// Copy with secrets blanked, for `reelvault config` output.
    pub fn redacted(&self) -> Config {
        let mut copy = self.clone();
        let oauth = &mut copy.youtube.oauth;
        for field in [
            &mut oauth.access_token,
            &mut oauth.refresh_token,
        ] {
            if !field.is_empty() {
                *field = "<set>".to_string();
            }
        }
        copy
    }
}

fn default_config_path() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join("reelvault").join("reelvault.yaml"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reelvault")
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reelvault")
}

fn default_update_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_duration() -> Duration {
    Duration::from_secs(9 * 3600)
}

fn default_lease_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_non_retriable() -> Vec<String> {
    NON_RETRIABLE_DEFAULTS.iter().map(|s| s.to_string()).collect()
}

fn default_python_executable() -> PathBuf {
    PathBuf::from("python3")
}

fn default_ydl_version() -> String {
    "latest".to_string()
}

fn default_ydl_update_interval() -> Duration {
    Duration::from_secs(3 * 3600)
}

fn default_browser_executable() -> String {
    "chromium".to_string()
}

fn default_debug_port() -> u16 {
    9222
}
