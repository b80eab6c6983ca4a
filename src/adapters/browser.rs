//! Headless-browser watch-history source.
//!
//! Launches the configured browser with the user's profile, dumps the
//! history feed's DOM, and extracts the embedded page-data JSON blob. The
//! browser carries the session cookies, so no separate authentication is
//! needed here.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::HistorySource;
use crate::config;

const HISTORY_URL: &str = "https://www.youtube.com/feed/history";
const DATA_KEY: &str = "ytInitialData";
const DUMP_TIMEOUT: Duration = Duration::from_secs(20);

/// How far after the key name the opening brace of the blob may sit.
const KEY_BRACE_WINDOW: usize = 16;

pub struct Browser {
    executable: String,
    args: Vec<String>,
}

impl Browser {
    pub fn new(cfg: &config::Browser) -> Result<Self> {
        let mut pairs: Vec<(String, String)> = cfg
            .extra_args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(data_dir) = &cfg.data_dir {
            if !data_dir.is_dir() {
                bail!("invalid browser data directory: {}", data_dir.display());
            }
            pairs.push((
                "--user-data-dir".to_string(),
                data_dir.to_string_lossy().into_owned(),
            ));
        }
        pairs.push(("--headless".to_string(), String::new()));
        pairs.push((
            "--remote-debugging-port".to_string(),
            cfg.debug_port.to_string(),
        ));

        let args = pairs
            .into_iter()
            .map(|(k, v)| if v.is_empty() { k } else { format!("{}={}", k, v) })
            .collect();

        Ok(Self {
            executable: cfg.executable.clone(),
            args,
        })
    }

    async fn dump_dom(&self, url: &str) -> Result<String> {
        debug!(executable = %self.executable, url, "dumping page");

        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args)
            .arg("--dump-dom")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = timeout(DUMP_TIMEOUT, cmd.output())
            .await
            .context("browser timed out")?
            .context("could not run browser")?;

        if !output.status.success() {
            bail!(
                "browser exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl HistorySource for Browser {
    async fn history_blob(&self) -> Result<serde_json::Value> {
        let dom = self.dump_dom(HISTORY_URL).await?;
        extract_blob(&dom, DATA_KEY).context("page data blob not found in history page")
    }
}

/// Find `<key> = {...}` in page text and decode the object, ignoring
/// whatever trails it. The key can appear in unrelated script text, so only
/// an occurrence followed by a decodable object counts.
fn extract_blob(text: &str, key: &str) -> Option<serde_json::Value> {
    let mut search = 0;
    while let Some(pos) = text[search..].find(key) {
        let after_key = search + pos + key.len();
        let window = &text[after_key..text.len().min(after_key + KEY_BRACE_WINDOW)];

        if let Some(brace) = window.find('{') {
            let candidate = &text[after_key + brace..];
            let mut stream = serde_json::Deserializer::from_str(candidate)
                .into_iter::<serde_json::Value>();
            if let Some(Ok(value @ serde_json::Value::Object(_))) = stream.next() {
                return Some(value);
            }
        }
        search = after_key;
    }
    None
}
