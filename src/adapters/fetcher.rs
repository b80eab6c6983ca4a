//! Fetcher subprocess supervision.
//!
//! The fetcher is a black-box child process: human-readable lines go to its
//! log file, the machine-readable outcome to stdout. A classified failure
//! exits with a well-known code and a JSON error object; anything else is an
//! unknown failure. The child runs in its own process group so that a
//! cancellation tears down the whole subtree, muxer included.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::index::FileRecord;

/// Exit code the fetcher uses for classified failures.
pub const KNOWN_ERROR_CODE: i32 = 0xE7;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Classified failure reported by the fetcher itself.
    #[error("{error}")]
    Script { error: String, reason: String },

    #[error("timeout exceeded")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("fetcher exited with code {code}:\n{output}")]
    Exit { code: i32, output: String },

    #[error("could not decode fetcher output: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Environmental failures the fetcher expects to self-heal.
    pub fn is_system(&self) -> bool {
        matches!(self, FetchError::Script { reason, .. } if reason == "system")
    }
}

/// One archived video as reported on the fetcher's stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchResult {
    #[serde(alias = "ID")]
    pub id: String,
    #[serde(default, alias = "Files")]
    pub files: Vec<FileRecord>,
}

#[derive(Default, Deserialize)]
struct ScriptErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub log_path: &'a Path,
    pub root: &'a Path,
    pub dst: &'a Path,
}

pub struct Fetcher {
    python: PathBuf,
    script: PathBuf,
    workdir: PathBuf,
    cache_dir: PathBuf,
    ydl_opts: Option<serde_json::Value>,
}

impl Fetcher {
    pub fn new(
        python: PathBuf,
        script: PathBuf,
        workdir: PathBuf,
        cache_dir: PathBuf,
        ydl_opts: Option<serde_json::Value>,
    ) -> Self {
        Self {
            python,
            script,
            workdir,
            cache_dir,
            ydl_opts,
        }
    }

    /// Run one fetch to completion, cancellation, or the wall-clock limit.
    pub async fn run(
        &self,
        token: &CancellationToken,
        req: FetchRequest<'_>,
        limit: Duration,
    ) -> Result<Vec<FetchResult>, FetchError> {
        let mut cmd = Command::new(&self.python);
        cmd.arg(&self.script)
            .arg(format!("--log={}", req.log_path.display()))
            .arg(format!("--root={}", req.root.display()))
            .arg(format!("--cache={}", self.cache_dir.display()))
            .arg(format!("--dst={}", req.dst.display()))
            .arg(req.url)
            .current_dir(&self.workdir)
            .env("PYTHONPATH", &self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        if let Some(opts) = &self.ydl_opts {
            cmd.env("YDL_OPTS", serde_json::to_string(opts)?);
        }

        debug!(url = req.url, "running fetcher");
        let mut child = cmd.spawn()?;
        let pid = child.id();

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("missing stdout pipe"))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("missing stderr pipe"))?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = token.cancelled() => {
                kill_group(pid);
                let _ = child.wait().await;
                return Err(FetchError::Cancelled);
            }
            _ = tokio::time::sleep(limit) => {
                kill_group(pid);
                let _ = child.wait().await;
                return Err(FetchError::Timeout);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            return Ok(serde_json::from_slice(&stdout)?);
        }

        let code = status.code().unwrap_or(-1);
        if code == KNOWN_ERROR_CODE {
            // The error object arrives on stdout per the contract; older
            // fetcher revisions wrote it to stderr.
            for stream in [&stdout, &stderr] {
                if let Ok(body) = serde_json::from_slice::<ScriptErrorBody>(stream) {
                    if !body.error.is_empty() || !body.reason.is_empty() {
                        return Err(FetchError::Script {
                            error: body.error,
                            reason: body.reason,
                        });
                    }
                }
            }
            warn!("fetcher used the known-error exit code without a decodable error object");
        }

        let mut output = String::from_utf8_lossy(&stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&stderr));
        Err(FetchError::Exit {
            code,
            output: output.trim().to_string(),
        })
    }
}

fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}
