//! Process supervision: locate the browser executable, launch it with its
//! transport wired up, and track its lifetime.
//!
//! The launch path is split from the lifetime-tracking `Supervisor` type on
//! purpose - `launch` is a pure function of (executable, flags, output dir)
//! that a test can call without worrying about teardown bookkeeping, while
//! `Supervisor` is the thing a session holds onto for the process's
//! lifetime.

use crate::cell::SafeCell;
use crate::error::SupervisorError;
use crate::transport::{self, TransportReader, TransportWriter};
use regex::Regex;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

const ENV_BROWSER_PATH: &str = "CDP_BROWSER_PATH";
const ADDRESS_POLL_INTERVAL: Duration = Duration::from_millis(10);
const ADDRESS_TIMEOUT: Duration = Duration::from_secs(60);

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"ws://([^\s/]+:\d+)(/devtools/browser/[\w-]{36})").unwrap())
}

#[cfg(target_os = "macos")]
fn candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        PathBuf::from("/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"),
    ]
}

#[cfg(target_os = "linux")]
fn candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("google-chrome-stable"),
        PathBuf::from("google-chrome"),
        PathBuf::from("chromium-browser"),
        PathBuf::from("chromium"),
        PathBuf::from("microsoft-edge-stable"),
    ]
}

#[cfg(target_os = "windows")]
fn candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files\Microsoft\Edge\Application\msedge.exe"),
    ]
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
fn candidates() -> Vec<PathBuf> {
    vec![PathBuf::from("chromium"), PathBuf::from("chromium-browser")]
}

/// Resolve the browser executable: an explicit override, then
/// `CDP_BROWSER_PATH`, then a platform-dependent candidate list (absolute
/// paths checked directly, bare names looked up on `PATH`).
pub fn find_executable(explicit: Option<&Path>) -> Result<PathBuf, SupervisorError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
    }

    if let Ok(value) = std::env::var(ENV_BROWSER_PATH) {
        let path = PathBuf::from(value);
        if path.is_file() {
            return Ok(path);
        }
    }

    let path_var = std::env::var_os("PATH");
    for candidate in candidates() {
        if candidate.is_absolute() {
            if candidate.is_file() {
                return Ok(candidate);
            }
            continue;
        }
        if let Some(found) = which_in(&candidate, path_var.as_deref()) {
            return Ok(found);
        }
    }

    Err(SupervisorError::NotFound)
}

fn which_in(basename: &Path, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let path_var = path_var?;
    for dir in std::env::split_paths(path_var) {
        let candidate = dir.join(basename);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Render one `--flag` or `--flag=value` command-line argument.
pub fn render_flag(key: &str, value: Option<&str>) -> String {
    match value {
        Some(v) => format!("--{key}={v}"),
        None => format!("--{key}"),
    }
}

/// Everything the supervisor produced by launching the child.
pub struct LaunchedBrowser {
    pub child: Child,
    pub reader: Box<dyn TransportReader + Send>,
    pub writer: Box<dyn TransportWriter + Send + Sync>,
}

/// Spawn `executable` with `flags`, redirecting stdout/stderr under
/// `output_dir`, and wire up its transport.
pub async fn launch(
    executable: &Path,
    flags: &[(String, Option<String>)],
    output_dir: &Path,
) -> Result<LaunchedBrowser, SupervisorError> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|source| SupervisorError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

    let stdout_path = output_dir.join("stdout.txt");
    let stderr_path = output_dir.join("stderr.txt");

    let mut command = Command::new(executable);
    command.kill_on_drop(true);
    for (key, value) in flags {
        command.arg(render_flag(key, value.as_deref()));
    }

    let stdout_file = std::fs::File::create(&stdout_path).map_err(|source| SupervisorError::OutputDir {
        path: stdout_path.clone(),
        source,
    })?;
    command.stdout(Stdio::from(stdout_file));
    command.stdin(Stdio::null());

    #[cfg(unix)]
    {
        let stderr_file = std::fs::File::create(&stderr_path).map_err(|source| SupervisorError::OutputDir {
            path: stderr_path.clone(),
            source,
        })?;
        command.stderr(Stdio::from(stderr_file));
        // The landing URL is the final argument, after every flag (§4.E, §6).
        command.arg("about:blank");

        let prepared = transport::prepare_pipe(&mut command)?;
        let child = command.spawn().map_err(SupervisorError::Spawn)?;
        let reader = prepared.finish()?;
        let writer = prepared.writer;
        Ok(LaunchedBrowser {
            child,
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    #[cfg(windows)]
    {
        command.arg("--remote-debugging-port=0");
        // The landing URL is the final argument, after every flag (§4.E, §6).
        command.arg("about:blank");
        command.stderr(Stdio::piped());
        let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
        let (reader, writer) = discover_websocket_transport(&mut child, &stderr_path).await?;
        Ok(LaunchedBrowser { child, reader, writer })
    }
}

/// Scrape the child's stderr for `DevTools listening on ws://...`, tee every
/// line to `stderr_path`, and dial the address once found.
#[cfg(windows)]
async fn discover_websocket_transport(
    child: &mut Child,
    stderr_path: &Path,
) -> Result<(Box<dyn TransportReader + Send>, Box<dyn TransportWriter + Send + Sync>), SupervisorError> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SupervisorError::Spawn(std::io::Error::other("child has no stderr handle")))?;

    let mut tee = tokio::fs::File::create(stderr_path)
        .await
        .map_err(|source| SupervisorError::OutputDir {
            path: stderr_path.to_path_buf(),
            source,
        })?;

    let address_cell = Arc::new(SafeCell::new());
    let scanner_cell = address_cell.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = tee.write_all(line.as_bytes()).await;
            let _ = tee.write_all(b"\n").await;
            if scanner_cell.read().await.is_none() {
                if let Some(caps) = address_pattern().captures(&line) {
                    scanner_cell.write(format!("ws://{}{}", &caps[1], &caps[2])).await;
                }
            }
        }
    });

    let deadline = tokio::time::Instant::now() + ADDRESS_TIMEOUT;
    loop {
        if let Some(address) = address_cell.read().await {
            let (reader, writer) = transport::connect_websocket(&address).await?;
            return Ok((Box::new(reader), Box::new(writer)));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SupervisorError::AddressTimeout);
        }
        tokio::time::sleep(ADDRESS_POLL_INTERVAL).await;
    }
}

/// Tracks a launched child's lifetime: a monitor task waits on it and flips
/// `exited` once it's gone, and `cancel` is the idempotent hard-kill path.
pub struct Supervisor {
    child: Mutex<Option<Child>>,
    exited_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
    closing: AtomicBool,
}

impl Supervisor {
    /// `cancel` is the owning session's cancellation token. Per §4.E, the
    /// monitor trips it the moment the child exits on its own (crash, the
    /// user closing the last window, `Browser.close` taking effect) - not
    /// just when the caller cancels first.
    pub fn new(child: Child, cancel: CancellationToken) -> Arc<Self> {
        let (exited_tx, exited_rx) = watch::channel(false);
        let supervisor = Arc::new(Self {
            child: Mutex::new(Some(child)),
            exited_tx,
            exited_rx,
            closing: AtomicBool::new(false),
        });

        let monitor = supervisor.clone();
        tokio::spawn(async move {
            let status = {
                let mut guard = monitor.child.lock().await;
                match guard.as_mut() {
                    Some(child) => child.wait().await,
                    None => return,
                }
            };
            match status {
                Ok(status) => tracing::info!(?status, "browser process exited"),
                Err(err) => tracing::warn!(error = %err, "error waiting on browser process"),
            }
            let _ = monitor.exited_tx.send(true);
            cancel.cancel();
        });

        supervisor
    }

    pub fn has_exited(&self) -> bool {
        *self.exited_rx.borrow()
    }

    /// Resolves once the monitor task has observed the child exit.
    pub async fn wait_closed(&self) {
        let mut rx = self.exited_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Hard-kill the child. Idempotent: a second call, or a call after the
    /// child has already exited on its own, is a no-op.
    pub async fn cancel(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.has_exited() {
            return;
        }
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
        }
    }
}
