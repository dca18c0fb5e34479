//! Session lifecycle (component F): locates/launches the browser, wires its
//! transport into the multiplexer, attaches to a tab, and hands external
//! collaborators one handle (`Arc<Session>`) through which everything else
//! (CDP requests, event subscriptions, teardown) flows.
//!
//! A root `Session` owns the browser process, transport and routing maps.
//! A child `Session` (`Session::new_child`) shares all of that by `Arc` and
//! only owns its own target id, CDP session id and cancellation token - see
//! §3's ownership rules and invariant I5.

use crate::codec::{CdpSessionId, TargetId};
use crate::error::{SessionError, SupervisorError, TransportError};
use crate::log::WireLog;
use crate::multiplexer::{EventStream, Multiplexer};
use crate::supervisor::{self, Supervisor};
use crate::transport::{TransportReader, TransportWriter};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const ENV_OUTPUT_ROOT: &str = "CDP_OUTPUT_ROOT";
const TAB_DISCOVERY_POLL: Duration = Duration::from_millis(10);
const TAB_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// One command-line flag value, rendered per §6: `true` -> bare `--flag`,
/// `false` -> omitted entirely, anything else -> `--flag=value`.
#[derive(Debug, Clone)]
pub enum FlagValue {
    Bool(bool),
    Str(String),
    Int(i64),
}

impl FlagValue {
    fn render(&self, key: &str) -> Option<(String, Option<String>)> {
        match self {
            FlagValue::Bool(true) => Some((key.to_string(), None)),
            FlagValue::Bool(false) => None,
            FlagValue::Str(v) => Some((key.to_string(), Some(v.clone()))),
            FlagValue::Int(v) => Some((key.to_string(), Some(v.to_string()))),
        }
    }
}

/// Caller-supplied options for a root session. The two dedicated overrides
/// (`executable`, `user_data_dir`) plus an open-ended flag map cover the
/// whole command-line surface (§6) - the ~100-entry default flag list the
/// distilled spec calls out is an external collaborator's concern, not the
/// core's.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub executable: Option<PathBuf>,
    pub user_data_dir: Option<PathBuf>,
    pub flags: Vec<(String, FlagValue)>,
}

/// The three observable session states from §4.F. Transitions are
/// unbound -> bound -> torn down, or unbound -> torn down on construction
/// failure; nothing else is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Bound,
    TornDown,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Unbound,
            1 => SessionState::Bound,
            _ => SessionState::TornDown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Unbound => 0,
            SessionState::Bound => 1,
            SessionState::TornDown => 2,
        }
    }
}

/// Transport decorator that mirrors every message through `cdp_json.log`
/// (§6) before/after it touches the real transport. Kept at the session
/// boundary rather than in `multiplexer.rs` - the multiplexer itself has no
/// notion of a wire log, only bytes in and out.
struct LoggingReader {
    inner: Box<dyn TransportReader + Send>,
    log: Arc<WireLog>,
}

#[async_trait]
impl TransportReader for LoggingReader {
    async fn read_message(&mut self) -> Result<Vec<u8>, TransportError> {
        let bytes = self.inner.read_message().await?;
        self.log.incoming(&String::from_utf8_lossy(&bytes)).await;
        Ok(bytes)
    }
}

struct LoggingWriter {
    inner: Box<dyn TransportWriter + Send + Sync>,
    log: Arc<WireLog>,
}

#[async_trait]
impl TransportWriter for LoggingWriter {
    async fn write_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.log.outgoing(&String::from_utf8_lossy(&bytes)).await;
        self.inner.write_message(bytes).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

/// The multiplexer instantiation every session shares.
pub type Mux = Multiplexer<LoggingWriter>;

/// Everything a root session owns exclusively and shares with its children
/// by reference (§3, §5 shared-resource policy).
struct RootShared {
    output_dir: PathBuf,
    user_data_dir: PathBuf,
    mux: Arc<Mux>,
    supervisor: Arc<Supervisor>,
    #[allow(dead_code)]
    wire_log: Arc<WireLog>,
    cancel: CancellationToken,
}

/// A session bound to one CDP target - either the root session (bound to
/// the browser's first page target) or a child session (bound to a tab it
/// opened itself).
pub struct Session {
    shared: Arc<RootShared>,
    target_id: TargetId,
    cdp_session_id: CdpSessionId,
    cancel: CancellationToken,
    is_root: bool,
    state: AtomicU8,
}

fn output_dir_name() -> String {
    format!("chrome_vision_{}", Utc::now().format("%Y%m%d_%H%M%S%.9f"))
}

fn build_output_dir() -> PathBuf {
    let root = std::env::var(ENV_OUTPUT_ROOT)
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    root.join(output_dir_name())
}

fn render_flags(options: &SessionOptions, user_data_dir: &Path) -> Vec<(String, Option<String>)> {
    let mut rendered: Vec<(String, Option<String>)> = options
        .flags
        .iter()
        .filter_map(|(key, value)| value.render(key))
        .collect();
    rendered.push((
        "user-data-dir".to_string(),
        Some(user_data_dir.to_string_lossy().into_owned()),
    ));
    #[cfg(unix)]
    rendered.push(("remote-debugging-pipe".to_string(), None));
    rendered
}

impl Session {
    /// Root construction (§4.F): launch the browser, attach to its first
    /// unattached page target, enable page/lifecycle events.
    pub async fn launch(options: SessionOptions) -> Result<Arc<Session>, SessionError> {
        Self::launch_under(options, CancellationToken::new()).await
    }

    /// Like `launch`, but the session's cancellation is a child of
    /// `parent_cancel` - tripping `parent_cancel` tears this session down
    /// too, matching a caller-provided cancellation scope (§1, §5).
    pub async fn launch_under(
        options: SessionOptions,
        parent_cancel: CancellationToken,
    ) -> Result<Arc<Session>, SessionError> {
        let cancel = parent_cancel.child_token();

        let output_dir = build_output_dir();
        let user_data_dir = options
            .user_data_dir
            .clone()
            .unwrap_or_else(|| output_dir.join("user-data"));

        if let Err(source) = tokio::fs::create_dir_all(&output_dir).await {
            cancel.cancel();
            return Err(SupervisorError::OutputDir {
                path: output_dir.clone(),
                source,
            }
            .into());
        }
        if let Err(source) = tokio::fs::create_dir_all(&user_data_dir).await {
            cancel.cancel();
            return Err(SupervisorError::OutputDir {
                path: user_data_dir.clone(),
                source,
            }
            .into());
        }

        let wire_log = match WireLog::create(&output_dir.join("cdp_json.log")).await {
            Ok(log) => Arc::new(log),
            Err(source) => {
                cancel.cancel();
                return Err(SupervisorError::OutputDir {
                    path: output_dir.join("cdp_json.log"),
                    source,
                }
                .into());
            }
        };

        let executable = match supervisor::find_executable(options.executable.as_deref()) {
            Ok(path) => path,
            Err(err) => {
                cancel.cancel();
                return Err(err.into());
            }
        };

        let flags = render_flags(&options, &user_data_dir);
        let launched = match supervisor::launch(&executable, &flags, &output_dir).await {
            Ok(launched) => launched,
            Err(err) => {
                cancel.cancel();
                return Err(err.into());
            }
        };

        let reader = LoggingReader {
            inner: launched.reader,
            log: wire_log.clone(),
        };
        let writer = LoggingWriter {
            inner: launched.writer,
            log: wire_log.clone(),
        };
        let mux = Multiplexer::<LoggingWriter>::spawn(reader, writer);
        let browser = Supervisor::new(launched.child, cancel.clone());

        let shared = Arc::new(RootShared {
            output_dir,
            user_data_dir,
            mux,
            supervisor: browser,
            wire_log,
            cancel: cancel.clone(),
        });
        spawn_teardown_observer(shared.clone());

        let target_id = match discover_first_page_target(&shared.mux).await {
            Ok(id) => id,
            Err(err) => {
                shared.cancel.cancel();
                return Err(err);
            }
        };

        let cdp_session_id = match attach_to_target(&shared.mux, &target_id).await {
            Ok(id) => id,
            Err(err) => {
                shared.cancel.cancel();
                return Err(err);
            }
        };

        if let Err(err) = shared
            .mux
            .send_and_wait("Page.enable", None, Some(cdp_session_id.clone()))
            .await
        {
            shared.cancel.cancel();
            return Err(err.into());
        }
        if let Err(err) = shared
            .mux
            .send_and_wait(
                "Page.setLifecycleEventsEnabled",
                Some(json!({"enabled": true})),
                Some(cdp_session_id.clone()),
            )
            .await
        {
            shared.cancel.cancel();
            return Err(err.into());
        }

        Ok(Arc::new(Session {
            shared,
            target_id,
            cdp_session_id,
            cancel,
            is_root: true,
            state: AtomicU8::new(SessionState::Bound.as_u8()),
        }))
    }

    /// Child construction (§4.F): open a new tab on the same browser and
    /// attach to it. The child shares the parent's transport/routing maps
    /// by reference; only its target id, CDP session id and cancellation
    /// token are its own.
    pub async fn new_child(parent: &Arc<Session>) -> Result<Arc<Session>, SessionError> {
        let shared = parent.shared.clone();
        let cancel = parent.cancel.child_token();

        let target_id = match create_target(&shared.mux).await {
            Ok(id) => id,
            Err(err) => {
                cancel.cancel();
                return Err(err);
            }
        };
        let cdp_session_id = match attach_to_target(&shared.mux, &target_id).await {
            Ok(id) => id,
            Err(err) => {
                cancel.cancel();
                return Err(err);
            }
        };

        Ok(Arc::new(Session {
            shared,
            target_id,
            cdp_session_id,
            cancel,
            is_root: false,
            state: AtomicU8::new(SessionState::Bound.as_u8()),
        }))
    }

    pub fn target_id(&self) -> &TargetId {
        &self.target_id
    }

    pub fn cdp_session_id(&self) -> &CdpSessionId {
        &self.cdp_session_id
    }

    pub fn output_dir(&self) -> &Path {
        &self.shared.output_dir
    }

    pub fn user_data_dir(&self) -> &Path {
        &self.shared.user_data_dir
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Streaming send, scoped to this session's target.
    pub fn send(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<oneshot::Receiver<crate::codec::Message>, crate::error::MuxError> {
        self.shared
            .mux
            .send(method, params, Some(self.cdp_session_id.clone()))
    }

    /// Blocking send, scoped to this session's target.
    pub async fn send_and_wait(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<Value, crate::error::MuxError> {
        self.shared
            .mux
            .send_and_wait(method, params, Some(self.cdp_session_id.clone()))
            .await
    }

    pub fn subscribe(&self, method: impl Into<String>) -> EventStream {
        self.shared.mux.subscribe(method)
    }

    /// Resolves once the browser process has exited, for any reason
    /// (supplements §4.E's completion signal - §1.B).
    pub async fn wait_closed(&self) {
        self.shared.supervisor.wait_closed().await;
    }

    /// Graceful teardown. On the root session this sends `Browser.close`
    /// and waits for the browser to actually exit. On a child session it
    /// closes just this tab and leaves the browser running (I5).
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.is_root {
            let _ = self.shared.mux.send_and_wait("Browser.close", None, None).await;
            self.shared.supervisor.wait_closed().await;
            self.shared.cancel.cancel();
        } else {
            let _ = self
                .shared
                .mux
                .send_and_wait(
                    "Target.closeTarget",
                    Some(json!({"targetId": self.target_id})),
                    None,
                )
                .await;
            self.cancel.cancel();
        }
        self.state.store(SessionState::TornDown.as_u8(), Ordering::SeqCst);
        Ok(())
    }

    /// Forceful teardown: trips this session's cancellation without
    /// attempting a graceful CDP close first.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.state.store(SessionState::TornDown.as_u8(), Ordering::SeqCst);
    }
}

/// Tears down the shared transport/browser once the root cancellation
/// fires - the process-monitor-triggers-cancellation direction is handled
/// inside `Supervisor::new`; this is the reverse direction (cancellation
/// triggers process kill + transport close), matching §5's "tripping it
/// causes the process monitor to kill the child" requirement for the case
/// where the *caller* cancels before the browser exits on its own.
fn spawn_teardown_observer(shared: Arc<RootShared>) {
    tokio::spawn(async move {
        shared.cancel.cancelled().await;
        shared.supervisor.cancel().await;
        shared.mux.close().await;
        shared.wire_log.flush().await;
    });
}

async fn discover_first_page_target(mux: &Arc<Mux>) -> Result<TargetId, SessionError> {
    let deadline = tokio::time::Instant::now() + TAB_DISCOVERY_TIMEOUT;
    loop {
        if let Ok(result) = mux.send_and_wait("Target.getTargets", None, None).await {
            if let Some(found) = first_unattached_page(&result) {
                return Ok(found);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SessionError::TabDiscoveryTimeout);
        }
        tokio::time::sleep(TAB_DISCOVERY_POLL).await;
    }
}

fn first_unattached_page(targets_result: &Value) -> Option<TargetId> {
    targets_result
        .get("targetInfos")?
        .as_array()?
        .iter()
        .find(|info| {
            info.get("type").and_then(Value::as_str) == Some("page")
                && info.get("attached").and_then(Value::as_bool) == Some(false)
        })
        .and_then(|info| info.get("targetId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

async fn create_target(mux: &Arc<Mux>) -> Result<TargetId, SessionError> {
    let result = mux
        .send_and_wait("Target.createTarget", Some(json!({"url": ""})), None)
        .await?;
    result
        .get("targetId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SessionError::from(crate::error::MuxError::Protocol {
            code: 0,
            message: "Target.createTarget response missing targetId".to_string(),
        }))
}

async fn attach_to_target(mux: &Arc<Mux>, target_id: &TargetId) -> Result<CdpSessionId, SessionError> {
    let result = mux
        .send_and_wait(
            "Target.attachToTarget",
            Some(json!({"targetId": target_id, "flatten": true})),
            None,
        )
        .await?;
    result
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SessionError::from(crate::error::MuxError::Protocol {
            code: 0,
            message: "Target.attachToTarget response missing sessionId".to_string(),
        }))
}
