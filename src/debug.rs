//! Debug orchestrator.
//!
//! Launches a language debug server inside the owner's session container,
//! connects a [`DapClient`] to it and relays what the debuggee does back to
//! the owner. One debug session per sandbox session; its id is the session id.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

use crate::dap::{
    self, ClientEvent, DapClient, EvaluateResponse, OutputEventBody, ScopesResponse,
    StackTraceResponse, StoppedEventBody, VariablesResponse,
};
use crate::error::{Result, SandboxError};
use crate::events::{persist_debug_session, Notifier, RecordStore, SandboxEvent};
use crate::language::{self, DebugLauncher, LanguageSpec};
use crate::runtime::StreamKind;
use crate::session::{Session, SessionManager, SessionObserver};

/// Path fragments of interpreter and toolchain internals hidden from call stacks.
const INTERNAL_FRAME_MARKERS: &[&str] = &[
    "site-packages",
    "dist-packages",
    "/usr/lib/python",
    "/usr/local/lib/python",
    "<frozen",
    "debugpy",
    "pydevd",
    "runpy.py",
    "/usr/local/go/src",
    "/go/pkg/mod",
];

/// Output lines printed by debugger tooling rather than the debuggee.
const TOOLING_BANNERS: &[&str] = &[
    "pydevd",
    "debugpy",
    "Debugger warning",
    "frozen modules",
    "PYDEVD_DISABLE_FILE_VALIDATION",
    "API server listening at",
    "Type 'dlv help'",
    "go: downloading",
    "go: finding",
];

/// Scope entries debugpy groups internals under.
const SYNTHETIC_VARIABLES: &[&str] = &["special variables", "function variables", "class variables"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DebugStatus {
    Active,
    Paused,
    Terminated,
}

/// One user-visible stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    pub line: i64,
    pub column: i64,
    pub source_path: Option<String>,
}

impl From<dap::StackFrame> for StackFrame {
    fn from(frame: dap::StackFrame) -> Self {
        Self {
            id: frame.id,
            name: frame.name,
            line: frame.line,
            column: frame.column,
            source_path: frame.source.and_then(|source| source.path),
        }
    }
}

/// State of a debug session, as persisted and reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugSession {
    /// Same as the sandbox session id.
    pub id: String,
    pub owner_id: String,
    pub language: String,
    pub breakpoints: BTreeSet<u32>,
    pub status: DebugStatus,
    pub current_frame: Option<StackFrame>,
    pub variables: BTreeMap<String, String>,
    pub call_stack: Vec<StackFrame>,
    pub created_at: DateTime<Utc>,
}

/// A debug session plus whether a debugger connection is still attached.
#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    #[serde(flatten)]
    pub session: DebugSession,
    pub is_active: bool,
}

/// Commands accepted from the owner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebugCommand {
    StepOver,
    StepInto,
    StepOut,
    Continue,
    Pause,
    Stop,
    Evaluate { expression: String },
}

#[derive(Clone)]
struct DebugEntry {
    /// Distinguishes restarts within one sandbox session.
    run: u64,
    state: Arc<Mutex<DebugSession>>,
    client: Option<DapClient>,
}

fn lock(state: &Mutex<DebugSession>) -> std::sync::MutexGuard<'_, DebugSession> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn discard(_: StreamKind, _: &str) {}

/// Drives debug servers inside session containers.
pub struct DebugOrchestrator {
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn RecordStore>,
    entries: RwLock<HashMap<String, DebugEntry>>,
    next_run: AtomicU64,
}

impl DebugOrchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            sessions,
            notifier,
            store,
            entries: RwLock::new(HashMap::new()),
            next_run: AtomicU64::new(1),
        }
    }

    /// Languages that can be debugged.
    pub fn debuggable_languages() -> Vec<&'static str> {
        language::debuggable_languages()
    }

    /// Launch a debug session for `code` in the owner's sandbox session.
    ///
    /// Returns once the adapter accepted the configuration. A breakpoint hit
    /// arrives afterwards as a [`SandboxEvent::DebugPaused`] notification.
    pub async fn start_debug(
        self: &Arc<Self>,
        owner_id: &str,
        code: &str,
        language: &str,
        breakpoints: &[u32],
    ) -> Result<DebugSession> {
        let spec = language::resolve(language)?;
        let launcher = spec
            .debug
            .ok_or_else(|| SandboxError::UnsupportedLanguage(format!("{language} (debugging)")))?;
        let limit = self.sessions.settings().execution.max_code_size_bytes;
        if code.len() > limit {
            return Err(SandboxError::CodeTooLarge {
                size: code.len(),
                limit,
            });
        }

        let session = self.sessions.create_session(owner_id, language).await?;
        self.stop_existing(&session.id).await;

        let settings = &self.sessions.settings().debug;
        let port = settings.port.unwrap_or(launcher.port);
        let dir = self.sessions.workspace_dir(&session.id);
        let source_path = format!("{dir}/{}", launcher.filename);

        self.launch_server(&session, &launcher, code, &dir, &source_path, port)
            .await?;
        let ip = self.container_ip(&session).await?;
        let address = format!("{ip}:{port}");
        info!(session = %session.id, address = %address, "Connecting to debug adapter");

        let (client, events) = DapClient::connect(
            &address,
            settings.connect_attempts,
            Duration::from_millis(settings.connect_backoff_ms),
        )
        .await?;

        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(DebugSession {
            id: session.id.clone(),
            owner_id: owner_id.to_string(),
            language: spec.id.to_string(),
            breakpoints: breakpoints.iter().copied().collect(),
            status: DebugStatus::Active,
            current_frame: None,
            variables: BTreeMap::new(),
            call_stack: Vec::new(),
            created_at: Utc::now(),
        }));
        self.entries.write().await.insert(
            session.id.clone(),
            DebugEntry {
                run,
                state: Arc::clone(&state),
                client: Some(client.clone()),
            },
        );
        tokio::spawn(Arc::clone(self).pump(
            session.id.clone(),
            run,
            client.clone(),
            Arc::clone(&state),
            events,
        ));

        let breakpoints: Vec<u32> = lock(&state).breakpoints.iter().copied().collect();
        if let Err(e) = handshake(&client, spec, &dir, &source_path, port, &breakpoints).await {
            warn!(session = %session.id, error = %e, "Debug handshake failed");
            self.finish(&session.id, run).await;
            return Err(e);
        }

        let snapshot = lock(&state).clone();
        persist_debug_session(self.store.as_ref(), owner_id, &snapshot).await;
        info!(session = %session.id, breakpoints = breakpoints.len(), "Debug session started");
        Ok(snapshot)
    }

    async fn launch_server(
        &self,
        session: &Session,
        launcher: &DebugLauncher,
        code: &str,
        dir: &str,
        source_path: &str,
        port: u16,
    ) -> Result<()> {
        let runtime = self.sessions.runtime();
        let timeout = Duration::from_millis(self.sessions.settings().execution.timeout_ms);

        let lock = self.sessions.execute_lock(&session.id).await;
        let _guard = lock.lock().await;

        runtime
            .write_file(&session.container, source_path, code.as_bytes())
            .await?;

        // A debug server left over from an earlier attempt would hold the port.
        let free_port = format!("fuser -k {port}/tcp >/dev/null 2>&1 || true");
        runtime
            .exec_foreground(&session.container, &free_port, timeout, &discard)
            .await?;

        let command = language::debug_command(launcher, dir, port);
        debug!(session = %session.id, command = %command, "Starting debug server");
        runtime
            .exec_detached(&session.container, &["sh".into(), "-c".into(), command])
            .await
    }

    /// IP on the configured sandbox network, else on any attached network.
    async fn container_ip(&self, session: &Session) -> Result<String> {
        if let Some(ip) = &session.container.network_ip {
            return Ok(ip.clone());
        }
        let networks = self
            .sessions
            .runtime()
            .inspect_networks(&session.container)
            .await?;
        let preferred = &self.sessions.settings().docker.network;
        let attachment = networks.get(preferred).or_else(|| {
            let mut names: Vec<_> = networks.keys().collect();
            names.sort();
            names.first().and_then(|name| networks.get(*name))
        });
        let Some(attachment) = attachment else {
            return Err(SandboxError::ContainerFault(format!(
                "Container {} has no reachable network address",
                session.container.short_id()
            )));
        };
        self.sessions
            .cache_network_ip(&session.id, &attachment.ip_address)
            .await;
        Ok(attachment.ip_address.clone())
    }

    async fn stop_existing(&self, session_id: &str) {
        let run = self
            .entries
            .read()
            .await
            .get(session_id)
            .filter(|entry| entry.client.is_some())
            .map(|entry| entry.run);
        if let Some(run) = run {
            info!(session = %session_id, "Replacing running debug session");
            self.finish(session_id, run).await;
        }
    }

    /// Relay adapter events until the connection ends.
    async fn pump(
        self: Arc<Self>,
        session_id: String,
        run: u64,
        client: DapClient,
        state: Arc<Mutex<DebugSession>>,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let owner_id = lock(&state).owner_id.clone();
        let thread_id = self.sessions.settings().debug.thread_id;

        while let Some(event) = events.recv().await {
            let ClientEvent::Event(event) = event else {
                break;
            };
            match event.event.as_str() {
                "stopped" => {
                    let body: StoppedEventBody = event.body_as().unwrap_or_default();
                    let thread = body.thread_id.unwrap_or(thread_id);
                    match self.capture_pause(&client, &state, thread).await {
                        Ok(()) => {
                            let snapshot = lock(&state).clone();
                            self.notifier.notify(
                                &owner_id,
                                SandboxEvent::DebugPaused {
                                    session_id: session_id.clone(),
                                    reason: body.reason,
                                    line: snapshot.current_frame.as_ref().map(|f| f.line),
                                    frames: snapshot.call_stack,
                                    variables: snapshot.variables,
                                },
                            );
                        }
                        Err(e) => warn!(session = %session_id, error = %e, "Failed to inspect paused debuggee"),
                    }
                }
                "continued" => {
                    let mut state = lock(&state);
                    if state.status == DebugStatus::Paused {
                        state.status = DebugStatus::Active;
                    }
                }
                "output" => {
                    let body: OutputEventBody = event.body_as().unwrap_or_default();
                    let category = body.category.unwrap_or_else(|| "console".into());
                    if let Some(content) = clean_output(&category, &body.output) {
                        self.notifier.notify(
                            &owner_id,
                            SandboxEvent::DebugOutput {
                                session_id: session_id.clone(),
                                category,
                                content,
                            },
                        );
                    }
                }
                "terminated" => {
                    debug!(session = %session_id, "Debuggee terminated");
                    break;
                }
                other => trace!(session = %session_id, event = other, "Ignoring debug event"),
            }
        }
        self.finish(&session_id, run).await;
    }

    async fn capture_pause(
        &self,
        client: &DapClient,
        state: &Mutex<DebugSession>,
        thread_id: i64,
    ) -> Result<()> {
        let trace: StackTraceResponse = client
            .request_as("stackTrace", Some(json!({ "threadId": thread_id })))
            .await?;
        let raw_top = trace.stack_frames.first().cloned().map(StackFrame::from);
        let call_stack: Vec<StackFrame> = trace
            .stack_frames
            .into_iter()
            .map(StackFrame::from)
            .filter(|frame| !is_internal_frame(frame))
            .collect();
        let top = call_stack.first().cloned().or(raw_top);

        let mut variables = BTreeMap::new();
        if let Some(frame) = &top {
            let scopes: ScopesResponse = client
                .request_as("scopes", Some(json!({ "frameId": frame.id })))
                .await?;
            if let Some(scope) = scopes.scopes.iter().find(|scope| !scope.expensive) {
                let vars: VariablesResponse = client
                    .request_as(
                        "variables",
                        Some(json!({ "variablesReference": scope.variables_reference })),
                    )
                    .await?;
                variables = vars
                    .variables
                    .into_iter()
                    .filter(|var| !is_synthetic_variable(&var.name))
                    .map(|var| (var.name, var.value))
                    .collect();
            }
        }

        let mut session = lock(state);
        session.status = DebugStatus::Paused;
        session.current_frame = top;
        session.call_stack = call_stack;
        session.variables = variables;
        Ok(())
    }

    /// Tear a run down once. Later calls for the same run do nothing.
    async fn finish(&self, session_id: &str, run: u64) {
        let (client, snapshot) = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(session_id).filter(|e| e.run == run) else {
                return;
            };
            let Some(client) = entry.client.take() else {
                return;
            };
            let mut state = lock(&entry.state);
            state.status = DebugStatus::Terminated;
            (client, state.clone())
        };

        client.shutdown();
        info!(session = %session_id, "Debug session terminated");
        self.notifier.notify(
            &snapshot.owner_id,
            SandboxEvent::DebugTerminated {
                session_id: session_id.to_string(),
            },
        );
        persist_debug_session(self.store.as_ref(), &snapshot.owner_id, &snapshot).await;
    }

    async fn entry_for(&self, owner_id: &str, session_id: &str) -> Result<DebugEntry> {
        let entries = self.entries.read().await;
        entries
            .get(session_id)
            .filter(|entry| lock(&entry.state).owner_id == owner_id)
            .cloned()
            .ok_or_else(|| SandboxError::DebugSessionNotFound(session_id.to_string()))
    }

    /// Run a command against a live debug session.
    ///
    /// Returns the result text for `evaluate`, `None` otherwise.
    pub async fn send_command(
        &self,
        owner_id: &str,
        session_id: &str,
        command: DebugCommand,
    ) -> Result<Option<String>> {
        let entry = self.entry_for(owner_id, session_id).await?;
        let Some(client) = entry.client.clone() else {
            return Err(SandboxError::DebugSessionNotFound(session_id.to_string()));
        };
        self.sessions.touch(session_id).await;

        let request = match command {
            DebugCommand::StepOver => "next",
            DebugCommand::StepInto => "stepIn",
            DebugCommand::StepOut => "stepOut",
            DebugCommand::Continue => "continue",
            DebugCommand::Pause => "pause",
            DebugCommand::Stop => {
                self.stop_debug(owner_id, session_id).await?;
                return Ok(None);
            }
            DebugCommand::Evaluate { expression } => {
                return evaluate(&client, &entry.state, &expression).await.map(Some);
            }
        };

        let thread_id = self.sessions.settings().debug.thread_id;
        debug!(session = %session_id, command = request, "Debug command");
        client
            .request(request, Some(json!({ "threadId": thread_id })))
            .await?;
        if request != "pause" {
            let mut state = lock(&entry.state);
            if state.status == DebugStatus::Paused {
                state.status = DebugStatus::Active;
            }
        }
        Ok(None)
    }

    /// Close the debugger connection. Stopping a finished session is a no-op.
    pub async fn stop_debug(&self, owner_id: &str, session_id: &str) -> Result<()> {
        let entry = self.entry_for(owner_id, session_id).await?;
        info!(session = %session_id, owner = %owner_id, "Stopping debug session");
        self.finish(session_id, entry.run).await;
        Ok(())
    }

    pub async fn get_debug_session(&self, owner_id: &str, session_id: &str) -> Result<DebugSnapshot> {
        let entry = self.entry_for(owner_id, session_id).await?;
        self.sessions.touch(session_id).await;
        let session = lock(&entry.state).clone();
        let is_active = entry.client.is_some() && session.status != DebugStatus::Terminated;
        Ok(DebugSnapshot { session, is_active })
    }

    /// Close every debugger connection (called on shutdown).
    pub async fn stop_all(&self) {
        let live: Vec<(String, u64)> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.client.is_some())
            .map(|(id, entry)| (id.clone(), entry.run))
            .collect();
        for (session_id, run) in live {
            self.finish(&session_id, run).await;
        }
    }
}

#[async_trait]
impl SessionObserver for DebugOrchestrator {
    /// The container is gone, so the debuggee is too. Tear down and forget the entry.
    async fn session_ended(&self, session_id: &str) {
        let run = self.entries.read().await.get(session_id).map(|entry| entry.run);
        let Some(run) = run else {
            return;
        };
        self.finish(session_id, run).await;
        let mut entries = self.entries.write().await;
        if entries.get(session_id).is_some_and(|entry| entry.run == run) {
            entries.remove(session_id);
            debug!(session = %session_id, "Dropped debug session state");
        }
    }
}

/// Evaluate in the frame the debuggee is paused in.
async fn evaluate(
    client: &DapClient,
    state: &Mutex<DebugSession>,
    expression: &str,
) -> Result<String> {
    let frame_id = {
        let session = lock(state);
        if session.status == DebugStatus::Paused {
            session.current_frame.as_ref().map(|frame| frame.id)
        } else {
            None
        }
    };
    let Some(frame_id) = frame_id else {
        return Err(SandboxError::DebugCommandFailed {
            command: "evaluate".into(),
            message: "Debuggee is not paused".into(),
        });
    };
    let response: EvaluateResponse = client
        .request_as(
            "evaluate",
            Some(json!({
                "expression": expression,
                "frameId": frame_id,
                "context": "repl",
            })),
        )
        .await?;
    Ok(response.result)
}

/// `initialize`, then `attach` in flight while the configuration sequence
/// waits for the `initialized` event. Some adapters only answer `attach`
/// after `configurationDone`, so both halves are awaited together.
async fn handshake(
    client: &DapClient,
    spec: &LanguageSpec,
    dir: &str,
    source_path: &str,
    port: u16,
    breakpoints: &[u32],
) -> Result<()> {
    client
        .request(
            "initialize",
            Some(json!({
                "clientID": "code-sandbox",
                "adapterID": spec.id,
                "linesStartAt1": true,
                "columnsStartAt1": true,
                "pathFormat": "path",
                "supportsVariableType": true,
            })),
        )
        .await?;

    let attach = client.request(
        "attach",
        Some(json!({
            "name": "Remote Attach",
            "request": "attach",
            "connect": { "host": "localhost", "port": port },
            "pathMappings": [{ "localRoot": dir, "remoteRoot": dir }],
            "justMyCode": true,
        })),
    );

    let configure = async {
        client.wait_for_event("initialized").await?;
        client
            .request("setExceptionBreakpoints", Some(json!({ "filters": [] })))
            .await?;
        if !breakpoints.is_empty() {
            let lines: Vec<Value> = breakpoints.iter().map(|line| json!({ "line": line })).collect();
            client
                .request(
                    "setBreakpoints",
                    Some(json!({
                        "source": { "path": source_path },
                        "breakpoints": lines,
                    })),
                )
                .await?;
        }
        client.request("configurationDone", None).await?;
        Ok::<_, SandboxError>(())
    };

    tokio::try_join!(attach, configure)?;
    Ok(())
}

fn is_internal_frame(frame: &StackFrame) -> bool {
    match &frame.source_path {
        Some(path) => INTERNAL_FRAME_MARKERS.iter().any(|marker| path.contains(marker)),
        None => true,
    }
}

fn is_synthetic_variable(name: &str) -> bool {
    SYNTHETIC_VARIABLES.contains(&name) || (name.starts_with("__") && name.ends_with("__"))
}

/// Output text worth forwarding, with tooling banner lines removed.
fn clean_output(category: &str, output: &str) -> Option<String> {
    if category == "telemetry" {
        return None;
    }
    let kept: String = output
        .split_inclusive('\n')
        .filter(|line| !TOOLING_BANNERS.iter().any(|banner| line.contains(banner)))
        .collect();
    (!kept.is_empty()).then_some(kept)
}
