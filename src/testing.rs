//! In-memory doubles for the runtime and the caller-layer contracts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::debug::DebugSession;
use crate::error::{Result, SandboxError};
use crate::events::{Notifier, RecordStore, SandboxEvent};
use crate::execution::ExecutionRecord;
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerSummary, ExecOutput,
    NetworkAttachment, OutputSink, StreamKind,
};

/// Scripted result of the next foreground commands.
#[derive(Debug, Clone, Default)]
pub struct ExecScript {
    pub chunks: Vec<(StreamKind, String)>,
    pub exit_code: i64,
    /// Time the command "runs" after emitting its chunks.
    pub delay: Duration,
}

impl ExecScript {
    pub fn stdout(data: &str) -> Self {
        Self {
            chunks: vec![(StreamKind::Stdout, data.to_string())],
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct MockState {
    created: Vec<ContainerSpec>,
    stopped: Vec<String>,
    removed: Vec<String>,
    log: Vec<String>,
    exec_commands: Vec<String>,
    written: Vec<(String, String)>,
    detached: Vec<Vec<String>>,
    listed: Vec<ContainerSummary>,
    failing_removals: HashSet<String>,
    fail_starts: bool,
    fail_stops: bool,
    script: ExecScript,
    create_gate: Option<Arc<Notify>>,
    networks: HashMap<String, NetworkAttachment>,
    running_execs: usize,
    max_running_execs: usize,
}

/// Runtime that records every call instead of touching an engine.
pub struct MockRuntime {
    state: Mutex<MockState>,
    next_id: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        let state = MockState {
            networks: HashMap::from([(
                "bridge".to_string(),
                NetworkAttachment {
                    ip_address: "127.0.0.1".into(),
                },
            )]),
            ..MockState::default()
        };
        Self {
            state: Mutex::new(state),
            next_id: AtomicUsize::new(1),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.with(|s| s.created.clone())
    }

    pub fn stopped(&self) -> Vec<String> {
        self.with(|s| s.stopped.clone())
    }

    /// Ids whose removal succeeded.
    pub fn removed(&self) -> Vec<String> {
        self.with(|s| s.removed.clone())
    }

    /// Ordered `create <id>` / `stop <id>` entries.
    pub fn log(&self) -> Vec<String> {
        self.with(|s| s.log.clone())
    }

    pub fn exec_commands(&self) -> Vec<String> {
        self.with(|s| s.exec_commands.clone())
    }

    /// Highest number of foreground commands that overlapped.
    pub fn max_concurrent_execs(&self) -> usize {
        self.with(|s| s.max_running_execs)
    }

    /// `(path, contents)` of every uploaded file.
    pub fn written(&self) -> Vec<(String, String)> {
        self.with(|s| s.written.clone())
    }

    /// Make the next container creations wait, after the container is listed,
    /// until the returned gate is notified.
    pub fn hold_creates(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.with(|s| s.create_gate = Some(Arc::clone(&gate)));
        gate
    }

    pub fn detached(&self) -> Vec<Vec<String>> {
        self.with(|s| s.detached.clone())
    }

    pub fn add_listed(&self, summary: ContainerSummary) {
        self.with(|s| s.listed.push(summary));
    }

    pub fn fail_removal_of(&self, id: &str) {
        self.with(|s| s.failing_removals.insert(id.to_string()));
    }

    pub fn fail_starts(&self, fail: bool) {
        self.with(|s| s.fail_starts = fail);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.with(|s| s.fail_stops = fail);
    }

    pub fn script(&self, script: ExecScript) {
        self.with(|s| s.script = script);
    }

    pub fn set_networks(&self, networks: &[(&str, &str)]) {
        self.with(|s| {
            s.networks = networks
                .iter()
                .map(|(name, ip)| {
                    (
                        (*name).to_string(),
                        NetworkAttachment {
                            ip_address: (*ip).to_string(),
                        },
                    )
                })
                .collect();
        });
    }

    async fn play(
        &self,
        handle: &ContainerHandle,
        script: &ExecScript,
        timeout: Duration,
        on_output: OutputSink<'_>,
    ) -> Result<ExecOutput> {
        let mut output = ExecOutput {
            exit_code: script.exit_code,
            ..ExecOutput::default()
        };
        for (kind, data) in &script.chunks {
            on_output(*kind, data);
            match kind {
                StreamKind::Stdout => output.stdout.push_str(data),
                StreamKind::Stderr => output.stderr.push_str(data),
            }
        }

        if tokio::time::timeout(timeout, tokio::time::sleep(script.delay))
            .await
            .is_err()
        {
            self.stop(handle, Duration::ZERO).await?;
            return Err(SandboxError::ExecutionTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let id = format!("container-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let gate = self.with(|s| {
            s.created.push(spec.clone());
            s.log.push(format!("create {id}"));
            s.listed.push(ContainerSummary {
                id: id.clone(),
                name: spec.name.clone().unwrap_or_default(),
                image: spec.image.clone(),
                labels: spec.labels.clone(),
            });
            s.create_gate.clone()
        });
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, _handle: &ContainerHandle) -> Result<()> {
        if self.with(|s| s.fail_starts) {
            return Err(SandboxError::ContainerFault("start refused".into()));
        }
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> Result<()> {
        self.with(|s| {
            if s.fail_stops {
                return Err(SandboxError::ContainerFault("stop refused".into()));
            }
            s.stopped.push(handle.id.clone());
            s.log.push(format!("stop {}", handle.id));
            // Session containers are auto-removed once stopped.
            s.listed.retain(|c| c.id != handle.id);
            Ok(())
        })
    }

    async fn exec_foreground(
        &self,
        handle: &ContainerHandle,
        command: &str,
        timeout: Duration,
        on_output: OutputSink<'_>,
    ) -> Result<ExecOutput> {
        let script = self.with(|s| {
            s.exec_commands.push(command.to_string());
            s.running_execs += 1;
            s.max_running_execs = s.max_running_execs.max(s.running_execs);
            s.script.clone()
        });
        let result = self.play(handle, &script, timeout, on_output).await;
        self.with(|s| s.running_execs -= 1);
        result
    }

    async fn write_file(&self, _handle: &ContainerHandle, path: &str, contents: &[u8]) -> Result<()> {
        let contents = String::from_utf8_lossy(contents).into_owned();
        self.with(|s| s.written.push((path.to_string(), contents)));
        Ok(())
    }

    async fn exec_detached(&self, _handle: &ContainerHandle, argv: &[String]) -> Result<()> {
        self.with(|s| s.detached.push(argv.to_vec()));
        Ok(())
    }

    async fn inspect_networks(
        &self,
        _handle: &ContainerHandle,
    ) -> Result<HashMap<String, NetworkAttachment>> {
        Ok(self.with(|s| s.networks.clone()))
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self.with(|s| s.listed.clone()))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.with(|s| {
            if s.failing_removals.contains(id) {
                return Err(SandboxError::ContainerFault(format!("cannot remove {id}")));
            }
            s.removed.push(id.to_string());
            s.listed.retain(|c| c.id != id);
            Ok(())
        })
    }
}

/// Labeled session worker as the engine would list it.
pub fn worker_summary(id: &str, session_id: &str) -> ContainerSummary {
    ContainerSummary {
        id: id.into(),
        name: format!("/{id}"),
        image: "sandbox-python:latest".into(),
        labels: HashMap::from([
            ("type".to_string(), "session_worker".to_string()),
            ("app".to_string(), "code-sandbox".to_string()),
            ("session_id".to_string(), session_id.to_string()),
        ]),
    }
}

/// Notifier that keeps every event.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, SandboxEvent)>>,
}

impl RecordingNotifier {
    pub fn events_for(&self, owner_id: &str) -> Vec<SandboxEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(owner, _)| owner == owner_id)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, owner_id: &str, event: SandboxEvent) {
        self.events
            .lock()
            .unwrap()
            .push((owner_id.to_string(), event));
    }
}

/// Record store that keeps every saved snapshot, optionally failing each write.
#[derive(Default)]
pub struct RecordingStore {
    executions: Mutex<Vec<ExecutionRecord>>,
    debug_sessions: Mutex<Vec<DebugSession>>,
    pub fail: bool,
}

impl RecordingStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.executions.lock().unwrap().clone()
    }

    pub fn debug_sessions(&self) -> Vec<DebugSession> {
        self.debug_sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for RecordingStore {
    async fn save_execution(&self, record: &ExecutionRecord) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("store offline");
        }
        self.executions.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn save_debug_session(&self, _owner_id: &str, session: &DebugSession) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("store offline");
        }
        self.debug_sessions.lock().unwrap().push(session.clone());
        Ok(())
    }
}
