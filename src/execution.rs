//! Execution orchestrator.
//!
//! Writes code into the session's workspace, runs it through the runtime
//! with a hard wall-clock timeout, and streams every output chunk to the
//! owner as it arrives. The caller gets an execution id immediately; the
//! terminal state arrives through the notifier (and the returned ticket).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::events::{persist_execution, Notifier, RecordStore, SandboxEvent};
use crate::language::{self, LanguageSpec};
use crate::runtime::StreamKind;
use crate::session::{Session, SessionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One execution, as persisted and reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub session_id: String,
    pub owner_id: String,
    pub language: String,
    pub code: String,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    /// Set once the program exited on its own.
    pub exit_code: Option<i64>,
    /// Infrastructure failure message (timeout, engine error).
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Handle to an execution running in the background.
#[derive(Debug)]
pub struct ExecutionTicket {
    pub execution_id: String,
    pub session_id: String,
    handle: JoinHandle<ExecutionRecord>,
}

impl ExecutionTicket {
    /// Wait for the terminal record.
    pub async fn wait(self) -> Result<ExecutionRecord> {
        self.handle.await.map_err(|e| {
            SandboxError::ContainerFault(format!("Execution task {} failed: {e}", self.execution_id))
        })
    }
}

/// Runs code inside session containers.
pub struct ExecutionOrchestrator {
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn RecordStore>,
    timeout: Duration,
    max_code_size: usize,
}

impl ExecutionOrchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let settings = &sessions.settings().execution;
        let timeout = Duration::from_millis(settings.timeout_ms);
        let max_code_size = settings.max_code_size_bytes;
        Self {
            sessions,
            notifier,
            store,
            timeout,
            max_code_size,
        }
    }

    fn validate(&self, code: &str, language: &str) -> Result<&'static LanguageSpec> {
        let spec = language::resolve(language)?;
        if code.len() > self.max_code_size {
            return Err(SandboxError::CodeTooLarge {
                size: code.len(),
                limit: self.max_code_size,
            });
        }
        Ok(spec)
    }

    /// Start running `code` in an existing session.
    ///
    /// Fails fast (before touching the container) on unknown languages,
    /// oversized code, or an inactive session.
    pub async fn execute(
        self: &Arc<Self>,
        session_id: &str,
        code: &str,
        language: &str,
    ) -> Result<ExecutionTicket> {
        let spec = self.validate(code, language)?;
        let session = self.sessions.get_session(session_id).await?;
        Ok(self.launch(session, spec, code).await)
    }

    /// Get-or-create the owner's session for `language`, then execute in it.
    pub async fn execute_for_owner(
        self: &Arc<Self>,
        owner_id: &str,
        code: &str,
        language: &str,
    ) -> Result<ExecutionTicket> {
        let spec = self.validate(code, language)?;
        let session = self.sessions.create_session(owner_id, language).await?;
        Ok(self.launch(session, spec, code).await)
    }

    async fn launch(
        self: &Arc<Self>,
        session: Session,
        spec: &'static LanguageSpec,
        code: &str,
    ) -> ExecutionTicket {
        let record = ExecutionRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            owner_id: session.owner_id.clone(),
            language: spec.id.to_string(),
            code: code.to_string(),
            status: ExecutionStatus::Pending,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: None,
            duration_ms: 0,
            created_at: Utc::now(),
        };
        persist_execution(self.store.as_ref(), &record).await;
        debug!(execution = %record.id, session = %session.id, language = %spec.id, "Execution queued");

        let execution_id = record.id.clone();
        let session_id = session.id.clone();
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move { orchestrator.run(record, session, spec).await });

        ExecutionTicket {
            execution_id,
            session_id,
            handle,
        }
    }

    async fn run(
        &self,
        mut record: ExecutionRecord,
        session: Session,
        spec: &'static LanguageSpec,
    ) -> ExecutionRecord {
        // One foreground command per container at a time; later requests queue here.
        let lock = self.sessions.execute_lock(&session.id).await;
        let _guard = lock.lock().await;

        record.status = ExecutionStatus::Running;
        self.notifier.notify(
            &record.owner_id,
            SandboxEvent::ExecutionStatus {
                execution_id: record.id.clone(),
                status: ExecutionStatus::Running,
                message: format!("Running {} code", spec.id),
            },
        );
        persist_execution(self.store.as_ref(), &record).await;

        let dir = self.sessions.workspace_dir(&session.id);
        let source = language::source_path(spec, &dir);
        let command = language::run_command(spec, &dir);

        let owner_id = record.owner_id.clone();
        let execution_id = record.id.clone();
        let notifier = Arc::clone(&self.notifier);
        let forward = move |stream: StreamKind, data: &str| {
            notifier.notify(
                &owner_id,
                SandboxEvent::ExecutionOutput {
                    execution_id: execution_id.clone(),
                    stream,
                    data: data.to_string(),
                },
            );
        };

        let runtime = self.sessions.runtime();
        let started = Instant::now();
        let result = async {
            runtime
                .write_file(&session.container, &source, record.code.as_bytes())
                .await?;
            runtime
                .exec_foreground(&session.container, &command, self.timeout, &forward)
                .await
        }
        .await;
        record.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(output) => {
                info!(
                    execution = %record.id,
                    exit_code = output.exit_code,
                    duration_ms = record.duration_ms,
                    "Execution completed"
                );
                record.status = ExecutionStatus::Completed;
                record.exit_code = Some(output.exit_code);
                record.stdout = output.stdout;
                record.stderr = output.stderr;
                self.notifier.notify(
                    &record.owner_id,
                    SandboxEvent::ExecutionComplete {
                        execution_id: record.id.clone(),
                        stdout: record.stdout.clone(),
                        stderr: record.stderr.clone(),
                        exit_code: output.exit_code,
                        duration_ms: record.duration_ms,
                    },
                );
            }
            Err(e) => {
                warn!(execution = %record.id, error = %e, "Execution failed");
                record.status = ExecutionStatus::Failed;
                record.error = Some(e.to_string());
                self.notifier.notify(
                    &record.owner_id,
                    SandboxEvent::ExecutionError {
                        execution_id: record.id.clone(),
                        error: e.to_string(),
                    },
                );
                if matches!(e, SandboxError::ExecutionTimeout { .. }) {
                    // The runtime killed the container, so the session is dead too.
                    self.sessions.stop_session(&session.id).await;
                }
            }
        }

        persist_execution(self.store.as_ref(), &record).await;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::{ExecScript, MockRuntime, RecordingNotifier, RecordingStore};

    struct Harness {
        orchestrator: Arc<ExecutionOrchestrator>,
        sessions: Arc<SessionManager>,
        runtime: Arc<MockRuntime>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<RecordingStore>,
    }

    fn harness_with(config: Config, store: RecordingStore) -> Harness {
        let runtime = Arc::new(MockRuntime::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(store);
        let sessions = Arc::new(SessionManager::new(
            runtime.clone(),
            notifier.clone(),
            Arc::new(config),
        ));
        let orchestrator = Arc::new(ExecutionOrchestrator::new(
            Arc::clone(&sessions),
            notifier.clone(),
            store.clone(),
        ));
        Harness {
            orchestrator,
            sessions,
            runtime,
            notifier,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default(), RecordingStore::default())
    }

    #[tokio::test]
    async fn python_print_streams_and_completes() {
        let h = harness();
        h.runtime.script(ExecScript::stdout("ok\n"));

        let ticket = h
            .orchestrator
            .execute_for_owner("alice", "print('ok')", "python")
            .await
            .unwrap();
        let record = ticket.wait().await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.stdout, "ok\n");

        let events = h.notifier.events_for("alice");
        assert!(matches!(
            &events[0],
            SandboxEvent::ExecutionStatus { status: ExecutionStatus::Running, .. }
        ));
        assert_eq!(
            events[1],
            SandboxEvent::ExecutionOutput {
                execution_id: record.id.clone(),
                stream: StreamKind::Stdout,
                data: "ok\n".into(),
            }
        );
        assert!(matches!(
            &events[2],
            SandboxEvent::ExecutionComplete { exit_code: 0, stdout, .. } if stdout == "ok\n"
        ));

        let path = format!("/sessions/{}/code.py", record.session_id);
        assert_eq!(h.runtime.written(), vec![(path.clone(), "print('ok')".to_string())]);
        assert_eq!(h.runtime.exec_commands(), vec![format!("python3 -u {path}")]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_still_completed() {
        let h = harness();
        h.runtime.script(ExecScript {
            chunks: vec![(StreamKind::Stderr, "boom\n".into())],
            exit_code: 1,
            ..ExecScript::default()
        });

        let record = h
            .orchestrator
            .execute_for_owner("alice", "raise SystemExit(1)", "python")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.exit_code, Some(1));
        assert_eq!(record.stderr, "boom\n");
        assert!(record.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_and_stops_the_container() {
        let mut config = Config::default();
        config.execution.timeout_ms = 50;
        let h = harness_with(config, RecordingStore::default());
        h.runtime.script(ExecScript {
            delay: Duration::from_secs(10),
            ..ExecScript::default()
        });

        let session = h.sessions.create_session("alice", "python").await.unwrap();
        let record = h
            .orchestrator
            .execute(&session.id, "while True: pass", "python")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("timed out"));
        assert!(record.exit_code.is_none());
        assert!(h.runtime.stopped().contains(&session.container.id));
        assert!(matches!(
            h.sessions.get_session(&session.id).await,
            Err(SandboxError::SessionNotFound(_))
        ));
        assert!(h
            .notifier
            .events_for("alice")
            .iter()
            .any(|e| matches!(e, SandboxEvent::ExecutionError { error, .. } if error.contains("timed out"))));
    }

    #[tokio::test]
    async fn bad_input_fails_before_any_container_work() {
        let mut config = Config::default();
        config.execution.max_code_size_bytes = 8;
        let h = harness_with(config, RecordingStore::default());

        let err = h
            .orchestrator
            .execute_for_owner("alice", "x", "cobol")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));

        let err = h
            .orchestrator
            .execute_for_owner("alice", "print('too long')", "python")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { limit: 8, .. }));

        assert!(h.runtime.created().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let h = harness();
        let err = h
            .orchestrator
            .execute("missing", "print(1)", "python")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn persistence_failures_do_not_abort() {
        let h = harness_with(Config::default(), RecordingStore::failing());
        h.runtime.script(ExecScript::stdout("ok\n"));

        let record = h
            .orchestrator
            .execute_for_owner("alice", "print('ok')", "python")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn every_phase_is_persisted() {
        let h = harness();
        let record = h
            .orchestrator
            .execute_for_owner("alice", "pass", "python")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let statuses: Vec<_> = h
            .store
            .executions()
            .iter()
            .filter(|r| r.id == record.id)
            .map(|r| r.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn large_sources_are_uploaded_not_passed_to_the_shell() {
        let h = harness();
        let code = "x = 1\n".repeat(40_000);

        let record = h
            .orchestrator
            .execute_for_owner("alice", &code, "python")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(h.runtime.written()[0].1.len(), code.len());
        assert!(h.runtime.exec_commands().iter().all(|c| c.len() < 256));
    }

    #[tokio::test]
    async fn executions_in_one_session_never_overlap() {
        let h = harness();
        h.runtime.script(ExecScript {
            delay: Duration::from_millis(30),
            ..ExecScript::stdout("x")
        });

        let first = h
            .orchestrator
            .execute_for_owner("alice", "1", "python")
            .await
            .unwrap();
        let second = h
            .orchestrator
            .execute_for_owner("alice", "2", "python")
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert!(a.unwrap().status.is_terminal());
        assert!(b.unwrap().status.is_terminal());
        assert_eq!(h.runtime.max_concurrent_execs(), 1);
        assert_eq!(h.runtime.created().len(), 1);
    }
}
