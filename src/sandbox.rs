//! Outward-facing operations, wired together.
//!
//! Every call made on behalf of an owner counts as that owner being
//! connected again: it cancels a pending disconnect termination.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::debug::{DebugCommand, DebugOrchestrator, DebugSession, DebugSnapshot};
use crate::error::{Result, SandboxError};
use crate::events::{EventMailbox, Notifier, RecordStore, SandboxEvent};
use crate::execution::{ExecutionOrchestrator, ExecutionTicket};
use crate::runtime::ContainerRuntime;
use crate::session::{Session, SessionManager, SessionObserver};

/// Sessions, execution and debugging behind one handle.
pub struct Sandbox {
    sessions: Arc<SessionManager>,
    execution: Arc<ExecutionOrchestrator>,
    debug: Arc<DebugOrchestrator>,
    mailbox: Arc<EventMailbox>,
}

impl Sandbox {
    /// Build a sandbox whose events queue in an in-memory mailbox.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: Config,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let mailbox = Arc::new(EventMailbox::default());
        let notifier: Arc<dyn Notifier> = mailbox.clone();
        let sessions = Arc::new(SessionManager::new(
            runtime,
            Arc::clone(&notifier),
            Arc::new(config),
        ));
        let execution = Arc::new(ExecutionOrchestrator::new(
            Arc::clone(&sessions),
            Arc::clone(&notifier),
            Arc::clone(&store),
        ));
        let debug = Arc::new(DebugOrchestrator::new(
            Arc::clone(&sessions),
            notifier,
            store,
        ));
        let observer: Arc<dyn SessionObserver> = debug.clone();
        sessions.add_observer(Arc::downgrade(&observer));
        Self {
            sessions,
            execution,
            debug,
            mailbox,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    fn touch(&self, owner_id: &str) {
        if self.sessions.cancel_termination(owner_id) {
            info!(owner = %owner_id, "Owner reconnected, keeping session");
        }
    }

    pub async fn create_session(&self, owner_id: &str, language: &str) -> Result<Session> {
        self.touch(owner_id);
        self.sessions.create_session(owner_id, language).await
    }

    /// Stop one of the owner's sessions. An attached debugger goes with it.
    pub async fn stop_session(&self, owner_id: &str, session_id: &str) -> Result<()> {
        self.touch(owner_id);
        let session = self.sessions.get_session(session_id).await?;
        if session.owner_id != owner_id {
            return Err(SandboxError::SessionNotFound(session_id.to_string()));
        }
        self.sessions.stop_session(session_id).await;
        Ok(())
    }

    /// Execute in a given session, or in the owner's session for `language`.
    pub async fn execute(
        &self,
        owner_id: &str,
        session_id: Option<&str>,
        code: &str,
        language: &str,
    ) -> Result<ExecutionTicket> {
        self.touch(owner_id);
        match session_id {
            Some(session_id) => {
                let session = self.sessions.get_session(session_id).await?;
                if session.owner_id != owner_id {
                    return Err(SandboxError::SessionNotFound(session_id.to_string()));
                }
                self.execution.execute(session_id, code, language).await
            }
            None => self.execution.execute_for_owner(owner_id, code, language).await,
        }
    }

    pub async fn start_debug(
        &self,
        owner_id: &str,
        code: &str,
        language: &str,
        breakpoints: &[u32],
    ) -> Result<DebugSession> {
        self.touch(owner_id);
        self.debug
            .start_debug(owner_id, code, language, breakpoints)
            .await
    }

    pub async fn send_debug_command(
        &self,
        owner_id: &str,
        session_id: &str,
        command: DebugCommand,
    ) -> Result<Option<String>> {
        self.touch(owner_id);
        self.debug.send_command(owner_id, session_id, command).await
    }

    pub async fn stop_debug(&self, owner_id: &str, session_id: &str) -> Result<()> {
        self.touch(owner_id);
        self.debug.stop_debug(owner_id, session_id).await
    }

    pub async fn get_debug_session(&self, owner_id: &str, session_id: &str) -> Result<DebugSnapshot> {
        self.touch(owner_id);
        self.debug.get_debug_session(owner_id, session_id).await
    }

    pub fn debuggable_languages(&self) -> Vec<&'static str> {
        DebugOrchestrator::debuggable_languages()
    }

    /// Events queued for the owner since the last poll.
    pub fn poll_events(&self, owner_id: &str) -> Vec<SandboxEvent> {
        self.touch(owner_id);
        self.mailbox.drain(owner_id)
    }

    /// The owner's transport went away. Their session survives the grace period.
    pub fn disconnect(&self, owner_id: &str) {
        info!(owner = %owner_id, "Owner disconnected");
        self.sessions.schedule_termination(owner_id);
    }

    pub async fn prune_orphans(&self) -> Result<Vec<String>> {
        self.sessions.prune_orphans().await
    }

    pub fn start_reaper(&self) -> tokio::task::JoinHandle<()> {
        self.sessions.start_reaper()
    }

    /// Close every debugger and stop every session.
    pub async fn shutdown(&self) {
        self.debug.stop_all().await;
        self.sessions.destroy_all().await;
    }
}
