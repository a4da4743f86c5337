//! Session management for persistent sandbox containers.
//!
//! Each owner has at most one active session. A session is bound to one
//! language; asking for a different language stops the old container before
//! a new one is provisioned. Containers run an idle command so they stay up
//! between requests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, SessionSettings};
use crate::error::{Result, SandboxError};
use crate::events::{Notifier, SandboxEvent};
use crate::language::{self, LanguageSpec};
use crate::runtime::orphans::{prune_orphans, OrphanPolicy};
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, Mount, ResourceLimits, LABEL_APP,
    LABEL_SESSION, LABEL_TYPE, SESSION_WORKER,
};

/// Parsed session configuration with `Duration` fields.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session can be idle before the reaper cleans it up.
    pub idle_timeout: Duration,

    /// Maximum total lifetime of a session, regardless of activity.
    pub max_lifetime: Duration,

    /// Delay between an owner disconnecting and its session being stopped.
    pub disconnect_grace: Duration,

    /// Interval between reaper sweeps.
    pub reaper_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

impl SessionConfig {
    /// Create from the deserialized configuration values.
    pub const fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            idle_timeout: Duration::from_secs(settings.idle_timeout_seconds),
            max_lifetime: Duration::from_secs(settings.max_lifetime_seconds),
            disconnect_grace: Duration::from_secs(settings.disconnect_grace_seconds),
            reaper_interval: Duration::from_secs(settings.reaper_interval_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
}

/// A persistent sandbox session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub container: ContainerHandle,
    /// Canonical language identifier the container was provisioned for.
    pub language: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).to_std().unwrap_or_default()
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct SessionIndex {
    sessions: HashMap<String, Session>,
    by_owner: HashMap<String, String>,
    /// Ids whose container is being created. Counted as live by the orphan sweep.
    provisioning: HashSet<String>,
}

impl SessionIndex {
    fn remove(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        if self.by_owner.get(&session.owner_id).map(String::as_str) == Some(session_id) {
            self.by_owner.remove(&session.owner_id);
        }
        Some(session)
    }
}

/// Told about every session whose container was stopped, whatever the cause.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn session_ended(&self, session_id: &str);
}

#[derive(Debug)]
struct PendingTermination {
    generation: u64,
    task: AbortHandle,
}

/// Manages the lifecycle of per-owner sandbox sessions.
///
/// Creation is serialized per owner so two concurrent requests can never
/// provision two containers. Per-session execute locks serialize foreground
/// commands against one container; different sessions run in parallel.
pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntime>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<Config>,
    config: SessionConfig,
    index: RwLock<SessionIndex>,
    owner_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    execute_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    pending_terminations: std::sync::Mutex<HashMap<String, PendingTermination>>,
    termination_generation: std::sync::atomic::AtomicU64,
    observers: std::sync::RwLock<Vec<Weak<dyn SessionObserver>>>,
}

impl SessionManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        notifier: Arc<dyn Notifier>,
        settings: Arc<Config>,
    ) -> Self {
        let config = SessionConfig::from_settings(&settings.session);
        Self {
            runtime,
            notifier,
            settings,
            config,
            index: RwLock::new(SessionIndex::default()),
            owner_locks: Mutex::new(HashMap::new()),
            execute_locks: RwLock::new(HashMap::new()),
            pending_terminations: std::sync::Mutex::new(HashMap::new()),
            termination_generation: std::sync::atomic::AtomicU64::new(0),
            observers: std::sync::RwLock::new(Vec::new()),
        }
    }

    /// Register for session teardown. Dropped observers are skipped.
    pub fn add_observer(&self, observer: Weak<dyn SessionObserver>) {
        self.observers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(observer);
    }

    fn live_observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        observers.retain(|observer| observer.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn settings(&self) -> &Config {
        &self.settings
    }

    /// Directory inside the container reserved for a session.
    pub fn workspace_dir(&self, session_id: &str) -> String {
        format!(
            "{}/{session_id}",
            self.settings.docker.sessions_mount.trim_end_matches('/')
        )
    }

    async fn owner_lock(&self, owner_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.owner_locks.lock().await;
        Arc::clone(
            locks
                .entry(owner_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Get or create the per-session execute lock.
    pub(crate) async fn execute_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        // Fast path: read lock
        {
            let locks = self.execute_locks.read().await;
            if let Some(lock) = locks.get(session_id) {
                return Arc::clone(lock);
            }
        }
        // Slow path: create
        let mut locks = self.execute_locks.write().await;
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Return the owner's session for `language`, creating it if needed.
    ///
    /// An active session with the same language is reused (only its activity
    /// timestamp changes). One with a different language is stopped first.
    pub async fn create_session(&self, owner_id: &str, language: &str) -> Result<Session> {
        let spec = language::resolve(language)?;

        let owner_lock = self.owner_lock(owner_id).await;
        let result = {
            let _guard = owner_lock.lock().await;
            self.create_locked(owner_id, spec).await
        };
        drop(owner_lock);
        if result.is_err() {
            self.release_owner_lock(owner_id).await;
        }
        result
    }

    /// Forget the owner's creation lock unless someone holds or awaits it.
    async fn release_owner_lock(&self, owner_id: &str) {
        let mut locks = self.owner_locks.lock().await;
        if locks
            .get(owner_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(owner_id);
        }
    }

    async fn create_locked(&self, owner_id: &str, spec: &'static LanguageSpec) -> Result<Session> {
        let replaced = {
            let mut index = self.index.write().await;
            let existing = index.by_owner.get(owner_id).cloned();
            match existing {
                Some(session_id) => match index.sessions.get_mut(&session_id) {
                    Some(session) if session.status == SessionStatus::Active => {
                        if session.language == spec.id {
                            session.last_activity_at = Utc::now();
                            debug!(session = %session_id, owner = %owner_id, "Reusing session");
                            return Ok(session.clone());
                        }
                        Some(session_id)
                    }
                    _ => {
                        index.by_owner.remove(owner_id);
                        None
                    }
                },
                None => None,
            }
        };

        if let Some(old) = replaced {
            info!(session = %old, owner = %owner_id, language = %spec.id, "Switching language, stopping previous session");
            self.stop_session(&old).await;
        }

        let session_id = Uuid::new_v4().to_string();
        self.index
            .write()
            .await
            .provisioning
            .insert(session_id.clone());

        info!(session = %session_id, owner = %owner_id, language = %spec.id, "Creating session");
        let provisioned = self.provision(&session_id, spec).await;

        let mut index = self.index.write().await;
        index.provisioning.remove(&session_id);
        let container = provisioned?;

        let now = Utc::now();
        let session = Session {
            id: session_id.clone(),
            owner_id: owner_id.to_string(),
            container,
            language: spec.id.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity_at: now,
        };
        index.sessions.insert(session_id.clone(), session.clone());
        index.by_owner.insert(owner_id.to_string(), session_id.clone());

        info!(session = %session_id, container = %session.container.short_id(), "Session started");
        Ok(session)
    }

    async fn provision(&self, session_id: &str, spec: &LanguageSpec) -> Result<ContainerHandle> {
        let docker = &self.settings.docker;
        let workspace = self.workspace_dir(session_id);

        let labels = HashMap::from([
            (LABEL_APP.to_string(), docker.app_label.clone()),
            (LABEL_TYPE.to_string(), SESSION_WORKER.to_string()),
            (LABEL_SESSION.to_string(), session_id.to_string()),
        ]);

        let container_spec = ContainerSpec {
            name: Some(format!("{}-session-{session_id}", docker.app_label)),
            image: self.settings.image_for(spec.id, spec.image).to_string(),
            command: vec![
                "sh".into(),
                "-c".into(),
                format!("mkdir -p {workspace} && sleep infinity"),
            ],
            env: vec!["PYTHONUNBUFFERED=1".into()],
            working_dir: Some(workspace),
            limits: ResourceLimits {
                memory_mb: docker.memory_mb,
                cpu_cores: docker.cpu_cores,
            },
            mounts: vec![Mount {
                source: docker.sessions_volume.clone(),
                target: docker.sessions_mount.clone(),
            }],
            network: Some(docker.network.clone()),
            labels,
        };

        let handle = self.runtime.create_container(&container_spec).await?;
        if let Err(e) = self.runtime.start(&handle).await {
            warn!(container = %handle.short_id(), error = %e, "Failed to start session container, removing it");
            if let Err(remove_err) = self.runtime.remove_container(&handle.id).await {
                warn!(container = %handle.short_id(), error = %remove_err, "Failed to remove unstarted container");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Refresh a session's activity timestamp. Returns whether it is active.
    pub async fn touch(&self, session_id: &str) -> bool {
        self.get_session(session_id).await.is_ok()
    }

    /// Look up an active session and refresh its activity timestamp.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let mut index = self.index.write().await;
        match index.sessions.get_mut(session_id) {
            Some(session) if session.status == SessionStatus::Active => {
                session.last_activity_at = Utc::now();
                Ok(session.clone())
            }
            _ => Err(SandboxError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Container handle of an active session.
    pub async fn get_container_handle(&self, session_id: &str) -> Result<ContainerHandle> {
        Ok(self.get_session(session_id).await?.container)
    }

    /// Remember the container's sandbox-network IP.
    pub async fn cache_network_ip(&self, session_id: &str, ip: &str) {
        if let Some(session) = self.index.write().await.sessions.get_mut(session_id) {
            session.container.network_ip = Some(ip.to_string());
        }
    }

    /// Stop a session's container and forget the session.
    ///
    /// Container errors are logged, never returned. Returns whether the
    /// session existed.
    pub async fn stop_session(&self, session_id: &str) -> bool {
        let Some(mut session) = self.index.write().await.remove(session_id) else {
            return false;
        };
        session.status = SessionStatus::Inactive;
        self.execute_locks.write().await.remove(session_id);

        info!(session = %session_id, container = %session.container.short_id(), "Stopping session");
        if let Err(e) = self.runtime.stop(&session.container, Duration::ZERO).await {
            warn!(session = %session_id, error = %e, "Error stopping session container");
        }

        for observer in self.live_observers() {
            observer.session_ended(session_id).await;
        }
        self.release_owner_lock(&session.owner_id).await;
        true
    }

    /// Stop whatever session the owner currently holds.
    pub async fn terminate_by_owner(&self, owner_id: &str, reason: &str) -> bool {
        let session_id = self.index.read().await.by_owner.get(owner_id).cloned();
        let Some(session_id) = session_id else {
            return false;
        };
        if !self.stop_session(&session_id).await {
            return false;
        }
        self.notifier.notify(
            owner_id,
            SandboxEvent::SessionTerminated {
                session_id,
                reason: reason.to_string(),
            },
        );
        true
    }

    /// Tear the owner's session down after the disconnect grace period,
    /// unless [`cancel_termination`](Self::cancel_termination) runs first.
    pub fn schedule_termination(self: &Arc<Self>, owner_id: &str) {
        let generation = self
            .termination_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let manager = Arc::clone(self);
        let owner = owner_id.to_string();
        let grace = self.config.disconnect_grace;

        let mut pending = self
            .pending_terminations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_pending = {
                let mut pending = manager
                    .pending_terminations
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                match pending.get(&owner) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&owner);
                        true
                    }
                    _ => false,
                }
            };
            if still_pending {
                info!(owner = %owner, "Disconnect grace period elapsed, terminating session");
                manager.terminate_by_owner(&owner, "disconnected").await;
                manager.notifier.forget(&owner);
            }
        });

        // Registered before the task can observe the map.
        let previous = pending.insert(
            owner_id.to_string(),
            PendingTermination {
                generation,
                task: task.abort_handle(),
            },
        );
        drop(pending);
        if let Some(previous) = previous {
            previous.task.abort();
        }
        debug!(owner = %owner_id, grace = ?grace, "Scheduled session termination");
    }

    /// Cancel a pending disconnect termination. Returns whether one was pending.
    pub fn cancel_termination(&self, owner_id: &str) -> bool {
        let pending = self
            .pending_terminations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(owner_id);
        pending.is_some_and(|entry| {
            entry.task.abort();
            debug!(owner = %owner_id, "Cancelled pending session termination");
            true
        })
    }

    /// Ids the orphan sweep must never reap: active and still-provisioning sessions.
    pub async fn live_session_ids(&self) -> HashSet<String> {
        let index = self.index.read().await;
        index
            .sessions
            .keys()
            .chain(index.provisioning.iter())
            .cloned()
            .collect()
    }

    pub async fn active_sessions(&self) -> Vec<Session> {
        self.index.read().await.sessions.values().cloned().collect()
    }

    /// Remove containers that no live session claims.
    pub async fn prune_orphans(&self) -> Result<Vec<String>> {
        let policy = OrphanPolicy {
            app_label: &self.settings.docker.app_label,
            runtime_images: &self.settings.orphan_images,
        };
        prune_orphans(self.runtime.as_ref(), policy, self.live_session_ids()).await
    }

    /// Clean up expired sessions (called by the reaper task).
    pub async fn cleanup_expired(&self) {
        let now = Utc::now();
        let expired: Vec<(String, String, &'static str)> = {
            let index = self.index.read().await;
            index
                .sessions
                .values()
                .filter_map(|session| {
                    let reason = if session.age(now) > self.config.max_lifetime {
                        "max lifetime"
                    } else if session.idle_for(now) > self.config.idle_timeout {
                        "idle timeout"
                    } else {
                        return None;
                    };
                    Some((session.id.clone(), session.owner_id.clone(), reason))
                })
                .collect()
        };

        for (session_id, owner_id, reason) in expired {
            debug!(session = %session_id, reason, "Session expired");
            if self.stop_session(&session_id).await {
                self.notifier.notify(
                    &owner_id,
                    SandboxEvent::SessionTerminated {
                        session_id,
                        reason: reason.to_string(),
                    },
                );
            }
        }
    }

    /// Destroy all sessions (called on shutdown).
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = self.index.read().await.sessions.keys().cloned().collect();
        for id in &ids {
            info!(session = %id, "Destroying session");
            self.stop_session(id).await;
        }

        let mut pending = self
            .pending_terminations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, entry) in pending.drain() {
            entry.task.abort();
        }
    }

    /// Start the background reaper task.
    ///
    /// Returns a `JoinHandle` that runs until cancelled. The reaper
    /// checks for expired sessions every `reaper_interval`.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.reaper_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                debug!("Reaper sweep");
                manager.cleanup_expired().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockRuntime, RecordingNotifier};

    fn manager_with(config: Config) -> (Arc<SessionManager>, Arc<MockRuntime>, Arc<RecordingNotifier>) {
        let runtime = Arc::new(MockRuntime::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = Arc::new(SessionManager::new(
            runtime.clone(),
            notifier.clone(),
            Arc::new(config),
        ));
        (manager, runtime, notifier)
    }

    fn manager() -> (Arc<SessionManager>, Arc<MockRuntime>, Arc<RecordingNotifier>) {
        manager_with(Config::default())
    }

    #[tokio::test]
    async fn same_owner_same_language_reuses_one_container() {
        let (manager, runtime, _) = manager();

        let first = manager.create_session("alice", "python").await.unwrap();
        let second = manager.create_session("alice", "python").await.unwrap();
        let third = manager.create_session("alice", "py").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.id, third.id);
        assert_eq!(runtime.created().len(), 1);
        assert!(second.last_activity_at >= first.last_activity_at);
    }

    #[tokio::test]
    async fn concurrent_creation_for_one_owner_provisions_once() {
        let (manager, runtime, _) = manager();

        let (a, b) = tokio::join!(
            manager.create_session("alice", "python"),
            manager.create_session("alice", "python"),
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(runtime.created().len(), 1);
    }

    #[tokio::test]
    async fn language_switch_stops_previous_container_first() {
        let (manager, runtime, _) = manager();

        let python = manager.create_session("alice", "python").await.unwrap();
        let go = manager.create_session("alice", "go").await.unwrap();

        assert_ne!(python.id, go.id);
        assert_eq!(runtime.stopped(), vec![python.container.id.clone()]);
        assert!(matches!(
            manager.get_container_handle(&python.id).await,
            Err(SandboxError::SessionNotFound(_))
        ));
        assert_eq!(manager.get_container_handle(&go.id).await.unwrap(), go.container);
        // The stop happened before the replacement container was created.
        let log = runtime.log();
        let stop_at = log.iter().position(|e| e == &format!("stop {}", python.container.id)).unwrap();
        let create_at = log.iter().position(|e| e == &format!("create {}", go.container.id)).unwrap();
        assert!(stop_at < create_at);
    }

    #[tokio::test]
    async fn container_is_shaped_for_the_session() {
        let (manager, runtime, _) = manager();
        let session = manager.create_session("alice", "python3.12").await.unwrap();

        let spec = runtime.created().pop().unwrap();
        assert_eq!(spec.image, "python:3.12-alpine");
        assert_eq!(spec.working_dir.as_deref(), Some(format!("/sessions/{}", session.id).as_str()));
        assert_eq!(spec.mounts[0].source, "sandbox_sessions");
        assert_eq!(spec.mounts[0].target, "/sessions");
        assert_eq!(spec.network.as_deref(), Some("bridge"));
        assert_eq!(spec.labels.get("type").map(String::as_str), Some("session_worker"));
        assert_eq!(spec.labels.get("session_id"), Some(&session.id));
        assert!(spec.command[2].ends_with("sleep infinity"));
    }

    #[tokio::test]
    async fn unsupported_language_creates_nothing() {
        let (manager, runtime, _) = manager();
        let err = manager.create_session("alice", "cobol").await.unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
        assert!(runtime.created().is_empty());
    }

    #[tokio::test]
    async fn stop_session_forgets_both_indices_and_tolerates_stop_errors() {
        let (manager, runtime, _) = manager();
        let session = manager.create_session("alice", "python").await.unwrap();
        runtime.fail_stops(true);

        assert!(manager.stop_session(&session.id).await);
        assert!(!manager.stop_session(&session.id).await);
        assert!(manager.get_session(&session.id).await.is_err());

        runtime.fail_stops(false);
        let next = manager.create_session("alice", "python").await.unwrap();
        assert_ne!(next.id, session.id);
    }

    #[tokio::test]
    async fn failed_start_removes_the_container() {
        let (manager, runtime, _) = manager();
        runtime.fail_starts(true);

        let err = manager.create_session("alice", "python").await.unwrap_err();
        assert!(matches!(err, SandboxError::ContainerFault(_)));
        assert_eq!(runtime.removed().len(), 1);
        assert!(manager.live_session_ids().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_grace_terminates_unless_cancelled() {
        let (manager, runtime, notifier) = manager();
        let alice = manager.create_session("alice", "python").await.unwrap();
        let bob = manager.create_session("bob", "python").await.unwrap();

        manager.schedule_termination("alice");
        manager.schedule_termination("bob");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(manager.cancel_termination("bob"));

        tokio::time::sleep(Duration::from_secs(25)).await;

        assert!(manager.get_session(&alice.id).await.is_err());
        assert!(manager.get_session(&bob.id).await.is_ok());
        assert_eq!(runtime.stopped(), vec![alice.container.id.clone()]);
        assert!(notifier.events_for("alice").iter().any(|e| matches!(
            e,
            SandboxEvent::SessionTerminated { reason, .. } if reason == "disconnected"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_restarts_the_grace_period() {
        let (manager, _, _) = manager();
        let alice = manager.create_session("alice", "python").await.unwrap();

        manager.schedule_termination("alice");
        tokio::time::sleep(Duration::from_secs(20)).await;
        manager.schedule_termination("alice");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(manager.get_session(&alice.id).await.is_ok());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(manager.get_session(&alice.id).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_expired_stops_idle_sessions() {
        let mut config = Config::default();
        config.session.idle_timeout_seconds = 0;
        let (manager, runtime, notifier) = manager_with(config);
        let session = manager.create_session("alice", "python").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.cleanup_expired().await;

        assert!(manager.active_sessions().await.is_empty());
        assert_eq!(runtime.stopped(), vec![session.container.id]);
        assert_eq!(notifier.events_for("alice").len(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_live_sessions_and_reaps_leftovers() {
        let (manager, runtime, _) = manager();
        let live = manager.create_session("alice", "python").await.unwrap();
        runtime.add_listed(crate::testing::worker_summary("leftover", "old-session"));

        let removed = manager.prune_orphans().await.unwrap();

        assert_eq!(removed, vec!["leftover".to_string()]);
        assert!(!runtime.removed().contains(&live.container.id));
    }

    #[tokio::test]
    async fn sweep_during_provisioning_spares_the_new_container() {
        let (manager, runtime, _) = manager();
        let gate = runtime.hold_creates();

        let creating = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.create_session("alice", "python").await }
        });
        while runtime.created().is_empty() {
            tokio::task::yield_now().await;
        }

        let removed = manager.prune_orphans().await.unwrap();
        assert!(removed.is_empty());

        gate.notify_one();
        let session = creating.await.unwrap().unwrap();
        assert!(runtime.removed().is_empty());
        assert!(manager.get_session(&session.id).await.is_ok());
    }

    #[tokio::test]
    async fn owner_locks_do_not_outlive_sessions() {
        let (manager, runtime, _) = manager();

        let python = manager.create_session("alice", "python").await.unwrap();
        manager.create_session("alice", "go").await.unwrap();
        assert_eq!(manager.owner_locks.lock().await.len(), 1);

        manager.terminate_by_owner("alice", "test").await;
        assert!(manager.owner_locks.lock().await.is_empty());
        assert!(!manager.stop_session(&python.id).await);

        runtime.fail_starts(true);
        manager.create_session("bob", "python").await.unwrap_err();
        manager.create_session("carol", "cobol").await.unwrap_err();
        assert!(manager.owner_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn observers_hear_about_every_teardown() {
        struct Ended(std::sync::Mutex<Vec<String>>);

        #[async_trait]
        impl SessionObserver for Ended {
            async fn session_ended(&self, session_id: &str) {
                self.0.lock().unwrap().push(session_id.to_string());
            }
        }

        let mut config = Config::default();
        config.session.idle_timeout_seconds = 0;
        let (manager, _, _) = manager_with(config);
        let ended = Arc::new(Ended(std::sync::Mutex::new(Vec::new())));
        let observer: Arc<dyn SessionObserver> = ended.clone();
        manager.add_observer(Arc::downgrade(&observer));

        let python = manager.create_session("alice", "python").await.unwrap();
        let go = manager.create_session("alice", "go").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.cleanup_expired().await;

        assert_eq!(*ended.0.lock().unwrap(), vec![python.id, go.id]);
    }

    #[tokio::test]
    async fn destroy_all_stops_everything() {
        let (manager, runtime, _) = manager();
        manager.create_session("alice", "python").await.unwrap();
        manager.create_session("bob", "go").await.unwrap();

        manager.destroy_all().await;

        assert!(manager.active_sessions().await.is_empty());
        assert_eq!(runtime.stopped().len(), 2);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.disconnect_grace, Duration::from_secs(30));
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
    }
}
