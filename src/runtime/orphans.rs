//! Orphan container sweep.
//!
//! A container is an orphan when it carries our session-worker labels but no
//! live session claims it, or (legacy fallback) when it has no orchestration
//! labels at all and runs one of the known runtime images. Labels are the
//! authoritative signal; the image heuristic only matches exact image names.

use std::collections::HashSet;
use std::future::Future;

use tracing::{debug, info, warn};

use super::{ContainerRuntime, ContainerSummary, LABEL_APP, LABEL_SESSION, LABEL_TYPE, SESSION_WORKER};
use crate::error::Result;

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const PORTAINER_LABEL: &str = "io.portainer.server";

/// Why a container was judged orphaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanReason {
    /// Labeled session worker with no live session.
    UnclaimedWorker,
    /// Unlabeled container running a known runtime image.
    LegacyRuntimeImage,
}

/// Inputs that decide whether a container is an orphan.
#[derive(Debug, Clone, Copy)]
pub struct OrphanPolicy<'a> {
    /// `app` label value our session workers carry.
    pub app_label: &'a str,
    /// Images eligible for the legacy fallback.
    pub runtime_images: &'a [String],
}

impl OrphanPolicy<'_> {
    /// Classify one container against the set of live session ids.
    pub fn classify(
        &self,
        container: &ContainerSummary,
        live_sessions: &HashSet<String>,
    ) -> Option<OrphanReason> {
        let labels = &container.labels;

        if labels.get(LABEL_TYPE).map(String::as_str) == Some(SESSION_WORKER) {
            if labels.get(LABEL_APP).map(String::as_str) != Some(self.app_label) {
                return None;
            }
            return match labels.get(LABEL_SESSION) {
                Some(id) if live_sessions.contains(id) => None,
                _ => Some(OrphanReason::UnclaimedWorker),
            };
        }

        let orchestrated = labels.contains_key(COMPOSE_PROJECT_LABEL)
            || labels.contains_key(PORTAINER_LABEL)
            || labels.contains_key(LABEL_TYPE)
            || labels.contains_key(LABEL_APP);
        if orchestrated {
            return None;
        }

        self.runtime_images
            .iter()
            .any(|image| *image == container.image)
            .then_some(OrphanReason::LegacyRuntimeImage)
    }
}

/// Remove every orphan. Returns the ids that were removed.
///
/// `live_sessions` is awaited only after the listing is taken, so a session
/// whose id was registered before its container was created can never be
/// reaped. A failed removal is logged and does not stop the sweep.
pub async fn prune_orphans<F>(
    runtime: &dyn ContainerRuntime,
    policy: OrphanPolicy<'_>,
    live_sessions: F,
) -> Result<Vec<String>>
where
    F: Future<Output = HashSet<String>> + Send,
{
    info!("Scanning for orphan session containers");
    let containers = runtime.list_containers().await?;
    if containers.is_empty() {
        debug!("No containers found");
        return Ok(Vec::new());
    }

    let live = live_sessions.await;
    let orphans: Vec<_> = containers
        .iter()
        .filter_map(|c| policy.classify(c, &live).map(|reason| (c, reason)))
        .collect();

    if orphans.is_empty() {
        info!("No orphan containers found");
        return Ok(Vec::new());
    }

    let removals = orphans.iter().map(|(container, reason)| async move {
        match runtime.remove_container(&container.id).await {
            Ok(()) => {
                info!(container = %container.id, name = %container.name, ?reason, "Reaped orphan container");
                Some(container.id.clone())
            }
            Err(e) => {
                warn!(container = %container.id, error = %e, "Failed to reap orphan container");
                None
            }
        }
    });
    let removed: Vec<String> = futures::future::join_all(removals)
        .await
        .into_iter()
        .flatten()
        .collect();

    info!(removed = removed.len(), found = orphans.len(), "Orphan sweep complete");
    Ok(removed)
}
