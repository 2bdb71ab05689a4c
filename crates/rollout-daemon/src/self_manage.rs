//! Self-management of the updater's own installed versions.
//!
//! Activation is spread over two wakes. On the first wake a candidate
//! runs its qualification cycle and, if it passes, is marked
//! qualifying. On the second wake the qualification outcome is
//! observed and the candidate is promoted, with supersession
//! re-checked under the lock immediately before promotion. A newer
//! active instance that is alive is left alone; this instance hands
//! off silently and eventually marks itself for removal.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rollout_core::lock::SetupLock;
use rollout_core::prefs::InstancePrefs;
use rollout_core::version::Version;
use rollout_core::versions::{VersionState, VersionStore, VersionStoreError};
use tracing::{info, warn};

use crate::errors::UpdateError;
use crate::qualification::{Qualification, QualificationEngine};

const SETUP_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Decides whether an installed version's executable is still usable.
pub trait LivenessProbe: Send + Sync {
    /// Whether the install at `install_path` is present and runnable.
    fn alive(&self, install_path: &str) -> bool;
}

/// Filesystem presence probe.
#[derive(Debug, Default)]
pub struct FsLivenessProbe;

impl LivenessProbe for FsLivenessProbe {
    fn alive(&self, install_path: &str) -> bool {
        !install_path.is_empty() && Path::new(install_path).exists()
    }
}

/// What a self-management step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfAction {
    /// Nothing to do.
    None,
    /// Ran qualification; the candidate passed and awaits activation
    /// on the next wake.
    Qualified,
    /// Ran qualification; the candidate failed and was demoted.
    QualificationFailed(String),
    /// Promoted a version to active.
    Activated(Version),
    /// A newer, healthy instance owns activity; this one stands down.
    HandOff(Version),
    /// This instance marked itself for removal.
    MarkedUninstalling,
    /// The active install is broken and no candidate can replace it.
    ReinstallNeeded,
}

/// Drives qualify/activate/hand-off decisions for this instance.
pub struct SelfManagementController {
    versions: VersionStore,
    prefs: InstancePrefs,
    lock: Arc<dyn SetupLock>,
    qualifier: QualificationEngine,
    probe: Arc<dyn LivenessProbe>,
    own_version: Version,
}

impl SelfManagementController {
    /// Controller for the instance running `own_version`.
    #[must_use]
    pub fn new(
        versions: VersionStore,
        prefs: InstancePrefs,
        lock: Arc<dyn SetupLock>,
        qualifier: QualificationEngine,
        probe: Arc<dyn LivenessProbe>,
        own_version: Version,
    ) -> Self {
        Self {
            versions,
            prefs,
            lock,
            qualifier,
            probe,
            own_version,
        }
    }

    /// Run one self-management step. Called at the start of every
    /// wake, before the orchestrator cycle.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError`] on lock or store failure.
    pub async fn step(&self) -> Result<SelfAction, UpdateError> {
        // Decide under the lock; qualification itself runs unlocked.
        let decision = {
            let guard = self.lock.acquire(SETUP_LOCK_TIMEOUT)?;
            let entries = self
                .versions
                .list(&guard)
                .map_err(version_store_err)?;
            let state = self.prefs.load()?;
            let active = entries
                .iter()
                .find(|e| e.state == VersionState::Active)
                .cloned();
            let own = entries
                .iter()
                .find(|e| e.version == self.own_version)
                .cloned();

            // Broken-active recovery: a dead active install fails
            // immediately and the best live candidate takes over.
            if let Some(active_entry) = &active {
                if !self.probe.alive(&active_entry.install_path) {
                    warn!(
                        version = %active_entry.version,
                        path = %active_entry.install_path,
                        "active install is missing or broken"
                    );
                    self.versions
                        .mark_candidate_failed(&guard, &active_entry.version)
                        .map_err(version_store_err)?;
                    let replacement = entries
                        .iter()
                        .rev()
                        .find(|e| {
                            e.version != active_entry.version
                                && matches!(
                                    e.state,
                                    VersionState::Candidate | VersionState::Qualifying
                                )
                                && self.probe.alive(&e.install_path)
                        })
                        .cloned();
                    return match replacement {
                        Some(entry) => {
                            self.versions
                                .promote_to_active(&guard, &entry.version)
                                .map_err(version_store_err)?;
                            self.prefs.record_activation(&guard, &entry.version)?;
                            Ok(SelfAction::Activated(entry.version))
                        },
                        None => Ok(SelfAction::ReinstallNeeded),
                    };
                }
            }

            match (&own, &active) {
                // Already the active version: nothing to manage.
                (Some(own_entry), Some(active_entry))
                    if own_entry.version == active_entry.version =>
                {
                    return Ok(SelfAction::None);
                },
                // Second wake: qualification already passed, activate
                // now. Supersession is re-checked by the promotion
                // itself under this same guard.
                (Some(own_entry), _)
                    if own_entry.state == VersionState::Qualifying
                        && state.qualified =>
                {
                    return match self
                        .versions
                        .promote_to_active(&guard, &self.own_version)
                    {
                        Ok(()) => {
                            self.prefs
                                .record_activation(&guard, &self.own_version)?;
                            info!(version = %self.own_version, "activated after qualification");
                            Ok(SelfAction::Activated(self.own_version.clone()))
                        },
                        Err(VersionStoreError::Superseded { active, .. }) => {
                            self.versions
                                .mark_candidate_failed(&guard, &self.own_version)
                                .map_err(version_store_err)?;
                            info!(
                                version = %self.own_version,
                                active = %active,
                                "superseded at activation"
                            );
                            Ok(SelfAction::QualificationFailed(
                                "superseded".to_string(),
                            ))
                        },
                        Err(err) => Err(version_store_err(err)),
                    };
                },
                // First wake: an unattempted candidate qualifies.
                (Some(own_entry), _)
                    if own_entry.state == VersionState::Candidate
                        && !state.qualified =>
                {
                    Decision::Qualify
                },
                // Someone newer owns (or is taking) activity.
                (_, Some(active_entry))
                    if active_entry.version > self.own_version =>
                {
                    if state.over_uninstall_threshold() && own.is_some() {
                        self.versions
                            .mark_candidate_failed(&guard, &self.own_version)
                            .map_err(version_store_err)?;
                        return Ok(SelfAction::MarkedUninstalling);
                    }
                    return Ok(SelfAction::HandOff(active_entry.version.clone()));
                },
                _ => return Ok(SelfAction::None),
            }
        };

        match decision {
            Decision::Qualify => {
                let verdict = self.qualifier.qualify(&self.own_version).await?;
                let guard = self.lock.acquire(SETUP_LOCK_TIMEOUT)?;
                self.prefs.mark_qualified(&guard)?;
                match verdict {
                    Qualification::Passed => {
                        self.versions
                            .mark_qualifying(&guard, &self.own_version)
                            .map_err(version_store_err)?;
                        Ok(SelfAction::Qualified)
                    },
                    Qualification::Failed(reason) => {
                        self.versions
                            .mark_candidate_failed(&guard, &self.own_version)
                            .map_err(version_store_err)?;
                        warn!(
                            version = %self.own_version,
                            reason = %reason,
                            "qualification failed"
                        );
                        Ok(SelfAction::QualificationFailed(reason))
                    },
                }
            },
        }
    }
}

enum Decision {
    Qualify,
}

fn version_store_err(err: VersionStoreError) -> UpdateError {
    match err {
        VersionStoreError::Store(e) => UpdateError::Store(e),
        other => UpdateError::QualificationFailure(other.to_string()),
    }
}
