//! Version store: the durable record of every installed updater
//! version and its lifecycle state.
//!
//! At most one entry is `Active` per scope at any time. Promotion is
//! the single linearization point for activity: it happens under the
//! setup lock, and every mutation here takes a [`SetupGuard`] witness
//! so the lock requirement is part of the API.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lock::SetupGuard;
use crate::store::{PersistentStore, StoreError};
use crate::version::Version;

/// Document key for the version table.
const VERSIONS_KEY: &str = "versions";

/// Lifecycle state of an installed updater version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    /// Freshly installed, not yet proven safe to activate.
    Candidate,
    /// Currently running its qualification self-test.
    Qualifying,
    /// The one version responsible for all update operations.
    Active,
    /// Superseded or failed; on-disk cleanup pending.
    Uninstalling,
}

/// One installed updater version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// The installed version.
    pub version: Version,
    /// Lifecycle state.
    pub state: VersionState,
    /// Filesystem location of this version's install (opaque).
    pub install_path: String,
}

/// Errors from version store operations.
#[derive(Debug, Error)]
pub enum VersionStoreError {
    /// Persistent store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Promotion refused: a strictly newer version is already active.
    #[error("version {candidate} superseded by active {active}")]
    Superseded {
        /// The version that attempted promotion.
        candidate: Version,
        /// The newer version already active.
        active: Version,
    },

    /// The named version is not in the store.
    #[error("unknown version {0}")]
    UnknownVersion(Version),
}

/// Durable, lock-guarded record of installed updater versions.
pub struct VersionStore {
    store: Arc<dyn PersistentStore>,
}

impl VersionStore {
    /// Create a version store over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    fn load(&self) -> Result<Vec<VersionEntry>, VersionStoreError> {
        Ok(self
            .store
            .load_doc::<Vec<VersionEntry>>(VERSIONS_KEY)?
            .unwrap_or_default())
    }

    fn save(&self, entries: &Vec<VersionEntry>) -> Result<(), VersionStoreError> {
        self.store.save_doc(VERSIONS_KEY, entries)?;
        Ok(())
    }

    /// Snapshot of all entries, ordered by version ascending.
    ///
    /// Snapshot consistency is guaranteed only while the guard is held.
    ///
    /// # Errors
    ///
    /// Returns [`VersionStoreError::Store`] on persistence failure.
    pub fn list(&self, _guard: &SetupGuard) -> Result<Vec<VersionEntry>, VersionStoreError> {
        let mut entries = self.load()?;
        entries.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(entries)
    }

    /// The currently active entry, if any.
    ///
    /// # Errors
    ///
    /// Returns [`VersionStoreError::Store`] on persistence failure.
    pub fn active(
        &self,
        _guard: &SetupGuard,
    ) -> Result<Option<VersionEntry>, VersionStoreError> {
        Ok(self
            .load()?
            .into_iter()
            .find(|e| e.state == VersionState::Active))
    }

    /// Upsert a `Candidate` entry for `version`.
    ///
    /// Used on install/overinstall: an older running instance invoked
    /// by a newer installer records the candidate here and defers all
    /// activation decisions. Re-registering an existing entry updates
    /// its install path but never regresses an `Active` entry.
    ///
    /// # Errors
    ///
    /// Returns [`VersionStoreError::Store`] on persistence failure.
    pub fn register_candidate(
        &self,
        _guard: &SetupGuard,
        version: &Version,
        install_path: &str,
    ) -> Result<(), VersionStoreError> {
        let mut entries = self.load()?;
        if let Some(entry) = entries.iter_mut().find(|e| e.version == *version) {
            entry.install_path = install_path.to_string();
            if entry.state == VersionState::Uninstalling {
                entry.state = VersionState::Candidate;
            }
        } else {
            debug!(%version, "registering candidate version");
            entries.push(VersionEntry {
                version: version.clone(),
                state: VersionState::Candidate,
                install_path: install_path.to_string(),
            });
        }
        self.save(&entries)
    }

    /// Mark `version` as running its qualification cycle.
    ///
    /// # Errors
    ///
    /// Returns [`VersionStoreError::UnknownVersion`] if absent.
    pub fn mark_qualifying(
        &self,
        _guard: &SetupGuard,
        version: &Version,
    ) -> Result<(), VersionStoreError> {
        let mut entries = self.load()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.version == *version)
            .ok_or_else(|| VersionStoreError::UnknownVersion(version.clone()))?;
        entry.state = VersionState::Qualifying;
        self.save(&entries)
    }

    /// Promote `version` to `Active`, demoting the previous active
    /// entry to `Uninstalling`.
    ///
    /// This is the single linearization point preventing two instances
    /// from racing to own activity: it fails with
    /// [`VersionStoreError::Superseded`] if a strictly newer version is
    /// already active. Promoting the already-active version is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`VersionStoreError::Superseded`] or a store error.
    pub fn promote_to_active(
        &self,
        _guard: &SetupGuard,
        version: &Version,
    ) -> Result<(), VersionStoreError> {
        let mut entries = self.load()?;
        if let Some(active) = entries.iter().find(|e| e.state == VersionState::Active) {
            if active.version == *version {
                return Ok(());
            }
            if active.version > *version {
                return Err(VersionStoreError::Superseded {
                    candidate: version.clone(),
                    active: active.version.clone(),
                });
            }
        }
        if !entries.iter().any(|e| e.version == *version) {
            return Err(VersionStoreError::UnknownVersion(version.clone()));
        }
        for entry in &mut entries {
            if entry.state == VersionState::Active {
                debug!(demoted = %entry.version, "demoting previous active version");
                entry.state = VersionState::Uninstalling;
            }
        }
        for entry in &mut entries {
            if entry.version == *version {
                entry.state = VersionState::Active;
            }
        }
        info!(%version, "promoted version to active");
        self.save(&entries)
    }

    /// Transition `version` to `Uninstalling` after a failed
    /// qualification (or a discovered broken install).
    ///
    /// # Errors
    ///
    /// Returns [`VersionStoreError::UnknownVersion`] if absent.
    pub fn mark_candidate_failed(
        &self,
        _guard: &SetupGuard,
        version: &Version,
    ) -> Result<(), VersionStoreError> {
        let mut entries = self.load()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.version == *version)
            .ok_or_else(|| VersionStoreError::UnknownVersion(version.clone()))?;
        warn!(%version, "marking version failed; cleanup pending");
        entry.state = VersionState::Uninstalling;
        self.save(&entries)
    }

    /// Remove `version` from the store after its on-disk cleanup.
    /// Removing an absent version is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`VersionStoreError::Store`] on persistence failure.
    pub fn remove(
        &self,
        _guard: &SetupGuard,
        version: &Version,
    ) -> Result<(), VersionStoreError> {
        let mut entries = self.load()?;
        entries.retain(|e| e.version != *version);
        self.save(&entries)
    }
}
