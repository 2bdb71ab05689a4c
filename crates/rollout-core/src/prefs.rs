//! Per-instance preferences.
//!
//! One explicit record holds the flags that describe this updater
//! instance: how many times the server has started without any managed
//! app registered, whether the EULA has been accepted, whether usage
//! stats may be reported, when the last check ran, which version is
//! active, and whether self-qualification already ran. All mutation
//! goes through transition helpers on [`InstancePrefs`]; callers never
//! edit the record by hand.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock::SetupGuard;
use crate::store::{PersistentStore, StoreError};
use crate::version::Version;

/// Store key for the instance record.
const PREFS_KEY: &str = "prefs";

/// `server_starts` value at or above which an instance with no managed
/// registrations uninstalls itself.
pub const SERVER_STARTS_UNINSTALL_THRESHOLD: u32 = 24;

/// Persisted per-instance state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceState {
    /// Wakes observed while no managed app was registered.
    #[serde(default)]
    pub server_starts: u32,

    /// EULA acceptance. While false, self-update and uninstall pings
    /// are suppressed.
    #[serde(default)]
    pub eula_accepted: bool,

    /// Whether usage stats may be reported.
    #[serde(default)]
    pub usage_stats_enabled: bool,

    /// When the last update-check cycle completed.
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,

    /// The currently active updater version, once one has activated.
    #[serde(default)]
    pub active_version: Option<Version>,

    /// Whether self-qualification has already been attempted for the
    /// current candidate.
    #[serde(default)]
    pub qualified: bool,
}

impl InstanceState {
    /// Whether the self-uninstall threshold has been reached.
    #[must_use]
    pub const fn over_uninstall_threshold(&self) -> bool {
        self.server_starts >= SERVER_STARTS_UNINSTALL_THRESHOLD
    }
}

/// Store-backed access to the instance record.
pub struct InstancePrefs {
    store: Arc<dyn PersistentStore>,
}

impl InstancePrefs {
    /// Open the prefs record in `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    /// Load the current record, defaulting when none is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record exists but cannot be read
    /// or decoded.
    pub fn load(&self) -> Result<InstanceState, StoreError> {
        Ok(self
            .store
            .load_doc::<InstanceState>(PREFS_KEY)?
            .unwrap_or_default())
    }

    fn update<F>(&self, _guard: &SetupGuard, apply: F) -> Result<InstanceState, StoreError>
    where
        F: FnOnce(&mut InstanceState),
    {
        let mut state = self.load()?;
        apply(&mut state);
        self.store.save_doc(PREFS_KEY, &state)?;
        Ok(state)
    }

    /// Count one wake with no managed registrations.
    ///
    /// Saturates rather than wrapping; once over the threshold the
    /// exact count no longer matters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on persistence failure.
    pub fn count_server_start(
        &self,
        guard: &SetupGuard,
    ) -> Result<InstanceState, StoreError> {
        self.update(guard, |state| {
            state.server_starts = state.server_starts.saturating_add(1);
        })
    }

    /// Reset the server-start counter. Called on fresh installs and
    /// whenever a managed app registers, so new instances get a full
    /// grace period.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on persistence failure.
    pub fn reset_server_starts(
        &self,
        guard: &SetupGuard,
    ) -> Result<InstanceState, StoreError> {
        self.update(guard, |state| state.server_starts = 0)
    }

    /// Record EULA acceptance. One-way: acceptance is never revoked
    /// here.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on persistence failure.
    pub fn accept_eula(&self, guard: &SetupGuard) -> Result<InstanceState, StoreError> {
        self.update(guard, |state| state.eula_accepted = true)
    }

    /// Set the usage-stats opt-in.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on persistence failure.
    pub fn set_usage_stats(
        &self,
        guard: &SetupGuard,
        enabled: bool,
    ) -> Result<InstanceState, StoreError> {
        self.update(guard, |state| state.usage_stats_enabled = enabled)
    }

    /// Record the completion time of an update-check cycle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on persistence failure.
    pub fn record_check(
        &self,
        guard: &SetupGuard,
        at: DateTime<Utc>,
    ) -> Result<InstanceState, StoreError> {
        self.update(guard, |state| state.last_checked = Some(at))
    }

    /// Record a version activation. Clears `qualified` so the next
    /// candidate starts from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on persistence failure.
    pub fn record_activation(
        &self,
        guard: &SetupGuard,
        version: &Version,
    ) -> Result<InstanceState, StoreError> {
        self.update(guard, |state| {
            state.active_version = Some(version.clone());
            state.qualified = false;
        })
    }

    /// Mark that qualification ran for the current candidate, whatever
    /// the result. Prevents re-running a failed qualification on every
    /// wake.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on persistence failure.
    pub fn mark_qualified(&self, guard: &SetupGuard) -> Result<InstanceState, StoreError> {
        self.update(guard, |state| state.qualified = true)
    }

    /// Clear the qualification mark. Called when a new candidate is
    /// staged, so an overinstall gets a fresh qualification attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on persistence failure.
    pub fn reset_qualification(
        &self,
        guard: &SetupGuard,
    ) -> Result<InstanceState, StoreError> {
        self.update(guard, |state| state.qualified = false)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lock::{MemorySetupLock, SetupLock};
    use crate::store::MemoryStore;

    fn fixture() -> (InstancePrefs, SetupGuard) {
        let prefs = InstancePrefs::new(Arc::new(MemoryStore::new()));
        let guard = MemorySetupLock::new()
            .acquire(Duration::from_millis(10))
            .unwrap();
        (prefs, guard)
    }

    #[test]
    fn defaults_when_nothing_persisted() {
        let (prefs, _guard) = fixture();
        let state = prefs.load().unwrap();
        assert_eq!(state, InstanceState::default());
        assert!(!state.over_uninstall_threshold());
    }

    #[test]
    fn server_starts_count_and_reset() {
        let (prefs, guard) = fixture();
        for _ in 0..SERVER_STARTS_UNINSTALL_THRESHOLD - 1 {
            prefs.count_server_start(&guard).unwrap();
        }
        assert!(!prefs.load().unwrap().over_uninstall_threshold());
        let state = prefs.count_server_start(&guard).unwrap();
        assert!(state.over_uninstall_threshold());

        let state = prefs.reset_server_starts(&guard).unwrap();
        assert_eq!(state.server_starts, 0);
        assert!(!state.over_uninstall_threshold());
    }

    #[test]
    fn eula_acceptance_persists() {
        let (prefs, guard) = fixture();
        assert!(!prefs.load().unwrap().eula_accepted);
        prefs.accept_eula(&guard).unwrap();
        assert!(prefs.load().unwrap().eula_accepted);
    }

    #[test]
    fn activation_clears_qualified() {
        let (prefs, guard) = fixture();
        prefs.mark_qualified(&guard).unwrap();
        assert!(prefs.load().unwrap().qualified);

        let version = Version::parse("1.2.3.4").unwrap();
        let state = prefs.record_activation(&guard, &version).unwrap();
        assert_eq!(state.active_version, Some(version));
        assert!(!state.qualified);
    }

    #[test]
    fn last_checked_round_trips() {
        let (prefs, guard) = fixture();
        let at = Utc::now();
        prefs.record_check(&guard, at).unwrap();
        assert_eq!(prefs.load().unwrap().last_checked, Some(at));
    }
}
