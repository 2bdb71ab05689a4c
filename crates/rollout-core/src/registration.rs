//! Product registration table.
//!
//! Durable mapping from app id to registration metadata. App ids are
//! case-insensitive and normalized to lowercase on every operation.
//! Mutations require the setup lock witness; the table is the shared
//! source of truth for every updater instance in a scope.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::lock::SetupGuard;
use crate::store::{PersistentStore, StoreError};
use crate::version::Version;

/// Document key for the registration table.
const REGISTRATIONS_KEY: &str = "registrations";

/// A registered product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// App id (stored lowercased).
    pub app_id: String,

    /// Currently installed product version.
    pub version: Version,

    /// Brand code; merged only if not already set on re-registration.
    #[serde(default)]
    pub brand_code: String,

    /// Path the brand was read from.
    #[serde(default)]
    pub brand_path: String,

    /// Tag / additional-parameters string; follows the latest
    /// registration.
    #[serde(default)]
    pub ap: String,

    /// Path whose presence attests the product is still installed.
    /// Empty means the registration is always considered owned.
    #[serde(default)]
    pub existence_checker_path: String,

    /// Index into the server-side install data handed to this app's
    /// installer; carried on every update-check request for the app.
    #[serde(default)]
    pub install_data_index: Option<String>,

    /// Server-assigned cohort.
    #[serde(default)]
    pub cohort: String,

    /// Set by the app to report activity; cleared when consumed into a
    /// ping.
    #[serde(default)]
    pub active_bit: bool,

    /// Registered post-install commands, by command id.
    #[serde(default)]
    pub app_commands: BTreeMap<String, String>,
}

impl Registration {
    /// A minimal registration for `app_id` at `version`.
    #[must_use]
    pub fn new(app_id: &str, version: Version) -> Self {
        Self {
            app_id: app_id.to_ascii_lowercase(),
            version,
            brand_code: String::new(),
            brand_path: String::new(),
            ap: String::new(),
            existence_checker_path: String::new(),
            install_data_index: None,
            cohort: String::new(),
            active_bit: false,
            app_commands: BTreeMap::new(),
        }
    }
}

/// Decides whether an existence-checker path still attests ownership.
///
/// Platforms differ: on some, a path owned by a different principal
/// than the updater also fails the check. Injected so tests and
/// platform wiring can vary the rule.
pub trait ExistenceChecker: Send + Sync {
    /// Whether the product at `path` is still genuinely installed.
    fn exists(&self, path: &Path) -> bool;
}

/// Filesystem presence check.
#[derive(Debug, Default)]
pub struct FsExistenceChecker;

impl ExistenceChecker for FsExistenceChecker {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Errors from registration table operations.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Persistent store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Durable, lock-guarded registration table.
pub struct RegistrationTable {
    store: Arc<dyn PersistentStore>,
}

impl RegistrationTable {
    /// Create a table over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    fn load(&self) -> Result<BTreeMap<String, Registration>, RegistrationError> {
        Ok(self
            .store
            .load_doc::<BTreeMap<String, Registration>>(REGISTRATIONS_KEY)?
            .unwrap_or_default())
    }

    fn save(
        &self,
        table: &BTreeMap<String, Registration>,
    ) -> Result<(), RegistrationError> {
        self.store.save_doc(REGISTRATIONS_KEY, table)?;
        Ok(())
    }

    /// Look up a registration by app id (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Store`] on persistence failure.
    pub fn get(&self, app_id: &str) -> Result<Option<Registration>, RegistrationError> {
        Ok(self.load()?.remove(&app_id.to_ascii_lowercase()))
    }

    /// All registrations in enumeration (app id) order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Store`] on persistence failure.
    pub fn list(&self) -> Result<Vec<Registration>, RegistrationError> {
        Ok(self.load()?.into_values().collect())
    }

    /// Upsert a registration.
    ///
    /// Brand is merged, not clobbered: if the stored entry already has
    /// a brand code, the incoming one is ignored unless
    /// `overwrite_brand` is set. The tag (`ap`), version, cohort and
    /// paths always follow the incoming registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Store`] on persistence failure.
    pub fn register(
        &self,
        _guard: &SetupGuard,
        registration: Registration,
        overwrite_brand: bool,
    ) -> Result<(), RegistrationError> {
        let mut table = self.load()?;
        let mut incoming = registration;
        incoming.app_id = incoming.app_id.to_ascii_lowercase();
        let app_id = incoming.app_id.clone();
        match table.get_mut(&app_id) {
            Some(existing) => {
                if !existing.brand_code.is_empty() && !overwrite_brand {
                    incoming.brand_code = existing.brand_code.clone();
                    incoming.brand_path = existing.brand_path.clone();
                }
                // Activity already reported by the app survives a
                // re-registration.
                incoming.active_bit = incoming.active_bit || existing.active_bit;
                *existing = incoming;
            },
            None => {
                info!(app_id = %app_id, "registered app");
                table.insert(app_id, incoming);
            },
        }
        self.save(&table)
    }

    /// Remove a registration. Unregistering an absent id is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Store`] on persistence failure.
    pub fn unregister(
        &self,
        _guard: &SetupGuard,
        app_id: &str,
    ) -> Result<(), RegistrationError> {
        let mut table = self.load()?;
        if table.remove(&app_id.to_ascii_lowercase()).is_some() {
            info!(app_id, "unregistered app");
            self.save(&table)?;
        }
        Ok(())
    }

    /// Record activity for an app. May be called concurrently by app
    /// processes; the bit is sticky until consumed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Store`] on persistence failure.
    pub fn set_active_bit(
        &self,
        _guard: &SetupGuard,
        app_id: &str,
    ) -> Result<(), RegistrationError> {
        let mut table = self.load()?;
        if let Some(entry) = table.get_mut(&app_id.to_ascii_lowercase()) {
            entry.active_bit = true;
            self.save(&table)?;
        }
        Ok(())
    }

    /// Atomically read and clear all active bits.
    ///
    /// The read-and-clear happens in one guarded mutation so each
    /// activity is reported exactly once per reporting cycle.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Store`] on persistence failure.
    pub fn consume_active_bits(
        &self,
        _guard: &SetupGuard,
    ) -> Result<Vec<String>, RegistrationError> {
        let mut table = self.load()?;
        let mut active = Vec::new();
        for (app_id, entry) in &mut table {
            if entry.active_bit {
                entry.active_bit = false;
                active.push(app_id.clone());
            }
        }
        if !active.is_empty() {
            self.save(&table)?;
        }
        Ok(active)
    }

    /// Record an applied update for `app_id`: bump version and adopt a
    /// server-assigned cohort if one was provided.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Store`] on persistence failure.
    pub fn record_update(
        &self,
        _guard: &SetupGuard,
        app_id: &str,
        version: &Version,
        cohort: Option<&str>,
    ) -> Result<(), RegistrationError> {
        let mut table = self.load()?;
        if let Some(entry) = table.get_mut(&app_id.to_ascii_lowercase()) {
            entry.version = version.clone();
            if let Some(cohort) = cohort {
                entry.cohort = cohort.to_string();
            }
            self.save(&table)?;
        }
        Ok(())
    }

    /// Unregister every entry whose existence-checker path no longer
    /// resolves. One O(n) scan, run once per wake cycle.
    ///
    /// Returns the ids that were pruned.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Store`] on persistence failure.
    pub fn prune_unowned(
        &self,
        _guard: &SetupGuard,
        checker: &dyn ExistenceChecker,
    ) -> Result<Vec<String>, RegistrationError> {
        let mut table = self.load()?;
        let mut pruned = Vec::new();
        table.retain(|app_id, entry| {
            if entry.existence_checker_path.is_empty()
                || checker.exists(Path::new(&entry.existence_checker_path))
            {
                true
            } else {
                debug!(app_id = %app_id, "pruning registration: product no longer installed");
                pruned.push(app_id.clone());
                false
            }
        });
        if !pruned.is_empty() {
            self.save(&table)?;
        }
        Ok(pruned)
    }
}
