//! Candidate qualification.
//!
//! A freshly installed updater version must prove the whole pipeline
//! works before it may take over: it checks for, downloads, and
//! applies an update to a reserved qualification app through the real
//! client, fetcher, and installer. Anything short of a clean apply
//! fails the candidate.

use std::sync::Arc;
use std::time::Duration;

use rollout_core::installer::InstallVerdict;
use rollout_core::lock::SetupLock;
use rollout_core::protocol::{CheckStatus, Priority, UpdateCheckRequest};
use rollout_core::version::Version;
use rollout_core::versions::VersionStore;
use tracing::{info, warn};

use crate::client::{ClientError, UpdateClient};
use crate::errors::UpdateError;
use crate::fetch::PayloadFetcher;
use crate::orchestrator::InstallRunner;

/// Reserved app id exercised by qualification cycles.
pub const QUALIFICATION_APP_ID: &str = "rollout-qualification";

/// Version the qualification app reports; the server is expected to
/// offer an update from it.
pub const QUALIFICATION_START_VERSION: &str = "0.1";

const SETUP_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a qualification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Qualification {
    /// The candidate drove a full update cycle cleanly.
    Passed,
    /// The candidate must not activate.
    Failed(String),
}

/// Runs the qualification self-test for a candidate version.
pub struct QualificationEngine {
    versions: VersionStore,
    lock: Arc<dyn SetupLock>,
    client: Arc<dyn UpdateClient>,
    fetcher: Arc<dyn PayloadFetcher>,
    runner: Arc<dyn InstallRunner>,
}

impl QualificationEngine {
    /// Engine over the shared version store and pipeline components.
    #[must_use]
    pub fn new(
        versions: VersionStore,
        lock: Arc<dyn SetupLock>,
        client: Arc<dyn UpdateClient>,
        fetcher: Arc<dyn PayloadFetcher>,
        runner: Arc<dyn InstallRunner>,
    ) -> Self {
        Self {
            versions,
            lock,
            client,
            fetcher,
            runner,
        }
    }

    /// Qualify `candidate`.
    ///
    /// If a newer-or-equal version is already active the candidate is
    /// superseded and fails immediately, with no network traffic.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError`] for infrastructure failures (lock,
    /// store). A qualification verdict, including failure, is the `Ok`
    /// path.
    pub async fn qualify(
        &self,
        candidate: &Version,
    ) -> Result<Qualification, UpdateError> {
        {
            let guard = self.lock.acquire(SETUP_LOCK_TIMEOUT)?;
            if let Some(active) = self
                .versions
                .active(&guard)
                .map_err(|e| UpdateError::QualificationFailure(e.to_string()))?
            {
                if active.version >= *candidate {
                    info!(
                        candidate = %candidate,
                        active = %active.version,
                        "qualification short-circuited: superseded"
                    );
                    return Ok(Qualification::Failed("superseded".to_string()));
                }
            }
        }

        let start = Version::parse(QUALIFICATION_START_VERSION)
            .map_err(|e| UpdateError::QualificationFailure(e.to_string()))?;
        let request = UpdateCheckRequest {
            app_id: QUALIFICATION_APP_ID.to_string(),
            version: start.clone(),
            ap: String::new(),
            iid: None,
            install_data_index: None,
            same_version_update: false,
            rollback: false,
            target_version_prefix: None,
            target_channel: None,
            priority: Priority::Background,
        };
        let results = match self
            .client
            .check(&format!("qualify-{candidate}"), vec![request.clone()])
            .await
        {
            Ok(results) => results,
            Err(ClientError::Transient(first)) => {
                warn!(error = %first, "qualification check transient failure, retrying once");
                match self
                    .client
                    .check(&format!("qualify-{candidate}"), vec![request])
                    .await
                {
                    Ok(results) => results,
                    Err(err) => {
                        return Ok(Qualification::Failed(format!(
                            "update check failed: {err}"
                        )));
                    },
                }
            },
            Err(err) => {
                return Ok(Qualification::Failed(format!("update check failed: {err}")));
            },
        };

        let Some(result) = results
            .into_iter()
            .find(|r| r.app_id.eq_ignore_ascii_case(QUALIFICATION_APP_ID))
        else {
            return Ok(Qualification::Failed("no response for qualification app".into()));
        };
        if result.status != CheckStatus::Ok {
            return Ok(Qualification::Failed(format!(
                "expected an offer, got {:?}",
                result.status
            )));
        }
        let Some(offered) = result.version else {
            return Ok(Qualification::Failed("offer without a version".into()));
        };
        if offered <= start {
            return Ok(Qualification::Failed(format!(
                "offer {offered} does not advance {start}"
            )));
        }
        let Some(payload) = result.payload else {
            return Ok(Qualification::Failed("offer without a payload".into()));
        };

        let staged = match self.fetcher.fetch(&payload).await {
            Ok(path) => path,
            Err(err) => {
                return Ok(Qualification::Failed(format!("download failed: {err}")));
            },
        };
        let outcome = match self.runner.install(QUALIFICATION_APP_ID, &staged).await {
            Ok(outcome) => outcome,
            Err(err) => {
                return Ok(Qualification::Failed(format!(
                    "installer failed to start: {err}"
                )));
            },
        };
        match outcome.interpret() {
            InstallVerdict::Success { .. } => {
                info!(candidate = %candidate, "qualification passed");
                Ok(Qualification::Passed)
            },
            InstallVerdict::Failure { category, code, .. } => Ok(Qualification::Failed(
                format!("apply failed: category {category:?}, code {code}"),
            )),
        }
    }
}
