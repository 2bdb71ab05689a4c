//! Scripted doubles for exercising the control loop without a server,
//! a network, or real installers.
//!
//! These are deliberately strict: an unexpected exchange panics, and
//! every test should drain its script with
//! [`ScriptedClient::assert_exhausted`]. Panicking is the point; the
//! doubles exist only inside tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rollout_core::protocol::{
    AppCheckResult, CheckStatus, PayloadRef, PingEvent, UpdateCheckRequest,
};
use rollout_core::registration::ExistenceChecker;
use rollout_core::installer::InstallerOutcome;
use rollout_core::version::Version;
use sha2::{Digest, Sha256};

use crate::client::{ClientError, UpdateClient};
use crate::clock::Clock;
use crate::fetch::{FetchError, PayloadFetcher};
use crate::orchestrator::InstallRunner;
use crate::self_manage::LivenessProbe;

/// A clock tests move by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock starting at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += ChronoDuration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// One scripted update-check exchange.
pub enum ScriptedExchange {
    /// Respond per app id; apps missing from the map are omitted from
    /// the response.
    Respond(HashMap<String, AppCheckResult>),
    /// Fail the exchange with a transient network error.
    TransientFailure,
}

/// An [`UpdateClient`] that replays a fixed script and records
/// everything it was asked.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<ScriptedExchange>>,
    checks_seen: Mutex<Vec<Vec<UpdateCheckRequest>>>,
    pings_seen: Mutex<Vec<PingEvent>>,
    fail_pings: Mutex<bool>,
}

impl ScriptedClient {
    /// An empty-script client; every exchange must be queued first.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next exchange.
    pub fn expect_exchange(&self, exchange: ScriptedExchange) {
        self.script.lock().unwrap().push_back(exchange);
    }

    /// Make subsequent ping sends fail (or recover).
    pub fn fail_pings(&self, fail: bool) {
        *self.fail_pings.lock().unwrap() = fail;
    }

    /// Every update-check request batch seen, in order.
    #[must_use]
    pub fn checks_seen(&self) -> Vec<Vec<UpdateCheckRequest>> {
        self.checks_seen.lock().unwrap().clone()
    }

    /// Every ping event seen, flattened, in order.
    #[must_use]
    pub fn pings_seen(&self) -> Vec<PingEvent> {
        self.pings_seen.lock().unwrap().clone()
    }

    /// Panic if scripted exchanges were left unconsumed.
    pub fn assert_exhausted(&self) {
        let remaining = self.script.lock().unwrap().len();
        assert_eq!(remaining, 0, "{remaining} scripted exchanges never happened");
    }
}

#[async_trait]
impl UpdateClient for ScriptedClient {
    async fn check(
        &self,
        _request_id: &str,
        apps: Vec<UpdateCheckRequest>,
    ) -> Result<Vec<AppCheckResult>, ClientError> {
        self.checks_seen.lock().unwrap().push(apps.clone());
        let exchange = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected update check for {apps:?}"));
        match exchange {
            ScriptedExchange::Respond(by_app) => Ok(apps
                .iter()
                .filter_map(|request| by_app.get(&request.app_id).cloned())
                .collect()),
            ScriptedExchange::TransientFailure => {
                Err(ClientError::Transient("scripted failure".to_string()))
            },
        }
    }

    async fn ping(
        &self,
        _request_id: &str,
        events: Vec<PingEvent>,
    ) -> Result<(), ClientError> {
        if *self.fail_pings.lock().unwrap() {
            return Err(ClientError::Transient("scripted ping failure".to_string()));
        }
        self.pings_seen.lock().unwrap().extend(events);
        Ok(())
    }
}

/// Build an `ok` offer for `app_id` at `version` with `payload`.
#[must_use]
pub fn offer(app_id: &str, version: &str, payload: PayloadRef) -> AppCheckResult {
    AppCheckResult {
        app_id: app_id.to_string(),
        status: CheckStatus::Ok,
        version: Some(Version::parse(version).unwrap()),
        payload: Some(payload),
        cohort: None,
    }
}

/// Build a `noupdate` result for `app_id`.
#[must_use]
pub fn no_update(app_id: &str) -> AppCheckResult {
    AppCheckResult {
        app_id: app_id.to_string(),
        status: CheckStatus::NoUpdate,
        version: None,
        payload: None,
        cohort: None,
    }
}

/// A fetcher serving payloads staged ahead of time by the test.
pub struct StagedFetcher {
    dir: tempfile::TempDir,
    staged: Mutex<HashMap<String, PathBuf>>,
}

impl StagedFetcher {
    /// An empty fetcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Stage `bytes` and return the payload reference offering them.
    #[must_use]
    pub fn stage(&self, name: &str, bytes: &[u8]) -> PayloadRef {
        let hash: String = Sha256::digest(bytes)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        let path = self.dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        self.staged.lock().unwrap().insert(hash.clone(), path);
        PayloadRef {
            url: format!("http://test.invalid/{name}"),
            hash_sha256: hash,
        }
    }
}

impl Default for StagedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PayloadFetcher for StagedFetcher {
    async fn fetch(&self, payload: &PayloadRef) -> Result<PathBuf, FetchError> {
        self.staged
            .lock()
            .unwrap()
            .get(&payload.hash_sha256)
            .cloned()
            .ok_or_else(|| FetchError::Transient("payload not staged".to_string()))
    }
}

/// An install runner replaying scripted outcomes, success by default.
#[derive(Default)]
pub struct ScriptedRunner {
    outcomes: Mutex<HashMap<String, VecDeque<InstallerOutcome>>>,
    installs_seen: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    /// A runner that succeeds for every install.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next outcome for `app_id`.
    pub fn expect_outcome(&self, app_id: &str, outcome: InstallerOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(app_id.to_ascii_lowercase())
            .or_default()
            .push_back(outcome);
    }

    /// App ids installed, in order.
    #[must_use]
    pub fn installs_seen(&self) -> Vec<String> {
        self.installs_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstallRunner for ScriptedRunner {
    async fn install(
        &self,
        app_id: &str,
        _payload: &std::path::Path,
    ) -> Result<InstallerOutcome, std::io::Error> {
        self.installs_seen.lock().unwrap().push(app_id.to_string());
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&app_id.to_ascii_lowercase())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(InstallerOutcome::success))
    }
}

/// Existence checker that considers every product installed.
#[derive(Debug, Default)]
pub struct AlwaysOwned;

impl ExistenceChecker for AlwaysOwned {
    fn exists(&self, _path: &std::path::Path) -> bool {
        true
    }
}

/// Liveness probe with a fixed answer.
#[derive(Debug)]
pub struct FixedLiveness(pub bool);

impl LivenessProbe for FixedLiveness {
    fn alive(&self, _install_path: &str) -> bool {
        self.0
    }
}
