//! The per-wake update cycle.
//!
//! Each wake runs one pass of a fixed state machine: policy check,
//! per-app update check, apply, report, cleanup. Concurrent wakes to
//! one instance coalesce into a single in-flight cycle, and background
//! wakes inside the check period are debounced without touching the
//! network. Per-app failures never abort the batch.
//!
//! The setup lock is held only for state snapshots and write-backs,
//! never across a network exchange or an installer run.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollout_core::installer::{ErrorCategory, InstallVerdict, InstallerOutcome};
use rollout_core::lock::SetupLock;
use rollout_core::policy::{PolicyResolver, UpdateMode};
use rollout_core::prefs::InstancePrefs;
use rollout_core::protocol::{
    AppCheckResult, CheckStatus, EventType, PingEvent, PayloadRef, Priority,
    ProtocolError, UpdateCheckRequest,
};
use rollout_core::registration::{ExistenceChecker, Registration, RegistrationTable};
use rollout_core::version::Version;
use rollout_core::versions::VersionStore;
use tracing::{debug, info, warn};

use crate::client::{ClientError, UpdateClient};
use crate::clock::Clock;
use crate::errors::UpdateError;
use crate::fetch::{FetchError, PayloadFetcher};

/// Pseudo app id under which the updater checks for its own updates.
pub const UPDATER_APP_ID: &str = "rollout-updater";

/// How long a cycle waits for the setup lock before aborting the
/// mutation and deferring to the next wake.
const SETUP_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs an application installer against a staged payload.
#[async_trait]
pub trait InstallRunner: Send + Sync {
    /// Run the installer for `app_id` from `payload`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error only if the installer could not be started
    /// at all; installers that start and fail report through the
    /// returned outcome.
    async fn install(
        &self,
        app_id: &str,
        payload: &Path,
    ) -> Result<InstallerOutcome, std::io::Error>;
}

/// Executes the staged payload as an installer process.
#[derive(Debug, Default)]
pub struct ProcessInstallRunner;

#[async_trait]
impl InstallRunner for ProcessInstallRunner {
    async fn install(
        &self,
        app_id: &str,
        payload: &Path,
    ) -> Result<InstallerOutcome, std::io::Error> {
        let status = tokio::process::Command::new(payload)
            .arg("--install")
            .arg(format!("--appid={app_id}"))
            .status()
            .await?;
        Ok(InstallerOutcome::from_exit_code(status.code().unwrap_or(-1)))
    }
}

/// Why a wake happened. On-demand wakes bypass debounce and report
/// with foreground priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Periodic background wake.
    Scheduled,
    /// Explicit request (`update-all`, install, handoff).
    OnDemand,
}

/// Why a wake produced no cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another cycle was already in flight.
    Coalesced,
    /// Inside the policy suppression window.
    Suppressed,
    /// A cycle already ran within the check period.
    Debounced,
}

/// Outcome of processing one app within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppOutcome {
    /// An offered payload applied and the registration advanced.
    Applied {
        /// The version now registered.
        version: Version,
        /// Whether this was a first install rather than an update.
        fresh_install: bool,
    },
    /// The updater staged its own new version as a candidate.
    SelfUpdateStaged {
        /// The candidate version.
        version: Version,
    },
    /// The server had nothing newer.
    UpToDate,
    /// Excluded by policy. Not an error; no ping.
    PolicyDisabled,
    /// Cancelled before apply; registration untouched.
    Cancelled,
    /// Processing failed; registration untouched.
    Failed {
        /// Category for the failure ping.
        category: ErrorCategory,
        /// Error code for the failure ping.
        code: i32,
    },
}

/// One app's slice of a cycle report.
#[derive(Debug, Clone)]
pub struct AppReport {
    /// The app processed.
    pub app_id: String,
    /// What happened.
    pub outcome: AppOutcome,
}

/// What one wake did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Set when the wake performed no cycle.
    pub skipped: Option<SkipReason>,
    /// Per-app outcomes, in processing order.
    pub apps: Vec<AppReport>,
    /// Events successfully handed to the client for reporting.
    pub pings_sent: usize,
    /// The instance should uninstall itself: nothing is registered and
    /// the server-start grace period is exhausted.
    pub self_uninstall: bool,
    /// Request id binding the exchange and its pings.
    pub request_id: String,
}

impl CycleReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            apps: Vec::new(),
            pings_sent: 0,
            self_uninstall: false,
            request_id: String::new(),
        }
    }

    /// The outcome recorded for `app_id`, if the cycle processed it.
    #[must_use]
    pub fn outcome_for(&self, app_id: &str) -> Option<&AppOutcome> {
        self.apps
            .iter()
            .find(|a| a.app_id.eq_ignore_ascii_case(app_id))
            .map(|a| &a.outcome)
    }
}

/// Requests cancellation of in-flight per-app work.
///
/// Cancellation is checked between the update check and apply; a
/// cancelled app keeps its pre-cycle registration and reports the
/// cancelled category.
#[derive(Debug, Clone, Default)]
pub struct CancelSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl CancelSet {
    /// Request cancellation for `app_id`.
    pub fn cancel(&self, app_id: &str) {
        if let Ok(mut set) = self.inner.lock() {
            set.insert(app_id.to_ascii_lowercase());
        }
    }

    fn take(&self, app_id: &str) -> bool {
        self.inner
            .lock()
            .map(|mut set| set.remove(&app_id.to_ascii_lowercase()))
            .unwrap_or(false)
    }
}

/// Everything a cycle needs, injected so tests substitute in-memory
/// stores and scripted doubles.
pub struct OrchestratorContext {
    /// Product registrations.
    pub registrations: RegistrationTable,
    /// Installed updater versions.
    pub versions: VersionStore,
    /// Instance flags and counters.
    pub prefs: InstancePrefs,
    /// Platform/cloud policy.
    pub policy: PolicyResolver,
    /// Scoped setup lock.
    pub lock: Arc<dyn SetupLock>,
    /// Server exchanges.
    pub client: Arc<dyn UpdateClient>,
    /// Payload downloads.
    pub fetcher: Arc<dyn PayloadFetcher>,
    /// Installer execution.
    pub runner: Arc<dyn InstallRunner>,
    /// Product ownership attestation.
    pub existence: Arc<dyn ExistenceChecker>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// The version this instance is running.
    pub own_version: Version,
}

/// The wake-cycle state machine.
pub struct Orchestrator {
    ctx: OrchestratorContext,
    cycle_gate: tokio::sync::Mutex<()>,
    last_exchange: Mutex<Option<DateTime<Utc>>>,
    fresh_installs: Mutex<HashSet<String>>,
    cancels: CancelSet,
    request_counter: AtomicU64,
}

impl Orchestrator {
    /// Build an orchestrator over `ctx`.
    #[must_use]
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self {
            ctx,
            cycle_gate: tokio::sync::Mutex::new(()),
            last_exchange: Mutex::new(None),
            fresh_installs: Mutex::new(HashSet::new()),
            cancels: CancelSet::default(),
            request_counter: AtomicU64::new(0),
        }
    }

    /// Handle for requesting per-app cancellation.
    #[must_use]
    pub fn cancel_set(&self) -> CancelSet {
        self.cancels.clone()
    }

    /// Register an app and run one on-demand cycle for it. The outcome
    /// ping for the app uses the install event type, and the
    /// registration's install-data index rides the update check.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError`] if registration or the cycle fails as a
    /// whole; per-app failures are carried in the report.
    pub async fn install_app(
        &self,
        registration: Registration,
    ) -> Result<CycleReport, UpdateError> {
        let app_id = registration.app_id.to_ascii_lowercase();
        {
            let guard = self.ctx.lock.acquire(SETUP_LOCK_TIMEOUT)?;
            self.ctx
                .registrations
                .register(&guard, registration, false)
                .map_err(|e| UpdateError::Store(store_cause(e)))?;
            // A fresh install restarts the unused-instance grace period.
            self.ctx.prefs.reset_server_starts(&guard)?;
        }
        if let Ok(mut fresh) = self.fresh_installs.lock() {
            fresh.insert(app_id);
        }
        self.run_cycle(WakeReason::OnDemand).await
    }

    /// Send the uninstall ping for this instance, unless the EULA was
    /// never accepted (no ping leaves the machine before acceptance).
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Store`] if instance state cannot be read.
    pub async fn send_uninstall_ping(&self) -> Result<(), UpdateError> {
        let state = self.ctx.prefs.load()?;
        if !state.eula_accepted {
            debug!("suppressing uninstall ping: eula not accepted");
            return Ok(());
        }
        let request_id = self.next_request_id();
        let event =
            PingEvent::uninstall(UPDATER_APP_ID, self.ctx.own_version.clone());
        if let Err(err) = self.ctx.client.ping(&request_id, vec![event]).await {
            warn!(error = %err, "uninstall ping failed");
        }
        Ok(())
    }

    fn next_request_id(&self) -> String {
        let seq = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{}",
            self.ctx.own_version,
            self.ctx.clock.now().timestamp_millis(),
            seq
        )
    }

    fn debounced(&self, now: DateTime<Utc>, check_period: Duration) -> bool {
        let last = self.last_exchange.lock().ok().and_then(|l| *l);
        match last {
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed
                    .to_std()
                    .map(|e| e < check_period)
                    .unwrap_or(true)
            },
            None => false,
        }
    }

    /// Run one wake cycle.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError`] only for cycle-fatal conditions (state
    /// unreadable, setup lock unavailable for the initial snapshot).
    /// Per-app failures are isolated into their [`AppReport`]s.
    pub async fn run_cycle(&self, reason: WakeReason) -> Result<CycleReport, UpdateError> {
        // Coalescing: at most one cycle in flight per instance.
        let Ok(_cycle) = self.cycle_gate.try_lock() else {
            debug!("wake coalesced into in-flight cycle");
            return Ok(CycleReport::skipped(SkipReason::Coalesced));
        };

        let now = self.ctx.clock.now();
        let globals = self.ctx.policy.globals();
        if reason == WakeReason::Scheduled {
            if let Some(window) = &globals.suppressed_times {
                if window.contains(now.time()) {
                    debug!("wake suppressed: inside quiet hours");
                    return Ok(CycleReport::skipped(SkipReason::Suppressed));
                }
            }
            if self.debounced(now, globals.check_period()) {
                debug!("wake debounced: checked within the period");
                return Ok(CycleReport::skipped(SkipReason::Debounced));
            }
        }

        // Snapshot state under the lock, then release it for the
        // network phase.
        let (state, registered) = {
            let guard = self.ctx.lock.acquire(SETUP_LOCK_TIMEOUT)?;
            let state = self.ctx.prefs.load()?;
            let registered = self
                .ctx
                .registrations
                .list()
                .map_err(|e| UpdateError::Store(store_cause(e)))?;
            drop(guard);
            (state, registered)
        };

        let request_id = self.next_request_id();
        let mut report = CycleReport {
            skipped: None,
            apps: Vec::new(),
            pings_sent: 0,
            self_uninstall: false,
            request_id: request_id.clone(),
        };

        let priority = match reason {
            WakeReason::OnDemand => Priority::Foreground,
            WakeReason::Scheduled => Priority::Background,
        };
        let mut fresh: HashSet<String> = self
            .fresh_installs
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default();

        // Policy-forced installs: register missing apps now so this
        // cycle offers them for silent install.
        let mut registered = registered;
        let registered_ids: Vec<String> =
            registered.iter().map(|r| r.app_id.clone()).collect();
        let forced = self.ctx.policy.forced_installs_missing_from(&registered_ids);
        if !forced.is_empty() {
            let guard = self.ctx.lock.acquire(SETUP_LOCK_TIMEOUT)?;
            for app_id in &forced {
                info!(app_id = %app_id, "registering policy-forced install");
                let registration = Registration::new(app_id, Version::zero());
                self.ctx
                    .registrations
                    .register(&guard, registration.clone(), false)
                    .map_err(|e| UpdateError::Store(store_cause(e)))?;
                registered.push(registration);
                fresh.insert(app_id.clone());
            }
        }

        let mut requests = Vec::new();
        let mut versions_by_app: HashMap<String, Version> = HashMap::new();
        for reg in &registered {
            let effective = self.ctx.policy.resolve(&reg.app_id);
            if effective.update_mode == UpdateMode::Disabled {
                debug!(app_id = %reg.app_id, "excluded by policy");
                report.apps.push(AppReport {
                    app_id: reg.app_id.clone(),
                    outcome: AppOutcome::PolicyDisabled,
                });
                continue;
            }
            versions_by_app.insert(reg.app_id.clone(), reg.version.clone());
            requests.push(UpdateCheckRequest {
                app_id: reg.app_id.clone(),
                version: reg.version.clone(),
                ap: reg.ap.clone(),
                iid: None,
                install_data_index: reg.install_data_index.clone(),
                same_version_update: fresh.contains(&reg.app_id),
                rollback: effective.rollback_requested(&reg.version),
                target_version_prefix: effective.target_version_prefix,
                target_channel: effective.target_channel,
                priority,
            });
        }

        // The updater checks for itself under a pseudo app id, unless
        // the EULA is still pending.
        let self_check = state.eula_accepted
            && !registered.iter().any(|r| r.app_id == UPDATER_APP_ID);
        if self_check {
            versions_by_app
                .insert(UPDATER_APP_ID.to_string(), self.ctx.own_version.clone());
            requests.push(UpdateCheckRequest {
                app_id: UPDATER_APP_ID.to_string(),
                version: self.ctx.own_version.clone(),
                ap: String::new(),
                iid: None,
                install_data_index: None,
                same_version_update: false,
                rollback: false,
                target_version_prefix: None,
                target_channel: None,
                priority,
            });
        }

        if !requests.is_empty() {
            let results = self.exchange(&request_id, requests.clone()).await;
            match results {
                Ok(results) => {
                    // Only a completed exchange arms the debounce; a
                    // failed batch is retried on the next wake.
                    self.record_exchange(now);
                    let by_id: HashMap<String, AppCheckResult> = results
                        .into_iter()
                        .map(|r| (r.app_id.to_ascii_lowercase(), r))
                        .collect();
                    for request in &requests {
                        let outcome = match by_id.get(&request.app_id) {
                            Some(result) => {
                                self.process_app(request, result, &fresh).await
                            },
                            None => {
                                warn!(app_id = %request.app_id, "server omitted app from response");
                                AppOutcome::UpToDate
                            },
                        };
                        report.apps.push(AppReport {
                            app_id: request.app_id.clone(),
                            outcome,
                        });
                    }
                },
                Err(err) => {
                    warn!(error = %err, "update check failed for the whole batch");
                    for request in &requests {
                        report.apps.push(AppReport {
                            app_id: request.app_id.clone(),
                            outcome: AppOutcome::Failed {
                                category: ErrorCategory::UpdateCheck,
                                code: 0,
                            },
                        });
                    }
                },
            }
        }

        self.report_phase(&mut report, &versions_by_app, &fresh).await;
        self.cleanup_phase(&mut report, now)?;

        if let Ok(mut f) = self.fresh_installs.lock() {
            f.clear();
        }
        info!(
            request_id = %report.request_id,
            apps = report.apps.len(),
            pings = report.pings_sent,
            "cycle complete"
        );
        Ok(report)
    }

    /// One batched exchange with a single fallback retry on a
    /// transient failure.
    async fn exchange(
        &self,
        request_id: &str,
        requests: Vec<UpdateCheckRequest>,
    ) -> Result<Vec<AppCheckResult>, ClientError> {
        match self.ctx.client.check(request_id, requests.clone()).await {
            Err(ClientError::Transient(first)) => {
                warn!(error = %first, "update check transient failure, retrying once");
                self.ctx.client.check(request_id, requests).await
            },
            other => other,
        }
    }

    fn record_exchange(&self, now: DateTime<Utc>) {
        if let Ok(mut last) = self.last_exchange.lock() {
            *last = Some(now);
        }
    }

    async fn process_app(
        &self,
        request: &UpdateCheckRequest,
        result: &AppCheckResult,
        fresh: &HashSet<String>,
    ) -> AppOutcome {
        match self.try_process_app(request, result).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(app_id = %request.app_id, error = %err, "app processing failed");
                AppOutcome::Failed {
                    category: err.category(),
                    code: err.ping_code(),
                }
            },
        }
        .tap_fresh(fresh, &request.app_id)
    }

    async fn try_process_app(
        &self,
        request: &UpdateCheckRequest,
        result: &AppCheckResult,
    ) -> Result<AppOutcome, UpdateError> {
        if result.status == CheckStatus::NoUpdate {
            return Ok(AppOutcome::UpToDate);
        }
        if let Some(err) = Option::<ProtocolError>::from(result.status) {
            return Err(UpdateError::Protocol(err));
        }

        let version = result
            .version
            .clone()
            .ok_or(UpdateError::Protocol(ProtocolError::Malformed(
                "ok offer without a version".to_string(),
            )))?;
        let payload = result
            .payload
            .clone()
            .ok_or(UpdateError::Protocol(ProtocolError::NoHash))?;

        if self.cancels.take(&request.app_id) {
            info!(app_id = %request.app_id, "apply cancelled");
            return Ok(AppOutcome::Cancelled);
        }

        let staged = self.fetch_payload(&payload).await?;

        if request.app_id == UPDATER_APP_ID {
            // Self-update never activates here; the new version is
            // staged as a candidate and must qualify first.
            let outcome = self
                .ctx
                .runner
                .install(&request.app_id, &staged)
                .await
                .map_err(|err| UpdateError::Installer {
                    category: ErrorCategory::Install,
                    code: err.raw_os_error().unwrap_or(-1),
                })?;
            return match outcome.interpret() {
                InstallVerdict::Success { .. } => {
                    let guard = self.ctx.lock.acquire(SETUP_LOCK_TIMEOUT)?;
                    self.ctx
                        .versions
                        .register_candidate(
                            &guard,
                            &version,
                            &staged.to_string_lossy(),
                        )
                        .map_err(version_store_cause)?;
                    // The new candidate gets a fresh qualification
                    // attempt, even on overinstall of a failed version.
                    self.ctx.prefs.reset_qualification(&guard)?;
                    Ok(AppOutcome::SelfUpdateStaged { version })
                },
                InstallVerdict::Failure { category, code, .. } => {
                    Err(UpdateError::Installer { category, code })
                },
            };
        }

        let outcome = self
            .ctx
            .runner
            .install(&request.app_id, &staged)
            .await
            .map_err(|err| UpdateError::Installer {
                category: ErrorCategory::Install,
                code: err.raw_os_error().unwrap_or(-1),
            })?;
        match outcome.interpret() {
            InstallVerdict::Success { reboot_required } => {
                if reboot_required {
                    info!(app_id = %request.app_id, "installed; reboot required");
                }
                let guard = self.ctx.lock.acquire(SETUP_LOCK_TIMEOUT)?;
                self.ctx
                    .registrations
                    .record_update(
                        &guard,
                        &request.app_id,
                        &version,
                        result.cohort.as_deref(),
                    )
                    .map_err(|e| UpdateError::Store(store_cause(e)))?;
                Ok(AppOutcome::Applied {
                    version,
                    fresh_install: false,
                })
            },
            InstallVerdict::Failure { category, code, .. } => {
                Err(UpdateError::Installer { category, code })
            },
        }
    }

    async fn fetch_payload(&self, payload: &PayloadRef) -> Result<std::path::PathBuf, UpdateError> {
        self.ctx
            .fetcher
            .fetch(payload)
            .await
            .map_err(|err| match err {
                FetchError::Transient(msg) => UpdateError::NetworkTransient(msg),
                FetchError::HashMismatch { expected, actual } => {
                    UpdateError::HashMismatch { expected, actual }
                },
                FetchError::Io(io) => UpdateError::NetworkTransient(io.to_string()),
            })
    }

    /// Turn per-app outcomes into pings, fold in consumed active bits,
    /// and send. Ping failure is logged, never reversed into the
    /// outcomes.
    async fn report_phase(
        &self,
        report: &mut CycleReport,
        versions_by_app: &HashMap<String, Version>,
        fresh: &HashSet<String>,
    ) {
        let mut events = Vec::new();
        for app in &report.apps {
            let event_type = if fresh.contains(&app.app_id) {
                EventType::Install
            } else {
                EventType::Update
            };
            let event = match &app.outcome {
                AppOutcome::Applied { .. } | AppOutcome::SelfUpdateStaged { .. } => {
                    Some(PingEvent::success(&app.app_id, event_type))
                },
                AppOutcome::Failed { category, code } => Some(PingEvent::failure(
                    &app.app_id,
                    event_type,
                    *category,
                    *code,
                )),
                AppOutcome::Cancelled => Some(PingEvent::failure(
                    &app.app_id,
                    event_type,
                    ErrorCategory::Cancelled,
                    0,
                )),
                // Policy-disabled apps get no ping at all; up-to-date
                // apps have nothing to report.
                AppOutcome::PolicyDisabled | AppOutcome::UpToDate => None,
            };
            events.extend(event);
        }

        // Activity: read-and-clear under the lock so each bit reports
        // exactly once. Day stamps are not tracked, so `ad` is -1.
        let active = match self.ctx.lock.acquire(SETUP_LOCK_TIMEOUT) {
            Ok(guard) => self
                .ctx
                .registrations
                .consume_active_bits(&guard)
                .unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "skipping activity report: setup lock unavailable");
                Vec::new()
            },
        };
        for app_id in &active {
            if let Some(event) =
                events.iter_mut().find(|e| e.app_id == *app_id)
            {
                event.days_since_active = Some(-1);
            } else if versions_by_app.contains_key(app_id) {
                let mut event = PingEvent::success(app_id, EventType::Update);
                event.days_since_active = Some(-1);
                events.push(event);
            }
        }

        if events.is_empty() {
            return;
        }
        let count = events.len();
        match self.ctx.client.ping(&report.request_id, events).await {
            Ok(()) => report.pings_sent = count,
            Err(err) => {
                warn!(error = %err, "outcome ping failed");
                // The activity never reached the server; put the bits
                // back so the next reporting cycle carries them.
                self.restore_active_bits(&active);
            },
        }
    }

    fn restore_active_bits(&self, app_ids: &[String]) {
        if app_ids.is_empty() {
            return;
        }
        match self.ctx.lock.acquire(SETUP_LOCK_TIMEOUT) {
            Ok(guard) => {
                for app_id in app_ids {
                    if let Err(err) =
                        self.ctx.registrations.set_active_bit(&guard, app_id)
                    {
                        warn!(app_id = %app_id, error = %err, "could not restore active bit");
                    }
                }
            },
            Err(err) => {
                warn!(error = %err, "could not restore active bits: setup lock unavailable");
            },
        }
    }

    /// Prune dead registrations and decide whether this instance has
    /// outlived its usefulness.
    fn cleanup_phase(
        &self,
        report: &mut CycleReport,
        now: DateTime<Utc>,
    ) -> Result<(), UpdateError> {
        let guard = self.ctx.lock.acquire(SETUP_LOCK_TIMEOUT)?;
        let pruned = self
            .ctx
            .registrations
            .prune_unowned(&guard, &*self.ctx.existence)
            .map_err(|e| UpdateError::Store(store_cause(e)))?;
        if !pruned.is_empty() {
            info!(count = pruned.len(), "pruned registrations for removed products");
        }

        let managed = self
            .ctx
            .registrations
            .list()
            .map_err(|e| UpdateError::Store(store_cause(e)))?
            .iter()
            .filter(|r| r.app_id != UPDATER_APP_ID)
            .count();
        if managed == 0 {
            let state = self.ctx.prefs.count_server_start(&guard)?;
            if state.over_uninstall_threshold() {
                info!(
                    server_starts = state.server_starts,
                    "no products registered; instance should uninstall"
                );
                report.self_uninstall = true;
            }
        } else {
            self.ctx.prefs.reset_server_starts(&guard)?;
        }
        self.ctx.prefs.record_check(&guard, now)?;
        Ok(())
    }
}

impl AppOutcome {
    fn tap_fresh(self, fresh: &HashSet<String>, app_id: &str) -> Self {
        match self {
            Self::Applied { version, .. } if fresh.contains(app_id) => Self::Applied {
                version,
                fresh_install: true,
            },
            other => other,
        }
    }
}

fn store_cause(err: rollout_core::registration::RegistrationError) -> rollout_core::store::StoreError {
    match err {
        rollout_core::registration::RegistrationError::Store(e) => e,
    }
}

fn version_store_cause(err: rollout_core::versions::VersionStoreError) -> UpdateError {
    match err {
        rollout_core::versions::VersionStoreError::Store(e) => UpdateError::Store(e),
        other => UpdateError::QualificationFailure(other.to_string()),
    }
}
