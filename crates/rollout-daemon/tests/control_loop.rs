//! End-to-end control-loop behavior over in-memory state and scripted
//! server exchanges.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rollout_core::installer::{codes, ErrorCategory, InstallerOutcome, InstallerResult};
use rollout_core::lock::{MemorySetupLock, SetupLock};
use rollout_core::policy::{
    AppPolicy, InstallMode, PlatformPolicy, PolicyResolver, UpdateMode,
};
use rollout_core::prefs::{InstancePrefs, SERVER_STARTS_UNINSTALL_THRESHOLD};
use rollout_core::protocol::{
    AppCheckResult, EventType, PingEvent, UpdateCheckRequest,
};
use rollout_core::registration::{Registration, RegistrationTable};
use rollout_core::store::MemoryStore;
use rollout_core::version::Version;
use rollout_core::versions::{VersionState, VersionStore};
use rollout_daemon::client::{ClientError, UpdateClient};
use rollout_daemon::orchestrator::{
    AppOutcome, Orchestrator, OrchestratorContext, SkipReason, WakeReason,
    UPDATER_APP_ID,
};
use rollout_daemon::qualification::{
    QualificationEngine, QUALIFICATION_APP_ID, QUALIFICATION_START_VERSION,
};
use rollout_daemon::self_manage::{SelfAction, SelfManagementController};
use rollout_daemon::testing::{
    no_update, offer, AlwaysOwned, FixedLiveness, ManualClock, ScriptedClient,
    ScriptedExchange, ScriptedRunner, StagedFetcher,
};

fn v(s: &str) -> Version {
    Version::parse(s).unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    lock: Arc<MemorySetupLock>,
    client: Arc<ScriptedClient>,
    fetcher: Arc<StagedFetcher>,
    runner: Arc<ScriptedRunner>,
    clock: Arc<ManualClock>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(policy: PolicyResolver, own_version: &str) -> Self {
        let store = Arc::new(MemoryStore::new());
        let lock = Arc::new(MemorySetupLock::new());
        let client = Arc::new(ScriptedClient::new());
        let fetcher = Arc::new(StagedFetcher::new());
        let runner = Arc::new(ScriptedRunner::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
        ));
        let orchestrator = Orchestrator::new(OrchestratorContext {
            registrations: RegistrationTable::new(store.clone()),
            versions: VersionStore::new(store.clone()),
            prefs: InstancePrefs::new(store.clone()),
            policy,
            lock: lock.clone(),
            client: client.clone(),
            fetcher: fetcher.clone(),
            runner: runner.clone(),
            existence: Arc::new(AlwaysOwned),
            clock: clock.clone(),
            own_version: v(own_version),
        });
        Self {
            store,
            lock,
            client,
            fetcher,
            runner,
            clock,
            orchestrator,
        }
    }

    fn default_policy() -> PolicyResolver {
        PolicyResolver::new(PlatformPolicy::default(), None, false)
    }

    fn registrations(&self) -> RegistrationTable {
        RegistrationTable::new(self.store.clone())
    }

    fn prefs(&self) -> InstancePrefs {
        InstancePrefs::new(self.store.clone())
    }

    fn register(&self, app_id: &str, version: &str) {
        let guard = self.lock.acquire(Duration::from_secs(1)).unwrap();
        self.registrations()
            .register(&guard, Registration::new(app_id, v(version)), false)
            .unwrap();
    }

    fn respond(&self, results: Vec<AppCheckResult>) {
        let by_app: HashMap<String, AppCheckResult> = results
            .into_iter()
            .map(|r| (r.app_id.clone(), r))
            .collect();
        self.client
            .expect_exchange(ScriptedExchange::Respond(by_app));
    }
}

fn install_pings(pings: &[PingEvent]) -> Vec<&PingEvent> {
    pings
        .iter()
        .filter(|p| p.event_type == EventType::Install)
        .collect()
}

// Scenario: installing an unregistered app applies the server's offer
// and reports exactly one install event.
#[tokio::test]
async fn install_app_applies_offer_and_pings_install_event() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");
    let payload = h.fetcher.stage("test.crx", b"test installer");
    h.respond(vec![offer("test", "1", payload)]);

    let report = h
        .orchestrator
        .install_app(Registration::new("test", v("0.1")))
        .await
        .unwrap();

    assert_eq!(
        report.outcome_for("test"),
        Some(&AppOutcome::Applied {
            version: v("1"),
            fresh_install: true
        })
    );
    let stored = h.registrations().get("test").unwrap().unwrap();
    assert_eq!(stored.version, v("1"));

    let pings = h.client.pings_seen();
    let installs = install_pings(&pings);
    assert_eq!(installs.len(), 1);
    assert_eq!(installs[0].app_id, "test");
    assert_eq!(installs[0].event_result, 1);
    h.client.assert_exhausted();
}

// Scenario: a passed qualification activates the candidate on the
// following wake and demotes the old active version.
#[tokio::test]
async fn qualification_then_two_wake_activation() {
    let h = Harness::new(Harness::default_policy(), "2.0");
    let versions = VersionStore::new(h.store.clone());
    {
        let guard = h.lock.acquire(Duration::from_secs(1)).unwrap();
        versions.register_candidate(&guard, &v("1.0"), "/v/1.0").unwrap();
        versions.promote_to_active(&guard, &v("1.0")).unwrap();
        versions.register_candidate(&guard, &v("2.0"), "/v/2.0").unwrap();
    }

    let qualifier = QualificationEngine::new(
        VersionStore::new(h.store.clone()),
        h.lock.clone(),
        h.client.clone(),
        h.fetcher.clone(),
        h.runner.clone(),
    );
    let controller = SelfManagementController::new(
        VersionStore::new(h.store.clone()),
        h.prefs(),
        h.lock.clone(),
        qualifier,
        Arc::new(FixedLiveness(true)),
        v("2.0"),
    );

    // Wake 1: the candidate qualifies through the real pipeline.
    let payload = h.fetcher.stage("qual.crx", b"qualification payload");
    h.respond(vec![offer(QUALIFICATION_APP_ID, "0.2", payload)]);
    assert_eq!(controller.step().await.unwrap(), SelfAction::Qualified);
    assert_eq!(
        h.runner.installs_seen(),
        vec![QUALIFICATION_APP_ID.to_string()]
    );

    // Wake 2: the qualification outcome is observed and 2.0 activates.
    assert_eq!(
        controller.step().await.unwrap(),
        SelfAction::Activated(v("2.0"))
    );

    let guard = h.lock.acquire(Duration::from_secs(1)).unwrap();
    let entries = versions.list(&guard).unwrap();
    let one = entries.iter().find(|e| e.version == v("1.0")).unwrap();
    let two = entries.iter().find(|e| e.version == v("2.0")).unwrap();
    assert_eq!(one.state, VersionState::Uninstalling);
    assert_eq!(two.state, VersionState::Active);
    h.client.assert_exhausted();
}

// Scenario: a superseded candidate fails without any network traffic.
#[tokio::test]
async fn superseded_candidate_fails_without_network() {
    let h = Harness::new(Harness::default_policy(), "2.0");
    let versions = VersionStore::new(h.store.clone());
    {
        let guard = h.lock.acquire(Duration::from_secs(1)).unwrap();
        versions.register_candidate(&guard, &v("3.0"), "/v/3.0").unwrap();
        versions.promote_to_active(&guard, &v("3.0")).unwrap();
    }
    let qualifier = QualificationEngine::new(
        VersionStore::new(h.store.clone()),
        h.lock.clone(),
        h.client.clone(),
        h.fetcher.clone(),
        h.runner.clone(),
    );

    let verdict = qualifier.qualify(&v("2.0")).await.unwrap();
    assert_eq!(
        verdict,
        rollout_daemon::qualification::Qualification::Failed("superseded".into())
    );
    assert!(h.client.checks_seen().is_empty());
}

// Scenario: a policy-disabled app never appears in the exchange while
// other apps in the same call still do.
#[tokio::test]
async fn policy_disabled_app_is_excluded_from_exchange() {
    let mut platform = PlatformPolicy::default();
    platform.apps.insert(
        "test1".to_string(),
        AppPolicy {
            update_mode: Some(UpdateMode::Disabled),
            ..AppPolicy::default()
        },
    );
    let h = Harness::new(PolicyResolver::new(platform, None, false), "100.0.0.0");
    h.register("test1", "1.0");
    h.register("test2", "1.0");
    h.respond(vec![no_update("test2")]);

    let report = h
        .orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();

    assert_eq!(report.outcome_for("test1"), Some(&AppOutcome::PolicyDisabled));
    assert_eq!(report.outcome_for("test2"), Some(&AppOutcome::UpToDate));
    for batch in h.client.checks_seen() {
        assert!(batch.iter().all(|r| r.app_id != "test1"));
    }
    assert!(h.client.pings_seen().iter().all(|p| p.app_id != "test1"));
    h.client.assert_exhausted();
}

// A policy-forced app that is not yet registered gets registered and
// silently installed during the wake.
#[tokio::test]
async fn forced_install_registers_and_installs_missing_app() {
    let mut platform = PlatformPolicy::default();
    platform.apps.insert(
        "mandatory".to_string(),
        AppPolicy {
            install_mode: Some(InstallMode::Forced),
            ..AppPolicy::default()
        },
    );
    let h = Harness::new(PolicyResolver::new(platform, None, false), "100.0.0.0");
    let payload = h.fetcher.stage("mandatory.crx", b"mandatory installer");
    h.respond(vec![offer("mandatory", "1", payload)]);

    let report = h
        .orchestrator
        .run_cycle(WakeReason::Scheduled)
        .await
        .unwrap();

    assert_eq!(
        report.outcome_for("mandatory"),
        Some(&AppOutcome::Applied {
            version: v("1"),
            fresh_install: true
        })
    );
    let stored = h.registrations().get("mandatory").unwrap().unwrap();
    assert_eq!(stored.version, v("1"));
    assert_eq!(install_pings(&h.client.pings_seen()).len(), 1);
    h.client.assert_exhausted();
}

// Scenario: an installer blocked by a concurrent install reports the
// dedicated code and does not advance the registration; the retried
// wake does.
#[tokio::test]
async fn already_running_installer_retries_on_next_wake() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");
    h.register("test", "0.1");

    let payload = h.fetcher.stage("test.crx", b"test installer");
    h.respond(vec![offer("test", "1", payload.clone())]);
    h.runner.expect_outcome(
        "test",
        InstallerOutcome {
            result: InstallerResult::SystemError,
            code: codes::ERROR_INSTALL_ALREADY_RUNNING,
            extra_code: 0,
            message: String::new(),
        },
    );

    let first = h
        .orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    assert_eq!(
        first.outcome_for("test"),
        Some(&AppOutcome::Failed {
            category: ErrorCategory::Install,
            code: codes::ERROR_INSTALL_ALREADY_RUNNING,
        })
    );
    assert_eq!(
        h.registrations().get("test").unwrap().unwrap().version,
        v("0.1")
    );
    let failure = h
        .client
        .pings_seen()
        .into_iter()
        .find(|p| p.event_result == 0)
        .unwrap();
    assert_eq!(failure.error_code, codes::ERROR_INSTALL_ALREADY_RUNNING);
    assert_eq!(failure.error_category, ErrorCategory::Install);

    // Next wake: the blocked installer has gone away.
    h.respond(vec![offer("test", "1", payload)]);
    let second = h
        .orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    assert_eq!(
        second.outcome_for("test"),
        Some(&AppOutcome::Applied {
            version: v("1"),
            fresh_install: false
        })
    );
    assert_eq!(
        h.registrations().get("test").unwrap().unwrap().version,
        v("1")
    );
    h.client.assert_exhausted();
}

// A second scheduled wake inside the check period performs no network
// exchange; after the period it checks again.
#[tokio::test]
async fn scheduled_wakes_debounce_within_check_period() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");
    h.register("test", "1.0");

    h.respond(vec![no_update("test")]);
    let first = h
        .orchestrator
        .run_cycle(WakeReason::Scheduled)
        .await
        .unwrap();
    assert!(first.skipped.is_none());

    let second = h
        .orchestrator
        .run_cycle(WakeReason::Scheduled)
        .await
        .unwrap();
    assert_eq!(second.skipped, Some(SkipReason::Debounced));

    // On-demand wakes bypass the debounce.
    h.respond(vec![no_update("test")]);
    let on_demand = h
        .orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    assert!(on_demand.skipped.is_none());

    // Past the check period, scheduled wakes exchange again.
    h.clock.advance(Duration::from_secs(6 * 60 * 60));
    h.respond(vec![no_update("test")]);
    let third = h
        .orchestrator
        .run_cycle(WakeReason::Scheduled)
        .await
        .unwrap();
    assert!(third.skipped.is_none());
    h.client.assert_exhausted();
}

/// A client that parks the first exchange until released, to hold a
/// cycle in flight.
struct ParkedClient {
    release: tokio::sync::Semaphore,
}

#[async_trait]
impl UpdateClient for ParkedClient {
    async fn check(
        &self,
        _request_id: &str,
        apps: Vec<UpdateCheckRequest>,
    ) -> Result<Vec<AppCheckResult>, ClientError> {
        let permit = self.release.acquire().await;
        drop(permit);
        Ok(apps.iter().map(|r| no_update(&r.app_id)).collect())
    }

    async fn ping(
        &self,
        _request_id: &str,
        _events: Vec<PingEvent>,
    ) -> Result<(), ClientError> {
        Ok(())
    }
}

// Near-simultaneous wakes coalesce into one in-flight cycle.
#[tokio::test]
async fn concurrent_wakes_coalesce() {
    let store = Arc::new(MemoryStore::new());
    let lock = Arc::new(MemorySetupLock::new());
    let client = Arc::new(ParkedClient {
        release: tokio::sync::Semaphore::new(0),
    });
    let registrations = RegistrationTable::new(store.clone());
    {
        let guard = lock.acquire(Duration::from_secs(1)).unwrap();
        registrations
            .register(&guard, Registration::new("test", v("1.0")), false)
            .unwrap();
    }
    let orchestrator = Arc::new(Orchestrator::new(OrchestratorContext {
        registrations,
        versions: VersionStore::new(store.clone()),
        prefs: InstancePrefs::new(store.clone()),
        policy: Harness::default_policy(),
        lock,
        client: client.clone(),
        fetcher: Arc::new(StagedFetcher::new()),
        runner: Arc::new(ScriptedRunner::new()),
        existence: Arc::new(AlwaysOwned),
        clock: Arc::new(ManualClock::new(Utc::now())),
        own_version: v("100.0.0.0"),
    }));

    let in_flight = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run_cycle(WakeReason::OnDemand).await }
    });
    // Let the first cycle reach its parked exchange.
    tokio::task::yield_now().await;

    let coalesced = orchestrator.run_cycle(WakeReason::OnDemand).await.unwrap();
    assert_eq!(coalesced.skipped, Some(SkipReason::Coalesced));

    client.release.add_permits(1);
    let report = in_flight.await.unwrap().unwrap();
    assert!(report.skipped.is_none());
    assert_eq!(report.outcome_for("test"), Some(&AppOutcome::UpToDate));
}

// The updater checks for itself only once the EULA is accepted, and
// never sends an uninstall ping before acceptance.
#[tokio::test]
async fn eula_gates_self_update_and_uninstall_ping() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");
    h.register("test", "1.0");

    h.respond(vec![no_update("test")]);
    h.orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    assert!(h.client.checks_seen()[0]
        .iter()
        .all(|r| r.app_id != UPDATER_APP_ID));

    h.orchestrator.send_uninstall_ping().await.unwrap();
    assert!(h.client.pings_seen().is_empty());

    {
        let guard = h.lock.acquire(Duration::from_secs(1)).unwrap();
        h.prefs().accept_eula(&guard).unwrap();
    }
    h.respond(vec![no_update("test"), no_update(UPDATER_APP_ID)]);
    h.orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    assert!(h.client.checks_seen()[1]
        .iter()
        .any(|r| r.app_id == UPDATER_APP_ID));

    h.orchestrator.send_uninstall_ping().await.unwrap();
    let pings = h.client.pings_seen();
    let uninstall = pings
        .iter()
        .find(|p| p.event_type == EventType::Uninstall)
        .unwrap();
    assert_eq!(uninstall.previous_version, Some(v("100.0.0.0")));
    h.client.assert_exhausted();
}

// An instance with nothing registered counts wakes and asks to be
// uninstalled once the grace period is exhausted.
#[tokio::test]
async fn unused_instance_uninstalls_after_grace_period() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");

    let mut last = None;
    for _ in 0..SERVER_STARTS_UNINSTALL_THRESHOLD {
        last = Some(
            h.orchestrator
                .run_cycle(WakeReason::OnDemand)
                .await
                .unwrap(),
        );
    }
    assert!(last.unwrap().self_uninstall);

    // Registering a product resets the counter and protects the
    // instance again.
    let payload = h.fetcher.stage("test.crx", b"bytes");
    h.respond(vec![offer("test", "1", payload)]);
    let report = h
        .orchestrator
        .install_app(Registration::new("test", v("0.1")))
        .await
        .unwrap();
    assert!(!report.self_uninstall);
    assert_eq!(h.prefs().load().unwrap().server_starts, 0);
    h.client.assert_exhausted();
}

// Consumed active bits ride along as `ad: -1` and report exactly once.
#[tokio::test]
async fn active_bits_report_once_with_unknown_day_stamp() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");
    h.register("test", "1.0");
    {
        let guard = h.lock.acquire(Duration::from_secs(1)).unwrap();
        h.registrations().set_active_bit(&guard, "test").unwrap();
    }

    h.respond(vec![no_update("test")]);
    h.orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    let pings = h.client.pings_seen();
    let active: Vec<_> = pings
        .iter()
        .filter(|p| p.days_since_active == Some(-1))
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].app_id, "test");

    h.respond(vec![no_update("test")]);
    h.orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    assert_eq!(
        h.client
            .pings_seen()
            .iter()
            .filter(|p| p.days_since_active == Some(-1))
            .count(),
        1
    );
    h.client.assert_exhausted();
}

// A whole-batch exchange failure isolates into per-app failures and
// the next wake recovers.
#[tokio::test]
async fn transient_exchange_failure_is_retried_once_then_isolated() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");
    h.register("test", "1.0");

    // Both the first attempt and its single fallback retry fail.
    h.client
        .expect_exchange(ScriptedExchange::TransientFailure);
    h.client
        .expect_exchange(ScriptedExchange::TransientFailure);
    let report = h
        .orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    assert_eq!(
        report.outcome_for("test"),
        Some(&AppOutcome::Failed {
            category: ErrorCategory::UpdateCheck,
            code: 0
        })
    );
    assert_eq!(
        h.registrations().get("test").unwrap().unwrap().version,
        v("1.0")
    );

    h.respond(vec![no_update("test")]);
    let recovered = h
        .orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    assert_eq!(recovered.outcome_for("test"), Some(&AppOutcome::UpToDate));
    h.client.assert_exhausted();
}

// Cancellation leaves the registration untouched and reports the
// cancelled outcome.
#[tokio::test]
async fn cancelled_app_keeps_its_registration() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");
    h.register("test", "0.1");
    let payload = h.fetcher.stage("test.crx", b"bytes");
    h.respond(vec![offer("test", "1", payload)]);

    h.orchestrator.cancel_set().cancel("test");
    let report = h
        .orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();

    assert_eq!(report.outcome_for("test"), Some(&AppOutcome::Cancelled));
    assert_eq!(
        h.registrations().get("test").unwrap().unwrap().version,
        v("0.1")
    );
    assert!(h.runner.installs_seen().is_empty());

    // The wire distinguishes cancellation from a genuine failure.
    let pings = h.client.pings_seen();
    let cancelled = pings.iter().find(|p| p.app_id == "test").unwrap();
    assert_eq!(cancelled.event_result, 0);
    assert_eq!(cancelled.error_category, ErrorCategory::Cancelled);
    assert_eq!(cancelled.error_code, 0);
    h.client.assert_exhausted();
}

// A failed ping puts consumed active bits back, so activity is still
// reported by the next successful cycle.
#[tokio::test]
async fn failed_ping_restores_active_bits() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");
    h.register("test", "1.0");
    {
        let guard = h.lock.acquire(Duration::from_secs(1)).unwrap();
        h.registrations().set_active_bit(&guard, "test").unwrap();
    }

    h.client.fail_pings(true);
    h.respond(vec![no_update("test")]);
    let report = h
        .orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    assert_eq!(report.pings_sent, 0);
    assert!(h.client.pings_seen().is_empty());
    assert!(h.registrations().get("test").unwrap().unwrap().active_bit);

    h.client.fail_pings(false);
    h.respond(vec![no_update("test")]);
    h.orchestrator
        .run_cycle(WakeReason::OnDemand)
        .await
        .unwrap();
    let active: Vec<_> = h
        .client
        .pings_seen()
        .into_iter()
        .filter(|p| p.days_since_active == Some(-1))
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].app_id, "test");
    h.client.assert_exhausted();
}

// A wholly failed exchange does not arm the debounce: the next
// scheduled wake checks again without waiting out the period.
#[tokio::test]
async fn failed_exchange_does_not_arm_debounce() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");
    h.register("test", "1.0");

    h.client.expect_exchange(ScriptedExchange::TransientFailure);
    h.client.expect_exchange(ScriptedExchange::TransientFailure);
    let failed = h
        .orchestrator
        .run_cycle(WakeReason::Scheduled)
        .await
        .unwrap();
    assert!(failed.skipped.is_none());
    assert_eq!(
        failed.outcome_for("test"),
        Some(&AppOutcome::Failed {
            category: ErrorCategory::UpdateCheck,
            code: 0
        })
    );

    // No clock advance: the retry happens on the very next wake.
    h.respond(vec![no_update("test")]);
    let retried = h
        .orchestrator
        .run_cycle(WakeReason::Scheduled)
        .await
        .unwrap();
    assert!(retried.skipped.is_none());
    assert_eq!(retried.outcome_for("test"), Some(&AppOutcome::UpToDate));
    h.client.assert_exhausted();
}

// The registration's install-data index rides the update check for
// the app.
#[tokio::test]
async fn install_data_index_rides_the_update_check() {
    let h = Harness::new(Harness::default_policy(), "100.0.0.0");
    let payload = h.fetcher.stage("test.crx", b"test installer");
    h.respond(vec![offer("test", "1", payload)]);

    let mut registration = Registration::new("test", v("0.1"));
    registration.install_data_index = Some("verboselogging".to_string());
    h.orchestrator.install_app(registration).await.unwrap();

    let checks = h.client.checks_seen();
    let request = checks[0].iter().find(|r| r.app_id == "test").unwrap();
    assert_eq!(
        request.install_data_index.as_deref(),
        Some("verboselogging")
    );
    h.client.assert_exhausted();
}

// A qualification check that starts from the reserved app id and start
// version is what goes over the wire.
#[tokio::test]
async fn qualification_exchange_uses_reserved_app() {
    let h = Harness::new(Harness::default_policy(), "2.0");
    let versions = VersionStore::new(h.store.clone());
    {
        let guard = h.lock.acquire(Duration::from_secs(1)).unwrap();
        versions.register_candidate(&guard, &v("2.0"), "/v/2.0").unwrap();
    }
    let qualifier = QualificationEngine::new(
        versions,
        h.lock.clone(),
        h.client.clone(),
        h.fetcher.clone(),
        h.runner.clone(),
    );
    let payload = h.fetcher.stage("qual.crx", b"qualification payload");
    h.respond(vec![offer(QUALIFICATION_APP_ID, "0.2", payload)]);

    qualifier.qualify(&v("2.0")).await.unwrap();

    let checks = h.client.checks_seen();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0][0].app_id, QUALIFICATION_APP_ID);
    assert_eq!(checks[0][0].version, v(QUALIFICATION_START_VERSION));
    h.client.assert_exhausted();
}
