//! rollout - command-line entry points for the updater.
//!
//! Every invocation builds the full control-loop stack over the
//! scope's data directory, runs one operation, and exits. Long-lived
//! scheduling lives outside (launchd/systemd/task scheduler invokes
//! `wake` periodically). Exit codes consumed by wrapping scripts are
//! stable and must not be renumbered.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollout_core::lock::{FileSetupLock, LockError, SetupLock};
use rollout_core::policy::{CloudPolicySet, PlatformPolicy, PolicyResolver};
use rollout_core::prefs::InstancePrefs;
use rollout_core::registration::{FsExistenceChecker, Registration, RegistrationTable};
use rollout_core::store::{JsonFileStore, PersistentStore};
use rollout_core::version::Version;
use rollout_core::versions::VersionStore;
use rollout_daemon::client::HttpUpdateClient;
use rollout_daemon::fetch::{CachingFetcher, HttpPayloadFetcher};
use rollout_daemon::orchestrator::{
    Orchestrator, OrchestratorContext, ProcessInstallRunner, WakeReason,
};
use rollout_daemon::qualification::QualificationEngine;
use rollout_daemon::self_manage::{
    FsLivenessProbe, SelfAction, SelfManagementController,
};
use rollout_daemon::SystemClock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Successful exit.
const EXIT_OK: i32 = 0;
/// Invalid command line (also what clap exits with on parse failure).
const EXIT_INVALID_OPTION: i32 = 2;
/// The setup lock could not be acquired.
const EXIT_LOCK_TIMEOUT: i32 = 3;
/// The wake had nothing to do for this instance.
const EXIT_IDLE: i32 = 4;

const SETUP_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// rollout - application update management
#[derive(Parser, Debug)]
#[command(name = "rollout")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for this scope's persistent state
    #[arg(long, default_value = ".rollout")]
    data_dir: PathBuf,

    /// Update server endpoint
    #[arg(long, default_value = "https://update.rollout.invalid/service")]
    server: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the updater, optionally installing an app in the same
    /// run
    Install {
        /// App to install alongside the updater
        #[arg(long)]
        app_id: Option<String>,

        /// Version the app installer reports before updating
        #[arg(long, default_value = "0.1")]
        version: String,

        /// Index into the server-side install data for the app
        #[arg(long)]
        install_data_index: Option<String>,
    },

    /// Uninstall this instance after reporting the uninstall ping
    Uninstall,

    /// Periodic wake: self-manage, then run one background cycle
    Wake,

    /// Wake every installed version's instance
    WakeAll,

    /// Wake only if this instance owns activity
    WakeActive,

    /// Run a foreground update for one app on behalf of its installer
    Handoff {
        /// App to update
        app_id: String,
    },

    /// Register an app without installing anything
    RegisterApp {
        /// App id
        app_id: String,

        /// Installed version
        #[arg(long)]
        version: String,

        /// Tag / additional-parameters string
        #[arg(long, default_value = "")]
        ap: String,

        /// Brand code
        #[arg(long, default_value = "")]
        brand: String,

        /// Path attesting the product is installed
        #[arg(long, default_value = "")]
        existence_checker_path: String,

        /// Index into the server-side install data for the app
        #[arg(long)]
        install_data_index: Option<String>,
    },

    /// Run one foreground cycle for every registered app
    UpdateAll,
}

struct Stack {
    store: Arc<JsonFileStore>,
    lock: Arc<FileSetupLock>,
    orchestrator: Arc<Orchestrator>,
    controller: SelfManagementController,
    own_version: Version,
}

fn build_stack(cli: &Cli) -> Result<Stack> {
    let own_version = Version::parse(env!("CARGO_PKG_VERSION"))
        .context("package version is not a valid wire version")?;
    let store = Arc::new(
        JsonFileStore::open(&cli.data_dir)
            .with_context(|| format!("opening data dir {}", cli.data_dir.display()))?,
    );
    let lock = Arc::new(FileSetupLock::new(cli.data_dir.join("setup.lock")));

    let persistent: Arc<dyn PersistentStore> = store.clone();
    let platform: PlatformPolicy = persistent
        .load_doc("policy")
        .context("reading platform policy")?
        .unwrap_or_default();
    let cloud: Option<CloudPolicySet> = persistent
        .load_doc("cloud_policy")
        .context("reading cloud policy")?;
    let policy = PolicyResolver::new(platform, cloud, cfg!(not(windows)));

    let http = reqwest::Client::new();
    let client = Arc::new(HttpUpdateClient::new(http.clone(), cli.server.clone()));
    let fetcher = Arc::new(CachingFetcher::new(Arc::new(HttpPayloadFetcher::new(
        http,
        cli.data_dir.join("downloads"),
    ))));
    let runner = Arc::new(ProcessInstallRunner);

    let orchestrator = Arc::new(Orchestrator::new(OrchestratorContext {
        registrations: RegistrationTable::new(store.clone()),
        versions: VersionStore::new(store.clone()),
        prefs: InstancePrefs::new(store.clone()),
        policy,
        lock: lock.clone(),
        client: client.clone(),
        fetcher: fetcher.clone(),
        runner: runner.clone(),
        existence: Arc::new(FsExistenceChecker),
        clock: Arc::new(SystemClock),
        own_version: own_version.clone(),
    }));

    let qualifier = QualificationEngine::new(
        VersionStore::new(store.clone()),
        lock.clone(),
        client,
        fetcher,
        runner,
    );
    let controller = SelfManagementController::new(
        VersionStore::new(store.clone()),
        InstancePrefs::new(store.clone()),
        lock.clone(),
        qualifier,
        Arc::new(FsLivenessProbe),
        own_version.clone(),
    );

    Ok(Stack {
        store,
        lock,
        orchestrator,
        controller,
        own_version,
    })
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(LockError::Timeout(_)) = cause.downcast_ref::<LockError>() {
            return EXIT_LOCK_TIMEOUT;
        }
    }
    1
}

async fn wake(stack: &Stack, require_active: bool) -> Result<i32> {
    let action = stack.controller.step().await?;
    tracing::info!(action = ?action, "self-management step");
    match action {
        SelfAction::HandOff(newer) => {
            tracing::info!(%newer, "standing down for newer instance");
            return Ok(EXIT_IDLE);
        },
        SelfAction::MarkedUninstalling => return Ok(EXIT_IDLE),
        _ => {},
    }

    if require_active {
        let guard = stack.lock.acquire(SETUP_LOCK_TIMEOUT)?;
        let versions = VersionStore::new(stack.store.clone());
        let active = versions
            .active(&guard)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        if active.map(|e| e.version) != Some(stack.own_version.clone()) {
            return Ok(EXIT_IDLE);
        }
    }

    let report = stack.orchestrator.run_cycle(WakeReason::Scheduled).await?;
    if report.self_uninstall {
        stack.orchestrator.send_uninstall_ping().await?;
        tracing::info!("no products registered; instance retiring");
    }
    Ok(EXIT_OK)
}

async fn run(cli: Cli) -> Result<i32> {
    let stack = build_stack(&cli)?;
    match cli.command {
        Commands::Install {
            app_id,
            version,
            install_data_index,
        } => {
            {
                let guard = stack.lock.acquire(SETUP_LOCK_TIMEOUT)?;
                let versions = VersionStore::new(stack.store.clone());
                versions
                    .register_candidate(
                        &guard,
                        &stack.own_version,
                        &std::env::current_exe()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default(),
                    )
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                InstancePrefs::new(stack.store.clone()).reset_server_starts(&guard)?;
            }
            if let Some(app_id) = app_id {
                let version =
                    Version::parse(&version).context("invalid --version")?;
                let mut registration = Registration::new(&app_id, version);
                registration.install_data_index = install_data_index;
                let report = stack.orchestrator.install_app(registration).await?;
                tracing::info!(request_id = %report.request_id, "install cycle complete");
            }
            Ok(EXIT_OK)
        },
        Commands::Uninstall => {
            stack.orchestrator.send_uninstall_ping().await?;
            let guard = stack.lock.acquire(SETUP_LOCK_TIMEOUT)?;
            let versions = VersionStore::new(stack.store.clone());
            versions
                .remove(&guard, &stack.own_version)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            Ok(EXIT_OK)
        },
        Commands::Wake | Commands::WakeAll => wake(&stack, false).await,
        Commands::WakeActive => wake(&stack, true).await,
        Commands::Handoff { app_id } => {
            let report = stack.orchestrator.run_cycle(WakeReason::OnDemand).await?;
            match report.outcome_for(&app_id) {
                Some(outcome) => {
                    tracing::info!(app_id, outcome = ?outcome, "handoff complete");
                    Ok(EXIT_OK)
                },
                None => {
                    tracing::warn!(app_id, "handoff found no registration for app");
                    Ok(EXIT_INVALID_OPTION)
                },
            }
        },
        Commands::RegisterApp {
            app_id,
            version,
            ap,
            brand,
            existence_checker_path,
            install_data_index,
        } => {
            let version = Version::parse(&version).context("invalid --version")?;
            let mut registration = Registration::new(&app_id, version);
            registration.ap = ap;
            registration.brand_code = brand;
            registration.existence_checker_path = existence_checker_path;
            registration.install_data_index = install_data_index;
            let guard = stack.lock.acquire(SETUP_LOCK_TIMEOUT)?;
            RegistrationTable::new(stack.store.clone())
                .register(&guard, registration, false)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            InstancePrefs::new(stack.store.clone()).reset_server_starts(&guard)?;
            Ok(EXIT_OK)
        },
        Commands::UpdateAll => {
            let report = stack.orchestrator.run_cycle(WakeReason::OnDemand).await?;
            let failed = report
                .apps
                .iter()
                .filter(|a| {
                    matches!(
                        a.outcome,
                        rollout_daemon::orchestrator::AppOutcome::Failed { .. }
                    )
                })
                .count();
            tracing::info!(
                apps = report.apps.len(),
                failed,
                "update-all complete"
            );
            Ok(if failed == 0 { EXIT_OK } else { 1 })
        },
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    match runtime.block_on(run(cli)) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "operation failed");
            std::process::exit(exit_code_for(&err));
        },
    }
}
