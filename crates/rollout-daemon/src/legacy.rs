//! Synchronous shim for the legacy control surface.
//!
//! Older integrations drive the updater through a blocking, per-app
//! call interface with a numeric state enumeration. The shim owns no
//! business logic: it runs one on-demand orchestrator cycle on the
//! runtime handle it was given and translates the app's outcome into
//! the legacy state values, which are wire-stable and must never be
//! renumbered.

use std::sync::Arc;

use rollout_core::installer::ErrorCategory;
use rollout_core::protocol::{EventType, PingEvent};
use rollout_core::registration::RegistrationTable;
use rollout_core::version::Version;
use thiserror::Error;
use tracing::{info, warn};

use crate::client::UpdateClient;
use crate::orchestrator::{AppOutcome, Orchestrator, WakeReason};

/// Legacy state enumeration, numbered exactly as the historic ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LegacyState {
    /// STATE_INIT
    Init = 1,
    /// STATE_CHECKING_FOR_UPDATE
    CheckingForUpdate = 3,
    /// STATE_UPDATE_AVAILABLE
    UpdateAvailable = 4,
    /// STATE_DOWNLOADING
    Downloading = 7,
    /// STATE_INSTALLING
    Installing = 13,
    /// STATE_INSTALL_COMPLETE
    InstallComplete = 14,
    /// STATE_NO_UPDATE
    NoUpdate = 16,
    /// STATE_ERROR
    Error = 17,
}

/// Outcome of one legacy call, before translation to the ABI values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyCallResult {
    /// An update applied; the app is now at `version`.
    Applied {
        /// The version installed.
        version: Version,
    },
    /// The server had nothing newer.
    NoUpdate,
    /// Updates for the app are disabled by policy.
    Disabled,
    /// The attempt failed with `code`.
    Failed {
        /// Error code for the legacy caller.
        code: i32,
    },
}

impl LegacyCallResult {
    /// The legacy state value for this result.
    #[must_use]
    pub const fn state(&self) -> LegacyState {
        match self {
            Self::Applied { .. } => LegacyState::InstallComplete,
            Self::NoUpdate => LegacyState::NoUpdate,
            Self::Disabled | Self::Failed { .. } => LegacyState::Error,
        }
    }

    /// The error code reported alongside the state, 0 when none.
    #[must_use]
    pub const fn error_code(&self) -> i32 {
        match self {
            Self::Failed { code } => *code,
            _ => 0,
        }
    }
}

/// Shim errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LegacyError {
    /// The app is not registered.
    #[error("app {0} is not registered")]
    UnknownApp(String),

    /// The app has no command with that id.
    #[error("app {app_id} has no command {command_id}")]
    UnknownCommand {
        /// The app looked up.
        app_id: String,
        /// The command id requested.
        command_id: String,
    },

    /// The command process could not be started.
    #[error("command failed to start: {0}")]
    Spawn(#[from] std::io::Error),

    /// The underlying cycle failed before producing an outcome.
    #[error(transparent)]
    Cycle(#[from] crate::errors::UpdateError),
}

/// Blocking adapter over the orchestrator for legacy callers.
///
/// Must be called from a thread that is not running the async
/// runtime; calls block on the provided handle.
pub struct LegacyShim {
    orchestrator: Arc<Orchestrator>,
    registrations: RegistrationTable,
    client: Arc<dyn UpdateClient>,
    runtime: tokio::runtime::Handle,
}

impl LegacyShim {
    /// Shim over `orchestrator`, reporting app-command pings through
    /// `client`.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        registrations: RegistrationTable,
        client: Arc<dyn UpdateClient>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            orchestrator,
            registrations,
            client,
            runtime,
        }
    }

    /// Run one on-demand update for `app_id` and block until done.
    ///
    /// # Errors
    ///
    /// Returns [`LegacyError`] if the app is unknown or the cycle
    /// fails before producing a per-app outcome.
    pub fn update_app(&self, app_id: &str) -> Result<LegacyCallResult, LegacyError> {
        if self
            .registrations
            .get(app_id)
            .map_err(map_reg_err)?
            .is_none()
        {
            return Err(LegacyError::UnknownApp(app_id.to_string()));
        }
        let report = self
            .runtime
            .block_on(self.orchestrator.run_cycle(WakeReason::OnDemand))?;
        let result = match report.outcome_for(app_id) {
            Some(AppOutcome::Applied { version, .. }) => LegacyCallResult::Applied {
                version: version.clone(),
            },
            Some(AppOutcome::UpToDate) => LegacyCallResult::NoUpdate,
            Some(AppOutcome::PolicyDisabled) => LegacyCallResult::Disabled,
            Some(AppOutcome::Failed { code, .. }) => {
                LegacyCallResult::Failed { code: *code }
            },
            Some(AppOutcome::Cancelled) => LegacyCallResult::Failed { code: 0 },
            // A coalesced or self-only cycle produced nothing for this
            // app; the legacy surface reports that as no update.
            _ => LegacyCallResult::NoUpdate,
        };
        info!(app_id, state = ?result.state(), "legacy update call complete");
        Ok(result)
    }

    /// Run the registered command `command_id` for `app_id`, blocking
    /// until it exits. The exit code is returned and reported as an
    /// app-command ping.
    ///
    /// # Errors
    ///
    /// Returns [`LegacyError`] if the app or command is unknown or the
    /// process cannot start.
    pub fn run_app_command(
        &self,
        app_id: &str,
        command_id: &str,
    ) -> Result<i32, LegacyError> {
        let registration = self
            .registrations
            .get(app_id)
            .map_err(map_reg_err)?
            .ok_or_else(|| LegacyError::UnknownApp(app_id.to_string()))?;
        let command_line = registration
            .app_commands
            .get(command_id)
            .ok_or_else(|| LegacyError::UnknownCommand {
                app_id: app_id.to_string(),
                command_id: command_id.to_string(),
            })?;

        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or_else(|| LegacyError::UnknownCommand {
            app_id: app_id.to_string(),
            command_id: command_id.to_string(),
        })?;
        let status = std::process::Command::new(program)
            .args(parts)
            .status()?;
        let code = status.code().unwrap_or(-1);

        // The exit code is the command's own; no updater pipeline
        // category applies.
        let event = if code == 0 {
            PingEvent::success(app_id, EventType::AppCommandComplete)
        } else {
            PingEvent::failure(
                app_id,
                EventType::AppCommandComplete,
                ErrorCategory::None,
                code,
            )
        };
        let request_id = format!("appcommand-{app_id}-{command_id}");
        if let Err(err) = self
            .runtime
            .block_on(self.client.ping(&request_id, vec![event]))
        {
            warn!(error = %err, "app command ping failed");
        }
        Ok(code)
    }
}

fn map_reg_err(err: rollout_core::registration::RegistrationError) -> LegacyError {
    match err {
        rollout_core::registration::RegistrationError::Store(e) => {
            LegacyError::Cycle(crate::errors::UpdateError::Store(e))
        },
    }
}
