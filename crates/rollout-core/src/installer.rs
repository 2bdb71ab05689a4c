//! Installer exit interpretation.
//!
//! Application installers report their outcome through a small result
//! record: a result kind, an exit code, and an optional message. This
//! module maps that record onto a single success/failure verdict plus
//! the error category used for ping reporting.

use serde::{Deserialize, Serialize};

/// Well-known installer and setup error codes.
pub mod codes {
    /// Installer finished but a reboot is required before the new
    /// version is fully in place. Treated as success with a caveat.
    pub const ERROR_SUCCESS_REBOOT_REQUIRED: i32 = 3010;

    /// Another installation is already in progress. The attempt is
    /// reported in the install category and must not advance the
    /// registration; the next wake retries.
    pub const ERROR_INSTALL_ALREADY_RUNNING: i32 = 1618;

    /// Generic code substituted when an installer reports a custom
    /// error without a code of its own.
    pub const ERROR_APPLICATION_INSTALLER_FAILED: i32 = 0x0201;

    /// The setup lock could not be acquired within its timeout.
    pub const ERROR_FAILED_TO_LOCK_SETUP_MUTEX: i32 = 0x0202;
}

/// How the installer reported its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum InstallerResult {
    /// Explicit success, regardless of exit code.
    Success,
    /// Installer-defined error; the exit code is opaque.
    CustomError,
    /// MSI error code.
    MsiError,
    /// OS error code.
    SystemError,
    /// Interpret the process exit code directly (zero is success).
    ExitCode,
}

impl From<InstallerResult> for u32 {
    fn from(value: InstallerResult) -> Self {
        match value {
            InstallerResult::Success => 0,
            InstallerResult::CustomError => 1,
            InstallerResult::MsiError => 2,
            InstallerResult::SystemError => 3,
            InstallerResult::ExitCode => 4,
        }
    }
}

impl TryFrom<u32> for InstallerResult {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, String> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::CustomError),
            2 => Ok(Self::MsiError),
            3 => Ok(Self::SystemError),
            4 => Ok(Self::ExitCode),
            other => Err(format!("unknown installer result {other}")),
        }
    }
}

/// Error category attached to outcome pings. The numeric wire values
/// are stable; cancellation is its own category so the server can
/// tell it apart from a genuine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ErrorCategory {
    /// No error.
    #[default]
    None,
    /// Payload download failed.
    Download,
    /// Updater-internal service failure.
    Service,
    /// Install preconditions failed (lock, disk, already running).
    Install,
    /// The application installer itself failed.
    Installer,
    /// The update-check exchange failed.
    UpdateCheck,
    /// The operation was cancelled.
    Cancelled,
}

impl From<ErrorCategory> for u32 {
    fn from(value: ErrorCategory) -> Self {
        match value {
            ErrorCategory::None => 0,
            ErrorCategory::Download => 1,
            ErrorCategory::Service => 2,
            ErrorCategory::Install => 3,
            ErrorCategory::Installer => 4,
            ErrorCategory::UpdateCheck => 5,
            ErrorCategory::Cancelled => 6,
        }
    }
}

impl TryFrom<u32> for ErrorCategory {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, String> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Download),
            2 => Ok(Self::Service),
            3 => Ok(Self::Install),
            4 => Ok(Self::Installer),
            5 => Ok(Self::UpdateCheck),
            6 => Ok(Self::Cancelled),
            other => Err(format!("unknown error category {other}")),
        }
    }
}

/// Raw outcome record produced by running an installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerOutcome {
    /// How to interpret `code`.
    pub result: InstallerResult,
    /// Exit or error code, meaning per `result`.
    #[serde(default)]
    pub code: i32,
    /// Extra diagnostic code passed through to pings.
    #[serde(default)]
    pub extra_code: i32,
    /// Human-readable text from the installer, if any.
    #[serde(default)]
    pub message: String,
}

/// Interpreted verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallVerdict {
    /// The install completed.
    Success {
        /// A reboot is needed before the new version is fully live.
        reboot_required: bool,
    },
    /// The install failed.
    Failure {
        /// Category for ping reporting.
        category: ErrorCategory,
        /// Error code for ping reporting.
        code: i32,
        /// Extra diagnostic code.
        extra_code: i32,
        /// Installer-provided text, possibly empty.
        message: String,
    },
}

impl InstallVerdict {
    /// Whether the registration may advance to the new version.
    #[must_use]
    pub const fn advances_registration(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl InstallerOutcome {
    /// A plain successful outcome.
    #[must_use]
    pub fn success() -> Self {
        Self {
            result: InstallerResult::Success,
            code: 0,
            extra_code: 0,
            message: String::new(),
        }
    }

    /// An outcome interpreting the raw process exit code.
    #[must_use]
    pub fn from_exit_code(code: i32) -> Self {
        Self {
            result: InstallerResult::ExitCode,
            code,
            extra_code: 0,
            message: String::new(),
        }
    }

    /// Interpret this outcome into a verdict.
    #[must_use]
    pub fn interpret(&self) -> InstallVerdict {
        match self.result {
            InstallerResult::Success => InstallVerdict::Success {
                reboot_required: self.code == codes::ERROR_SUCCESS_REBOOT_REQUIRED,
            },
            InstallerResult::ExitCode if self.code == 0 => {
                InstallVerdict::Success {
                    reboot_required: false,
                }
            },
            InstallerResult::ExitCode
                if self.code == codes::ERROR_SUCCESS_REBOOT_REQUIRED =>
            {
                InstallVerdict::Success {
                    reboot_required: true,
                }
            },
            InstallerResult::CustomError => InstallVerdict::Failure {
                category: ErrorCategory::Installer,
                code: if self.code == 0 {
                    codes::ERROR_APPLICATION_INSTALLER_FAILED
                } else {
                    self.code
                },
                extra_code: self.extra_code,
                message: self.message.clone(),
            },
            InstallerResult::MsiError | InstallerResult::SystemError
                if self.code == codes::ERROR_INSTALL_ALREADY_RUNNING =>
            {
                InstallVerdict::Failure {
                    category: ErrorCategory::Install,
                    code: codes::ERROR_INSTALL_ALREADY_RUNNING,
                    extra_code: self.extra_code,
                    message: self.message.clone(),
                }
            },
            InstallerResult::MsiError
            | InstallerResult::SystemError
            | InstallerResult::ExitCode => InstallVerdict::Failure {
                category: ErrorCategory::Installer,
                code: self.code,
                extra_code: self.extra_code,
                message: self.message.clone(),
            },
        }
    }
}
