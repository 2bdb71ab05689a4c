//! Daemon-level error taxonomy.
//!
//! Per-app failures are isolated: a variant here describes why one
//! app's processing stopped, never why the whole batch should. The
//! orchestrator records the failure, reports it, and moves on.

use rollout_core::installer::ErrorCategory;
use rollout_core::lock::LockError;
use rollout_core::protocol::ProtocolError;
use rollout_core::store::StoreError;
use thiserror::Error;

/// Why processing one app (or one cycle step) failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpdateError {
    /// The setup lock could not be acquired. The mutation is aborted
    /// and retried on the next wake.
    #[error(transparent)]
    LockTimeout(#[from] LockError),

    /// A transient network failure that survived the single fallback
    /// retry.
    #[error("network failure: {0}")]
    NetworkTransient(String),

    /// A definitive protocol-level failure. Never retried within the
    /// same cycle.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The installer reported failure.
    #[error("installer failed: category {category:?}, code {code}")]
    Installer {
        /// Category for ping reporting.
        category: ErrorCategory,
        /// Installer error code.
        code: i32,
    },

    /// The downloaded payload did not match its advertised hash.
    #[error("payload hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Hash advertised by the server.
        expected: String,
        /// Hash of the downloaded bytes.
        actual: String,
    },

    /// A candidate failed its qualification self-test. Internal only,
    /// never reported to the server.
    #[error("qualification failed: {0}")]
    QualificationFailure(String),

    /// Persistent state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UpdateError {
    /// The ping category for this failure.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::LockTimeout(_) => ErrorCategory::Install,
            Self::NetworkTransient(_) | Self::HashMismatch { .. } => {
                ErrorCategory::Download
            },
            Self::Protocol(_) => ErrorCategory::UpdateCheck,
            Self::Installer { category, .. } => *category,
            Self::QualificationFailure(_) | Self::Store(_) => ErrorCategory::Service,
        }
    }

    /// The error code carried in the failure ping.
    #[must_use]
    pub fn ping_code(&self) -> i32 {
        match self {
            Self::LockTimeout(_) => {
                rollout_core::installer::codes::ERROR_FAILED_TO_LOCK_SETUP_MUTEX
            },
            Self::Installer { code, .. } => *code,
            _ => 0,
        }
    }
}
