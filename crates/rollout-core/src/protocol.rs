//! Wire protocol types for the update-check and ping exchanges.
//!
//! The transport is HTTP(S) with JSON bodies. Responses are accepted
//! whether the server uses the legacy `"app"` key or the newer
//! `"apps"` key. The response status value space is closed: an
//! unrecognized status is a hard failure for that app, never silently
//! ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::installer::ErrorCategory;
use crate::version::Version;

/// Request priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// User-initiated; shown in UI, bypasses background throttling.
    Foreground,
    /// Periodic background work.
    Background,
}

/// Per-app update-check request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheckRequest {
    /// App id.
    pub app_id: String,

    /// Currently installed version.
    pub version: Version,

    /// Tag / additional-parameters string.
    #[serde(default)]
    pub ap: String,

    /// Install id for first-install attribution.
    #[serde(default)]
    pub iid: Option<String>,

    /// Index into the server-side install data for this app.
    #[serde(default)]
    pub install_data_index: Option<String>,

    /// Whether the server may offer the already-installed version
    /// (over-install repair).
    #[serde(default)]
    pub same_version_update: bool,

    /// Explicit downgrade request: a target prefix is pinned, rollback
    /// is allowed, and the installed version is outside the prefix.
    #[serde(default)]
    pub rollback: bool,

    /// Pin offered versions to this prefix.
    #[serde(default)]
    pub target_version_prefix: Option<String>,

    /// Pin offered versions to this channel.
    #[serde(default)]
    pub target_channel: Option<String>,

    /// Request priority.
    pub priority: Priority,
}

/// Closed set of per-app response statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// An update (or install payload) is offered.
    Ok,
    /// No update available.
    NoUpdate,
    /// Server-side internal error.
    ErrorInternal,
    /// Payload offered without a usable hash.
    ErrorHash,
    /// OS not supported by the offered payload.
    ErrorOsNotSupported,
    /// Hardware not supported by the offered payload.
    ErrorHwNotSupported,
    /// Protocol version not supported.
    ErrorUnsupportedProtocol,
    /// The server does not know this app.
    ErrorUnknownApplication,
}

impl CheckStatus {
    /// Parse a wire status string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownStatus`] for anything outside
    /// the closed set - callers must treat that as a hard failure.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        match value {
            "ok" => Ok(Self::Ok),
            "noupdate" => Ok(Self::NoUpdate),
            "error-internal" => Ok(Self::ErrorInternal),
            "error-hash" => Ok(Self::ErrorHash),
            "error-osnotsupported" => Ok(Self::ErrorOsNotSupported),
            "error-hwnotsupported" => Ok(Self::ErrorHwNotSupported),
            "error-unsupportedprotocol" => Ok(Self::ErrorUnsupportedProtocol),
            "error-unknownapplication" => Ok(Self::ErrorUnknownApplication),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }

    /// Whether this status is an `error-*` value.
    #[must_use]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Ok | Self::NoUpdate)
    }
}

/// Protocol-level errors, surfaced verbatim to any UI layer with a
/// fixed string per value and never retried within the same cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The server does not know this app.
    #[error("application unknown to the server")]
    UnknownApplication,

    /// OS not supported.
    #[error("the update is not supported on this operating system")]
    OsNotSupported,

    /// Hardware not supported.
    #[error("the update is not supported on this hardware")]
    HwNotSupported,

    /// Offered payload carried no hash.
    #[error("the update payload has no usable hash")]
    NoHash,

    /// Protocol version mismatch.
    #[error("the server does not support this protocol version")]
    UnsupportedProtocol,

    /// Server-side internal error.
    #[error("internal server error")]
    Internal,

    /// A status value outside the closed set.
    #[error("unrecognized response status {0:?}")]
    UnknownStatus(String),

    /// The response body did not parse.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<CheckStatus> for Option<ProtocolError> {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Ok | CheckStatus::NoUpdate => None,
            CheckStatus::ErrorInternal => Some(ProtocolError::Internal),
            CheckStatus::ErrorHash => Some(ProtocolError::NoHash),
            CheckStatus::ErrorOsNotSupported => Some(ProtocolError::OsNotSupported),
            CheckStatus::ErrorHwNotSupported => Some(ProtocolError::HwNotSupported),
            CheckStatus::ErrorUnsupportedProtocol => {
                Some(ProtocolError::UnsupportedProtocol)
            },
            CheckStatus::ErrorUnknownApplication => {
                Some(ProtocolError::UnknownApplication)
            },
        }
    }
}

/// Reference to a downloadable payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Download URL.
    pub url: String,
    /// Hex SHA-256 of the payload.
    pub hash_sha256: String,
}

/// Parsed per-app result of an update-check exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCheckResult {
    /// App id the server responded for.
    pub app_id: String,
    /// Parsed status.
    pub status: CheckStatus,
    /// Offered version, when `status == Ok`.
    pub version: Option<Version>,
    /// Offered payload, when `status == Ok`.
    pub payload: Option<PayloadRef>,
    /// Server-assigned cohort, if any.
    pub cohort: Option<String>,
}

// -------------------------------------------------------------------------
// Response envelope (wire shape)
// -------------------------------------------------------------------------

/// Raw response envelope as sent by the server.
#[derive(Debug, Deserialize)]
pub struct ResponseEnvelope {
    /// Response body.
    pub response: ResponseBody,
}

/// Raw response body.
#[derive(Debug, Deserialize)]
pub struct ResponseBody {
    /// Protocol version string.
    #[serde(default)]
    pub protocol: String,

    /// Per-app responses. Both the legacy `"app"` key and the newer
    /// `"apps"` key are accepted.
    #[serde(default, alias = "app")]
    pub apps: Vec<AppResponse>,
}

/// Raw per-app response node.
#[derive(Debug, Deserialize)]
pub struct AppResponse {
    /// App id.
    pub appid: String,

    /// App-level status string (closed set).
    #[serde(default = "default_app_status")]
    pub status: String,

    /// Update-check node.
    #[serde(default)]
    pub updatecheck: Option<UpdateCheckNode>,

    /// Cohort assignment.
    #[serde(default)]
    pub cohort: Option<String>,
}

fn default_app_status() -> String {
    "ok".to_string()
}

/// Raw update-check node.
#[derive(Debug, Deserialize)]
pub struct UpdateCheckNode {
    /// Update-check status string (closed set).
    pub status: String,

    /// Offered version.
    #[serde(default)]
    pub version: Option<Version>,

    /// Offered payload.
    #[serde(default)]
    pub payload: Option<PayloadRef>,
}

impl AppResponse {
    /// Flatten the raw node into an [`AppCheckResult`], enforcing the
    /// closed status set.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for unknown status values or an `ok`
    /// update without a version.
    pub fn into_result(self) -> Result<AppCheckResult, ProtocolError> {
        let app_status = CheckStatus::parse(&self.status)?;
        if app_status.is_error() {
            return Ok(AppCheckResult {
                app_id: self.appid,
                status: app_status,
                version: None,
                payload: None,
                cohort: self.cohort,
            });
        }
        let (status, version, payload) = match self.updatecheck {
            Some(node) => {
                let status = CheckStatus::parse(&node.status)?;
                if status == CheckStatus::Ok && node.version.is_none() {
                    return Err(ProtocolError::Malformed(format!(
                        "ok update for {} without a version",
                        self.appid
                    )));
                }
                (status, node.version, node.payload)
            },
            None => (app_status, None, None),
        };
        Ok(AppCheckResult {
            app_id: self.appid,
            status,
            version,
            payload,
            cohort: self.cohort,
        })
    }
}

// -------------------------------------------------------------------------
// Pings
// -------------------------------------------------------------------------

/// Ping event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum EventType {
    /// Install outcome.
    Install,
    /// Update outcome.
    Update,
    /// Uninstall of a previous version.
    Uninstall,
    /// App-command completion (legacy surface).
    AppCommandComplete,
}

impl From<EventType> for u32 {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Install => 2,
            EventType::Update => 3,
            EventType::Uninstall => 4,
            EventType::AppCommandComplete => 41,
        }
    }
}

impl TryFrom<u32> for EventType {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Install),
            3 => Ok(Self::Update),
            4 => Ok(Self::Uninstall),
            41 => Ok(Self::AppCommandComplete),
            other => Err(format!("unknown event type {other}")),
        }
    }
}

/// Fire-and-forget outcome report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingEvent {
    /// App the event concerns.
    pub app_id: String,

    /// Event type.
    #[serde(rename = "eventtype")]
    pub event_type: EventType,

    /// 1 on success, 0 on failure.
    #[serde(rename = "eventresult")]
    pub event_result: u32,

    /// Error category, [`ErrorCategory::None`] on success. Cancelled
    /// work reports [`ErrorCategory::Cancelled`] here, which is what
    /// distinguishes it from a failure with the same code.
    #[serde(rename = "errorcat", default)]
    pub error_category: ErrorCategory,

    /// Error code, 0 on success.
    #[serde(rename = "errorcode", default)]
    pub error_code: i32,

    /// Extra diagnostic code.
    #[serde(rename = "extracode1", default)]
    pub extra_code1: i32,

    /// Version being replaced (uninstall-of-old-version pings).
    #[serde(rename = "previousversion", default)]
    pub previous_version: Option<Version>,

    /// Days since the app was last reported active; -1 if unknown.
    #[serde(rename = "ad", default)]
    pub days_since_active: Option<i32>,
}

impl PingEvent {
    /// A successful event of `event_type` for `app_id`.
    #[must_use]
    pub fn success(app_id: &str, event_type: EventType) -> Self {
        Self {
            app_id: app_id.to_string(),
            event_type,
            event_result: 1,
            error_category: ErrorCategory::None,
            error_code: 0,
            extra_code1: 0,
            previous_version: None,
            days_since_active: None,
        }
    }

    /// A failed event of `event_type` for `app_id`, carrying the
    /// failure's category and code.
    #[must_use]
    pub fn failure(
        app_id: &str,
        event_type: EventType,
        error_category: ErrorCategory,
        error_code: i32,
    ) -> Self {
        Self {
            app_id: app_id.to_string(),
            event_type,
            event_result: 0,
            error_category,
            error_code,
            extra_code1: 0,
            previous_version: None,
            days_since_active: None,
        }
    }

    /// An uninstall ping carrying the version being removed.
    #[must_use]
    pub fn uninstall(app_id: &str, previous_version: Version) -> Self {
        Self {
            previous_version: Some(previous_version),
            ..Self::success(app_id, EventType::Uninstall)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn parses_apps_key() {
        let body = r#"{"response":{"protocol":"4.0","apps":[
            {"appid":"test","status":"ok",
             "updatecheck":{"status":"ok","version":"1",
                "payload":{"url":"http://x/p.crx","hash_sha256":"ab"}}}]}}"#;
        let envelope: ResponseEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.response.protocol, "4.0");
        let result = envelope
            .response
            .apps
            .into_iter()
            .next()
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(result.status, CheckStatus::Ok);
        assert_eq!(result.version, Some(v("1")));
        assert_eq!(result.payload.unwrap().url, "http://x/p.crx");
    }

    #[test]
    fn parses_legacy_app_key() {
        let body = r#"{"response":{"protocol":"3.1","app":[
            {"appid":"test","status":"ok",
             "updatecheck":{"status":"noupdate"}}]}}"#;
        let envelope: ResponseEnvelope = serde_json::from_str(body).unwrap();
        let result = envelope
            .response
            .apps
            .into_iter()
            .next()
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(result.status, CheckStatus::NoUpdate);
    }

    #[test]
    fn unknown_status_is_a_hard_failure() {
        let response = AppResponse {
            appid: "test".into(),
            status: "ok".into(),
            updatecheck: Some(UpdateCheckNode {
                status: "error-surprising".into(),
                version: None,
                payload: None,
            }),
            cohort: None,
        };
        assert!(matches!(
            response.into_result(),
            Err(ProtocolError::UnknownStatus(_))
        ));
    }

    #[test]
    fn ok_without_version_is_malformed() {
        let response = AppResponse {
            appid: "test".into(),
            status: "ok".into(),
            updatecheck: Some(UpdateCheckNode {
                status: "ok".into(),
                version: None,
                payload: None,
            }),
            cohort: None,
        };
        assert!(matches!(
            response.into_result(),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn closed_status_set_round_trip() {
        for (wire, status) in [
            ("ok", CheckStatus::Ok),
            ("noupdate", CheckStatus::NoUpdate),
            ("error-internal", CheckStatus::ErrorInternal),
            ("error-hash", CheckStatus::ErrorHash),
            ("error-osnotsupported", CheckStatus::ErrorOsNotSupported),
            ("error-hwnotsupported", CheckStatus::ErrorHwNotSupported),
            (
                "error-unsupportedprotocol",
                CheckStatus::ErrorUnsupportedProtocol,
            ),
            (
                "error-unknownapplication",
                CheckStatus::ErrorUnknownApplication,
            ),
        ] {
            assert_eq!(CheckStatus::parse(wire).unwrap(), status);
        }
        assert!(CheckStatus::parse("Ok").is_err());
    }

    #[test]
    fn event_type_wire_values() {
        assert_eq!(u32::from(EventType::Install), 2);
        assert_eq!(u32::from(EventType::Update), 3);
        assert_eq!(u32::from(EventType::Uninstall), 4);
        let json = serde_json::to_string(&PingEvent::uninstall("test", v("1.0"))).unwrap();
        assert!(json.contains("\"eventtype\":4"));
        assert!(json.contains("\"previousversion\":\"1.0\""));
    }

    #[test]
    fn failure_pings_carry_category_and_code() {
        let cancelled = PingEvent::failure(
            "test",
            EventType::Update,
            ErrorCategory::Cancelled,
            0,
        );
        let json = serde_json::to_string(&cancelled).unwrap();
        assert!(json.contains("\"errorcat\":6"));
        assert!(json.contains("\"errorcode\":0"));

        let failed = PingEvent::failure(
            "test",
            EventType::Update,
            ErrorCategory::Install,
            1618,
        );
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains("\"errorcat\":3"));
        assert!(json.contains("\"errorcode\":1618"));
        assert_ne!(cancelled.error_category, failed.error_category);
    }
}
