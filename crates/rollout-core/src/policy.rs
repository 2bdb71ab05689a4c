//! Policy resolution.
//!
//! Merges platform (administrative) policy with cloud
//! (device-management) policy into one [`EffectivePolicy`] per app
//! plus effective global settings. Resolution is deterministic and
//! order-independent.
//!
//! The precedence between the platform's own "cloud overrides
//! platform" switch and cloud policy's self-declared override flag is
//! asymmetric per OS: where the platform switch exists (Windows) it
//! wins over cloud's own flag; elsewhere cloud's flag is
//! authoritative, falling back to a per-OS default. The asymmetry
//! reflects per-OS administrative trust models and is preserved
//! exactly; the per-OS default is an explicit constructor input rather
//! than a `cfg!` inside the resolver.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Default interval between background update checks.
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(5 * 60 * 60);

/// How updates may proceed for an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// No update checks for this app.
    Disabled,
    /// Only user-initiated checks.
    Manual,
    /// Background checks allowed.
    #[default]
    Automatic,
    /// Updates are mandatory and applied as soon as offered.
    Forced,
}

/// How installs may proceed for an install-only app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// Installation is not permitted.
    Disabled,
    /// Installation is permitted on request.
    #[default]
    Enabled,
    /// The app must be silently installed on the next wake if absent.
    Forced,
}

/// Admin-configured "quiet hours" during which background update
/// activity is suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressedTimes {
    /// Window start hour (0-23).
    pub start_hour: u8,
    /// Window start minute (0-59).
    pub start_minute: u8,
    /// Window length in minutes; may wrap past midnight.
    pub duration_minutes: u32,
}

impl SuppressedTimes {
    /// Whether `now` falls inside the suppression window.
    #[must_use]
    pub fn contains(&self, now: NaiveTime) -> bool {
        let start =
            u32::from(self.start_hour) * 60 + u32::from(self.start_minute);
        let now_min = now.hour() * 60 + now.minute();
        let offset = (now_min + 24 * 60 - start) % (24 * 60);
        offset < self.duration_minutes
    }
}

/// Per-app policy fields; `None` means "inherit".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AppPolicy {
    /// Update mode override.
    #[serde(default)]
    pub update_mode: Option<UpdateMode>,

    /// Pin updates to versions matching this prefix.
    #[serde(default)]
    pub target_version_prefix: Option<String>,

    /// Pin updates to a channel.
    #[serde(default)]
    pub target_channel: Option<String>,

    /// Whether a server-directed downgrade to the target prefix is
    /// permitted.
    #[serde(default)]
    pub rollback_allowed: Option<bool>,

    /// Install mode override (install-only apps).
    #[serde(default)]
    pub install_mode: Option<InstallMode>,
}

impl AppPolicy {
    fn overlay(&self, base: &ResolvedFields) -> ResolvedFields {
        ResolvedFields {
            update_mode: self.update_mode.unwrap_or(base.update_mode),
            target_version_prefix: self
                .target_version_prefix
                .clone()
                .or_else(|| base.target_version_prefix.clone()),
            target_channel: self
                .target_channel
                .clone()
                .or_else(|| base.target_channel.clone()),
            rollback_allowed: self.rollback_allowed.unwrap_or(base.rollback_allowed),
            install_mode: self.install_mode.unwrap_or(base.install_mode),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ResolvedFields {
    update_mode: UpdateMode,
    target_version_prefix: Option<String>,
    target_channel: Option<String>,
    rollback_allowed: bool,
    install_mode: InstallMode,
}

/// Global (not per-app) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Seconds between background update checks.
    #[serde(default = "default_check_period_secs")]
    pub check_period_secs: u64,

    /// Download preference hint forwarded to the server.
    #[serde(default)]
    pub download_preference: Option<String>,

    /// Proxy configuration, if administratively set.
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// Quiet hours.
    #[serde(default)]
    pub suppressed_times: Option<SuppressedTimes>,
}

const fn default_check_period_secs() -> u64 {
    DEFAULT_CHECK_PERIOD.as_secs()
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            check_period_secs: default_check_period_secs(),
            download_preference: None,
            proxy_url: None,
            suppressed_times: None,
        }
    }
}

impl GlobalSettings {
    /// The check period as a [`Duration`].
    #[must_use]
    pub const fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_period_secs)
    }
}

/// Platform (local administrative) policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformPolicy {
    /// Global settings.
    #[serde(default)]
    pub globals: GlobalSettings,

    /// Defaults applying to every app without an override.
    #[serde(default)]
    pub defaults: AppPolicy,

    /// Per-app overrides, by lowercased app id.
    #[serde(default)]
    pub apps: HashMap<String, AppPolicy>,

    /// The platform's own "cloud overrides platform" switch. Only
    /// exists on some OSes; where present it takes precedence over the
    /// cloud policy's self-declared flag.
    #[serde(default)]
    pub cloud_overrides_platform: Option<bool>,
}

/// Cloud (device-management) policy payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudPolicySet {
    /// Cloud's self-declared "I override platform" flag, read from the
    /// cloud global settings node.
    #[serde(default)]
    pub cloud_overrides_platform: Option<bool>,

    /// Cloud global settings, overlaid onto platform globals when
    /// cloud wins.
    #[serde(default)]
    pub globals: Option<GlobalSettings>,

    /// Cloud-wide app defaults.
    #[serde(default)]
    pub defaults: AppPolicy,

    /// Per-app cloud policy, by lowercased app id.
    #[serde(default)]
    pub apps: HashMap<String, AppPolicy>,
}

/// The effective, fully-resolved policy for one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicy {
    /// Resolved update mode.
    pub update_mode: UpdateMode,
    /// Resolved target version prefix, if any.
    pub target_version_prefix: Option<String>,
    /// Resolved target channel, if any.
    pub target_channel: Option<String>,
    /// Whether rollback to the target prefix is allowed.
    pub rollback_allowed: bool,
    /// Resolved install mode.
    pub install_mode: InstallMode,
}

impl EffectivePolicy {
    /// Whether the update-check request for an app installed at
    /// `installed` must be flagged as a rollback.
    ///
    /// True when a target prefix is pinned, rollback is allowed, and
    /// the installed version does not already match the prefix - the
    /// server may then offer a qualifying older version, and failure
    /// handling must apply downgrade semantics.
    #[must_use]
    pub fn rollback_requested(&self, installed: &Version) -> bool {
        match &self.target_version_prefix {
            Some(prefix) => self.rollback_allowed && !installed.matches_prefix(prefix),
            None => false,
        }
    }
}

/// Merges platform and cloud policy deterministically.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    platform: PlatformPolicy,
    cloud: Option<CloudPolicySet>,
    /// Per-OS default for "does cloud win" when neither side declares.
    platform_default_trusts_cloud: bool,
}

impl PolicyResolver {
    /// Create a resolver.
    ///
    /// `platform_default_trusts_cloud` is the per-OS default applied
    /// when neither the platform switch nor the cloud flag is present.
    #[must_use]
    pub fn new(
        platform: PlatformPolicy,
        cloud: Option<CloudPolicySet>,
        platform_default_trusts_cloud: bool,
    ) -> Self {
        Self {
            platform,
            cloud,
            platform_default_trusts_cloud,
        }
    }

    /// Whether cloud policy overrides platform policy.
    ///
    /// The platform's own switch, where present, wins over cloud's
    /// self-declared flag; otherwise cloud's flag decides; otherwise
    /// the per-OS default applies. Cloud never wins when no cloud
    /// policy is present at all.
    #[must_use]
    pub fn cloud_wins(&self) -> bool {
        let Some(cloud) = &self.cloud else {
            return false;
        };
        if let Some(platform_switch) = self.platform.cloud_overrides_platform {
            return platform_switch;
        }
        if let Some(cloud_flag) = cloud.cloud_overrides_platform {
            return cloud_flag;
        }
        self.platform_default_trusts_cloud
    }

    /// Resolve the effective policy for `app_id`.
    #[must_use]
    pub fn resolve(&self, app_id: &str) -> EffectivePolicy {
        let app_id = app_id.to_ascii_lowercase();

        // Platform: app-specific overlaid on platform defaults.
        let platform_base = self.platform.defaults.overlay(&ResolvedFields::default());
        let platform_resolved = self
            .platform
            .apps
            .get(&app_id)
            .map_or_else(|| platform_base.clone(), |app| app.overlay(&platform_base));

        // Cloud overlay: cloud app-specific, falling back to cloud
        // defaults, falling back to the platform values already
        // computed.
        let resolved = match &self.cloud {
            Some(cloud) if self.cloud_wins() => {
                let with_defaults = cloud.defaults.overlay(&platform_resolved);
                cloud
                    .apps
                    .get(&app_id)
                    .map_or(with_defaults.clone(), |app| app.overlay(&with_defaults))
            },
            _ => platform_resolved,
        };

        EffectivePolicy {
            update_mode: resolved.update_mode,
            target_version_prefix: resolved.target_version_prefix,
            target_channel: resolved.target_channel,
            rollback_allowed: resolved.rollback_allowed,
            install_mode: resolved.install_mode,
        }
    }

    /// Effective global settings.
    #[must_use]
    pub fn globals(&self) -> GlobalSettings {
        if self.cloud_wins() {
            if let Some(globals) = self.cloud.as_ref().and_then(|c| c.globals.clone()) {
                return globals;
            }
        }
        self.platform.globals.clone()
    }

    /// App ids whose install mode is `Forced` but which are absent
    /// from `registered` - these must be silently installed during the
    /// next wake cycle.
    #[must_use]
    pub fn forced_installs_missing_from(&self, registered: &[String]) -> Vec<String> {
        let mut forced: Vec<String> = Vec::new();
        let mut consider = |app_id: &String| {
            let id = app_id.to_ascii_lowercase();
            if self.resolve(&id).install_mode == InstallMode::Forced
                && !registered.iter().any(|r| r.eq_ignore_ascii_case(&id))
                && !forced.contains(&id)
            {
                forced.push(id);
            }
        };
        for app_id in self.platform.apps.keys() {
            consider(app_id);
        }
        if let Some(cloud) = &self.cloud {
            for app_id in cloud.apps.keys() {
                consider(app_id);
            }
        }
        forced.sort();
        forced
    }
}
