use serde::{Deserialize, Serialize};

use super::release::Release;

/// Why a check-in did or did not get an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    UpdateAvailable,
    /// The app has neither the requested channel nor a default.
    NoChannel,
    /// The channel has nothing active or rolling.
    NoRelease,
    /// Nothing newer than the device's current version.
    UpToDate,
    OsVersionTooLow,
    NotTargeted,
    NotInRollout,
    /// The device rolled this release back; an operator must clear it.
    RolledBack,
}

/// Computed fresh on every check-in; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutDecision {
    pub update_available: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<Release>,

    pub reason: DecisionReason,

    /// Name of the channel the check-in resolved to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl RolloutDecision {
    pub fn update(release: Release, channel: &str) -> Self {
        Self {
            update_available: true,
            release: Some(release),
            reason: DecisionReason::UpdateAvailable,
            channel: Some(channel.to_string()),
        }
    }

    pub fn no_update(reason: DecisionReason, channel: Option<&str>) -> Self {
        Self {
            update_available: false,
            release: None,
            reason,
            channel: channel.map(str::to_string),
        }
    }
}
