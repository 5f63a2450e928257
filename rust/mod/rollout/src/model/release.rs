use serde::{Deserialize, Serialize};

use super::targeting::TargetingRuleSet;
use crate::version;

/// Release lifecycle status.
///
/// ```text
/// DRAFT → ROLLING ⇄ PAUSED
///           ↓   ↘     ↓
///         ACTIVE → PAUSED
///           ↓
///        COMPLETE          (superseded by a newer ACTIVE release)
///
/// any non-terminal → DISABLED | FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Draft,
    Rolling,
    Active,
    Paused,
    Disabled,
    Failed,
    Complete,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Rolling => "rolling",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
            Self::Failed => "failed",
            Self::Complete => "complete",
        }
    }

    /// Whether devices may be served this release.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Rolling | Self::Active)
    }

    /// Whether the release can never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disabled | Self::Failed | Self::Complete)
    }
}

impl Default for ReleaseStatus {
    fn default() -> Self {
        Self::Draft
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statuses a check-in may be served from.
pub const SERVING_STATUSES: [ReleaseStatus; 2] = [ReleaseStatus::Active, ReleaseStatus::Rolling];

/// One JS bundle version published to a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub id: String,

    pub app_id: String,

    /// Channel.id, not the channel name: renames never orphan a release.
    pub channel_id: String,

    /// Semver-like version string (e.g. "2.0.0").
    pub version: String,

    #[serde(default)]
    pub status: ReleaseStatus,

    /// Share of targeted devices (0..=100). Only ever increases while serving.
    #[serde(default)]
    pub rollout_percentage: u8,

    /// Opaque pointer to the stored bundle artifact.
    pub bundle_ref: String,

    /// Devices whose OS version is lower than this are never served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_os_version: Option<String>,

    /// Release-specific targeting, evaluated after the channel's rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting_rules: Option<TargetingRuleSet>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes: Option<String>,

    pub created_at: String,

    pub updated_at: String,
}

impl Release {
    /// Reasons this row cannot be served even when its status says it may.
    /// Returns None for a well-formed release.
    pub fn defect(&self) -> Option<String> {
        if self.id.is_empty() {
            return Some("empty release id".into());
        }
        if !version::looks_like_version(&self.version) {
            return Some(format!("unusable version {:?}", self.version));
        }
        if self.rollout_percentage > 100 {
            return Some(format!("rollout percentage {} > 100", self.rollout_percentage));
        }
        if self.bundle_ref.is_empty() {
            return Some("empty bundle ref".into());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Release {
        Release {
            id: "rel-1".into(),
            app_id: "app".into(),
            channel_id: "ch".into(),
            version: "2.0.0".into(),
            status: ReleaseStatus::Rolling,
            rollout_percentage: 50,
            bundle_ref: "bundles/app/2.0.0.js".into(),
            min_os_version: None,
            targeting_rules: None,
            release_notes: None,
            created_at: "2026-01-01T00:00:00+00:00".into(),
            updated_at: "2026-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_value(ReleaseStatus::Rolling).unwrap();
        assert_eq!(json, serde_json::json!("rolling"));
        let back: ReleaseStatus = serde_json::from_value(serde_json::json!("complete")).unwrap();
        assert_eq!(back, ReleaseStatus::Complete);
    }

    #[test]
    fn serving_and_terminal_sets() {
        assert!(ReleaseStatus::Rolling.is_serving());
        assert!(ReleaseStatus::Active.is_serving());
        assert!(!ReleaseStatus::Paused.is_serving());
        assert!(ReleaseStatus::Complete.is_terminal());
        assert!(!ReleaseStatus::Paused.is_terminal());
    }

    #[test]
    fn release_json_uses_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["rolloutPercentage"], 50);
        assert_eq!(json["bundleRef"], "bundles/app/2.0.0.js");
        assert!(json.get("minOsVersion").is_none());
    }

    #[test]
    fn defects_are_detected() {
        assert!(sample().defect().is_none());

        let mut r = sample();
        r.version = "latest".into();
        assert!(r.defect().is_some());

        let mut r = sample();
        r.rollout_percentage = 150;
        assert!(r.defect().is_some());

        let mut r = sample();
        r.bundle_ref.clear();
        assert!(r.defect().is_some());
    }
}
