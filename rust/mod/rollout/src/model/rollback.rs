use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Why a device abandoned a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    CrashDetected,
    HealthCheckFailed,
    Manual,
    HashMismatch,
}

impl RollbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CrashDetected => "crash_detected",
            Self::HealthCheckFailed => "health_check_failed",
            Self::Manual => "manual",
            Self::HashMismatch => "hash_mismatch",
        }
    }

    /// `manual` rolls back at once; every other reason is one failed start.
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Manual)
    }
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device telemetry record. Append-only: never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    /// Client-supplied when available; doubles as the idempotency marker.
    pub id: String,

    pub device_id: String,

    pub release_id: String,

    pub reason: RollbackReason,

    /// The version the device fell back to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,

    pub timestamp: String,
}

/// Per-(device, release) install state.
///
/// ```text
/// SERVED → PENDING_CONFIRMATION → CONFIRMED
///    ↑            │
///    └─ timeout ──┘
///
/// SERVED | PENDING_CONFIRMATION → ROLLED_BACK   (threshold reached or manual)
/// CONFIRMED → ROLLED_BACK                        (manual only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceReleaseState {
    Served,
    PendingConfirmation,
    Confirmed,
    RolledBack,
}

impl DeviceReleaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Served => "SERVED",
            Self::PendingConfirmation => "PENDING_CONFIRMATION",
            Self::Confirmed => "CONFIRMED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::RolledBack)
    }
}

impl std::fmt::Display for DeviceReleaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Materialized state plus the failure counter that gates re-serving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReleaseRecord {
    pub device_id: String,

    pub release_id: String,

    pub state: DeviceReleaseState,

    /// Consecutive failed starts since the last confirmation.
    #[serde(default)]
    pub failure_count: u32,

    /// When the device reported the bundle applied (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_since: Option<String>,

    /// Confirmation must arrive before this instant (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_deadline: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<RollbackReason>,

    pub updated_at: String,
}

impl DeviceReleaseRecord {
    pub fn served(device_id: &str, release_id: &str, now: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            release_id: release_id.to_string(),
            state: DeviceReleaseState::Served,
            failure_count: 0,
            pending_since: None,
            confirm_deadline: None,
            last_failure: None,
            updated_at: now.to_string(),
        }
    }

    /// Whether this release must not be served to this device.
    pub fn blocks_serving(&self) -> bool {
        self.state == DeviceReleaseState::RolledBack
    }
}

/// A device's signal about a served release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstallOutcome {
    /// Bundle downloaded and applied; waiting for the app to report ready.
    Applied,
    /// The app started and reported ready ("notifyAppReady").
    Confirmed,
    /// The device rolled back or detected a bad start.
    Failed {
        #[serde(default, rename = "reportId", skip_serializing_if = "Option::is_none")]
        report_id: Option<String>,
        reason: RollbackReason,
        #[serde(default, rename = "previousVersion", skip_serializing_if = "Option::is_none")]
        previous_version: Option<String>,
    },
}

/// Rollback reports against one release, grouped by reason.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseHealth {
    pub release_id: String,
    pub total_reports: usize,
    pub distinct_devices: usize,
    pub by_reason: BTreeMap<RollbackReason, usize>,
}
