use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use bundlenudge_core::{new_id, parse_rfc3339};

use crate::error::RolloutError;
use crate::model::{
    DeviceReleaseRecord, DeviceReleaseState, InstallOutcome, ReleaseHealth, RollbackReport,
};
use crate::service::RolloutService;
use crate::store::{Commit, device_key, marker_key, release_report_key, report_key};

/// What ended a start attempt.
enum FailedStart<'a> {
    /// The device told us.
    Reported(&'a RollbackReport),
    /// The device applied the bundle and never confirmed it in time.
    TimedOut { pending_since: String },
}

impl RolloutService {
    // ── Device signals ──

    /// Feed a device's signal about a served release into its state machine.
    pub fn report_outcome(
        &self,
        device_id: &str,
        release_id: &str,
        outcome: InstallOutcome,
    ) -> Result<DeviceReleaseRecord, RolloutError> {
        self.report_outcome_at(device_id, release_id, outcome, Utc::now())
    }

    /// [`report_outcome`](Self::report_outcome) at an explicit instant.
    pub fn report_outcome_at(
        &self,
        device_id: &str,
        release_id: &str,
        outcome: InstallOutcome,
        now: DateTime<Utc>,
    ) -> Result<DeviceReleaseRecord, RolloutError> {
        if device_id.is_empty() || release_id.is_empty() {
            return Err(RolloutError::Validation(
                "device id and release id are required".into(),
            ));
        }
        // The outcome itself settles this pair's pending window.
        self.expire_overdue_confirmations(device_id, now, Some(release_id))?;

        match outcome {
            InstallOutcome::Applied => self.mark_applied(device_id, release_id, now),
            InstallOutcome::Confirmed => self.confirm(device_id, release_id, now),
            InstallOutcome::Failed {
                report_id,
                reason,
                previous_version,
            } => {
                let report = RollbackReport {
                    // No client id means no dedup: a resend counts again.
                    id: report_id.filter(|id| !id.is_empty()).unwrap_or_else(new_id),
                    device_id: device_id.to_string(),
                    release_id: release_id.to_string(),
                    reason,
                    previous_version,
                    timestamp: now.to_rfc3339(),
                };
                self.record_rollback_report(&report)
            }
        }
    }

    /// Append a rollback report and advance the pair's failure counter in the
    /// same commit. A report id the device already filed against this release
    /// changes nothing.
    pub fn record_rollback_report(&self, report: &RollbackReport) -> Result<DeviceReleaseRecord, RolloutError> {
        self.apply_failed_start(
            &report.device_id,
            &report.release_id,
            FailedStart::Reported(report),
            &report.timestamp,
        )
    }

    fn mark_applied(
        &self,
        device_id: &str,
        release_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DeviceReleaseRecord, RolloutError> {
        let stamp = now.to_rfc3339();
        let deadline = (now + Duration::seconds(self.config.confirmation_timeout_secs)).to_rfc3339();
        self.with_retries("applied", || {
            let current = self.store.get_device_record(device_id, release_id)?;
            let mut record = current
                .as_ref()
                .map(|c| c.value.clone())
                .unwrap_or_else(|| DeviceReleaseRecord::served(device_id, release_id, &stamp));
            match record.state {
                DeviceReleaseState::Served => {}
                // A resent "applied" keeps the original window.
                DeviceReleaseState::PendingConfirmation => return Ok(Some(record)),
                DeviceReleaseState::Confirmed | DeviceReleaseState::RolledBack => {
                    debug!(
                        "rollout: ignoring applied for {}/{} in state {}",
                        device_id, release_id, record.state
                    );
                    return Ok(Some(record));
                }
            }

            record.state = DeviceReleaseState::PendingConfirmation;
            record.pending_since = Some(stamp.clone());
            record.confirm_deadline = Some(deadline.clone());
            record.updated_at = stamp.clone();
            if !self.store.set_device_release_state(&record, current.as_ref())? {
                return Ok(None);
            }
            debug!(
                "rollout: {}/{} applied, confirmation due by {}",
                device_id, release_id, deadline
            );
            Ok(Some(record))
        })
    }

    /// Confirmation clears the counter of this (device, release) pair only;
    /// the device's counters for other releases are left alone.
    fn confirm(
        &self,
        device_id: &str,
        release_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DeviceReleaseRecord, RolloutError> {
        let stamp = now.to_rfc3339();
        self.with_retries("confirm", || {
            let current = self.store.get_device_record(device_id, release_id)?;
            let mut record = current
                .as_ref()
                .map(|c| c.value.clone())
                .unwrap_or_else(|| DeviceReleaseRecord::served(device_id, release_id, &stamp));
            match record.state {
                DeviceReleaseState::Served | DeviceReleaseState::PendingConfirmation => {}
                DeviceReleaseState::Confirmed => return Ok(Some(record)),
                DeviceReleaseState::RolledBack => {
                    warn!(
                        "rollout: {}/{} confirmed after rollback; block stays until cleared",
                        device_id, release_id
                    );
                    return Ok(Some(record));
                }
            }

            record.state = DeviceReleaseState::Confirmed;
            record.failure_count = 0;
            record.pending_since = None;
            record.confirm_deadline = None;
            record.last_failure = None;
            record.updated_at = stamp.clone();
            if !self.store.set_device_release_state(&record, current.as_ref())? {
                return Ok(None);
            }
            info!("rollout: {}/{} confirmed", device_id, release_id);
            Ok(Some(record))
        })
    }

    /// Count one failed start for every pending pair of the device whose
    /// confirmation deadline has passed. Each pending window counts at most
    /// once, however many check-ins observe it. Returns how many expired.
    pub fn expire_overdue_confirmations(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
        skip_release: Option<&str>,
    ) -> Result<usize, RolloutError> {
        let mut expired = 0;
        for stored in self.store.list_device_records(device_id)? {
            let record = stored.value;
            if record.state != DeviceReleaseState::PendingConfirmation
                || skip_release == Some(record.release_id.as_str())
            {
                continue;
            }
            let overdue = match record.confirm_deadline.as_deref().map(parse_rfc3339) {
                Some(Some(deadline)) => deadline < now,
                _ => {
                    warn!(
                        "rollout: {}/{} pending without a usable deadline, expiring",
                        device_id, record.release_id
                    );
                    true
                }
            };
            if !overdue {
                continue;
            }
            let pending_since = record.pending_since.clone().unwrap_or_default();
            self.apply_failed_start(
                device_id,
                &record.release_id,
                FailedStart::TimedOut { pending_since },
                &now.to_rfc3339(),
            )?;
            expired += 1;
        }
        Ok(expired)
    }

    fn apply_failed_start(
        &self,
        device_id: &str,
        release_id: &str,
        cause: FailedStart<'_>,
        stamp: &str,
    ) -> Result<DeviceReleaseRecord, RolloutError> {
        let guard = match &cause {
            FailedStart::Reported(report) => report_key(device_id, release_id, &report.id),
            FailedStart::TimedOut { pending_since } => marker_key(&format!(
                "timeout:{}:{}:{}",
                device_id, release_id, pending_since
            )),
        };
        let threshold = self.config.failure_threshold.max(1);

        self.with_retries("failed start", || {
            let current = self.store.get_device_record(device_id, release_id)?;
            let mut record = current
                .as_ref()
                .map(|c| c.value.clone())
                .unwrap_or_else(|| DeviceReleaseRecord::served(device_id, release_id, stamp));

            if self.store.exists(&guard)? {
                debug!("rollout: {} already counted, ignoring", guard);
                return Ok(Some(record));
            }

            let counts = match (&cause, record.state) {
                (FailedStart::TimedOut { pending_since }, DeviceReleaseState::PendingConfirmation) => {
                    record.pending_since.as_deref().unwrap_or_default() == pending_since.as_str()
                }
                (FailedStart::TimedOut { .. }, _) => false,
                (FailedStart::Reported(report), DeviceReleaseState::Confirmed) => {
                    report.reason.is_immediate()
                }
                (FailedStart::Reported(_), DeviceReleaseState::RolledBack) => false,
                (FailedStart::Reported(_), _) => true,
            };

            let mut commit = Commit::new()
                .expect_absent(guard.clone())
                .expect(device_key(device_id, release_id), current.as_ref());
            match &cause {
                FailedStart::Reported(report) => {
                    commit = commit
                        .put(guard.clone(), *report)?
                        .put(release_report_key(report), *report)?;
                }
                FailedStart::TimedOut { .. } => {
                    // The window was closed by a confirm or a report.
                    if !counts {
                        return Ok(Some(record));
                    }
                    commit = commit.put(guard.clone(), &stamp)?;
                }
            }

            let previous = record.state;
            if counts {
                match &cause {
                    FailedStart::Reported(report) if report.reason.is_immediate() => {
                        record.state = DeviceReleaseState::RolledBack;
                        record.last_failure = Some(report.reason);
                    }
                    _ => {
                        record.failure_count += 1;
                        if let FailedStart::Reported(report) = &cause {
                            record.last_failure = Some(report.reason);
                        }
                        record.state = if record.failure_count >= threshold {
                            DeviceReleaseState::RolledBack
                        } else {
                            DeviceReleaseState::Served
                        };
                    }
                }
                record.pending_since = None;
                record.confirm_deadline = None;
                record.updated_at = stamp.to_string();
                commit = commit.put(device_key(device_id, release_id), &record)?;
            }

            if !self.store.apply(commit)? {
                return Ok(None);
            }

            match &cause {
                FailedStart::Reported(report) if !counts => info!(
                    "rollout: report {} ({}) logged for {}/{} in state {}, counter unchanged",
                    report.id, report.reason, device_id, release_id, previous
                ),
                FailedStart::Reported(report) => info!(
                    "rollout: report {} ({}) for {}/{}: {} failed start(s)",
                    report.id, report.reason, device_id, release_id, record.failure_count
                ),
                FailedStart::TimedOut { .. } => info!(
                    "rollout: {}/{} not confirmed in time: {} failed start(s)",
                    device_id, release_id, record.failure_count
                ),
            }
            if record.state == DeviceReleaseState::RolledBack && previous != DeviceReleaseState::RolledBack {
                warn!("rollout: release {} rolled back on device {}", release_id, device_id);
            }
            Ok(Some(record))
        })
    }

    // ── Queries & operator actions ──

    /// The pair's current record, if the release was ever served to the device.
    pub fn device_release_state(
        &self,
        device_id: &str,
        release_id: &str,
    ) -> Result<Option<DeviceReleaseRecord>, RolloutError> {
        Ok(self
            .store
            .get_device_record(device_id, release_id)?
            .map(|s| s.value))
    }

    /// Lift a rollback block so the release can be served to the device again.
    /// The failure counter goes with it; the report log is untouched.
    pub fn clear_rollback(&self, device_id: &str, release_id: &str) -> Result<(), RolloutError> {
        let current = self
            .store
            .get_device_record(device_id, release_id)?
            .ok_or_else(|| {
                RolloutError::NotFound(format!("device {} has no record for release {}", device_id, release_id))
            })?;
        if current.value.state != DeviceReleaseState::RolledBack {
            return Err(RolloutError::InvalidTransition(format!(
                "{}/{} is {}, not rolled back",
                device_id, release_id, current.value.state
            )));
        }

        let commit = Commit::new()
            .expect(device_key(device_id, release_id), Some(&current))
            .delete(device_key(device_id, release_id));
        if !self.store.apply(commit)? {
            return Err(RolloutError::Conflict(format!(
                "{}/{} changed concurrently",
                device_id, release_id
            )));
        }
        info!("rollout: rollback of release {} cleared for device {}", release_id, device_id);
        Ok(())
    }

    /// Rollback reports filed against a release, by reason.
    pub fn release_health(&self, release_id: &str) -> Result<ReleaseHealth, RolloutError> {
        let reports = self.store.list_release_reports(release_id)?;
        let mut health = ReleaseHealth {
            release_id: release_id.to_string(),
            total_reports: reports.len(),
            ..Default::default()
        };
        let mut devices = BTreeSet::new();
        for report in &reports {
            *health.by_reason.entry(report.reason).or_default() += 1;
            devices.insert(report.device_id.as_str());
        }
        health.distinct_devices = devices.len();
        Ok(health)
    }
}
