use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::bucket;
use crate::error::RolloutError;
use crate::model::{
    DecisionReason, DeviceCheckIn, DeviceReleaseRecord, DeviceReleaseState, Release,
    RolloutDecision, SERVING_STATUSES,
};
use crate::service::RolloutService;
use crate::targeting;
use crate::version;

/// Why a candidate was passed over.
#[derive(Debug, Clone, PartialEq)]
enum Skip {
    Malformed(String),
    NotNewer,
    OsVersionTooLow,
    NotTargeted,
    NotInRollout,
    RolledBack,
}

impl Skip {
    /// The reason reported when this is the best candidate a device missed.
    fn reason(&self) -> Option<DecisionReason> {
        match self {
            Skip::Malformed(_) => None,
            Skip::NotNewer => Some(DecisionReason::UpToDate),
            Skip::OsVersionTooLow => Some(DecisionReason::OsVersionTooLow),
            Skip::NotTargeted => Some(DecisionReason::NotTargeted),
            Skip::NotInRollout => Some(DecisionReason::NotInRollout),
            Skip::RolledBack => Some(DecisionReason::RolledBack),
        }
    }
}

impl RolloutService {
    /// Decide whether a checking-in device should get an update, and which.
    pub fn decide(&self, check_in: &DeviceCheckIn) -> Result<RolloutDecision, RolloutError> {
        self.decide_at(check_in, Utc::now())
    }

    /// [`decide`](Self::decide) at an explicit instant.
    ///
    /// Candidates are walked highest version first and the first eligible one
    /// wins, so a device always moves to the newest release it may have.
    pub fn decide_at(
        &self,
        check_in: &DeviceCheckIn,
        now: DateTime<Utc>,
    ) -> Result<RolloutDecision, RolloutError> {
        if !check_in.device_id.is_empty() {
            self.expire_overdue_confirmations(&check_in.device_id, now, None)?;
        }

        let Some(channel) = self.resolve_channel(&check_in.app_id, check_in.channel.as_deref())? else {
            debug!("rollout: app {} has no channel to serve from", check_in.app_id);
            return Ok(RolloutDecision::no_update(DecisionReason::NoChannel, None));
        };

        let candidates =
            self.store
                .list_candidate_releases(&check_in.app_id, &channel.id, &SERVING_STATUSES)?;
        if candidates.is_empty() {
            return Ok(RolloutDecision::no_update(
                DecisionReason::NoRelease,
                Some(&channel.name),
            ));
        }

        let channel_targeted = targeting::evaluate_optional(channel.targeting_rules.as_ref(), check_in);
        let mut missed: Option<DecisionReason> = None;

        for candidate in candidates {
            match self.eligibility(&candidate, check_in, channel_targeted)? {
                Ok(()) => {
                    self.record_served(&check_in.device_id, &candidate.id, now)?;
                    info!(
                        "rollout: device {} on {} -> release {} ({}) via {}",
                        check_in.device_id,
                        check_in.current_version,
                        candidate.id,
                        candidate.version,
                        channel.name
                    );
                    return Ok(RolloutDecision::update(candidate, &channel.name));
                }
                Err(Skip::Malformed(why)) => {
                    warn!("rollout: skipping malformed release {}: {}", candidate.id, why);
                }
                Err(skip) => {
                    debug!(
                        "rollout: device {} skips release {} ({}): {:?}",
                        check_in.device_id, candidate.id, candidate.version, skip
                    );
                    if missed.is_none() {
                        missed = skip.reason();
                    }
                    // Sorted descending: nothing after this is newer either.
                    if skip == Skip::NotNewer {
                        break;
                    }
                }
            }
        }

        let reason = missed.unwrap_or(DecisionReason::UpToDate);
        Ok(RolloutDecision::no_update(reason, Some(&channel.name)))
    }

    /// Checks in the order: version, OS floor, targeting, rollout bucket,
    /// rollback block. The block is checked last because it needs a read.
    fn eligibility(
        &self,
        release: &Release,
        check_in: &DeviceCheckIn,
        channel_targeted: bool,
    ) -> Result<Result<(), Skip>, RolloutError> {
        if let Some(defect) = release.defect() {
            return Ok(Err(Skip::Malformed(defect)));
        }
        if version::compare(&release.version, &check_in.current_version).is_le() {
            return Ok(Err(Skip::NotNewer));
        }
        if let Some(min_os) = release.min_os_version.as_deref().filter(|v| !v.is_empty()) {
            if !version::gte(&check_in.os_version, min_os) {
                return Ok(Err(Skip::OsVersionTooLow));
            }
        }
        if !channel_targeted || !targeting::evaluate_optional(release.targeting_rules.as_ref(), check_in) {
            return Ok(Err(Skip::NotTargeted));
        }
        if !bucket::is_included(&check_in.device_id, &release.id, release.rollout_percentage) {
            return Ok(Err(Skip::NotInRollout));
        }
        if self.rollback_blocked(&check_in.device_id, &release.id)? {
            return Ok(Err(Skip::RolledBack));
        }
        Ok(Ok(()))
    }

    fn rollback_blocked(&self, device_id: &str, release_id: &str) -> Result<bool, RolloutError> {
        let threshold = self.config.failure_threshold.max(1);
        Ok(self
            .store
            .get_device_record(device_id, release_id)?
            .is_some_and(|r| r.value.blocks_serving() || r.value.failure_count >= threshold))
    }

    /// Open (or reopen) the pair's state machine at `served`.
    fn record_served(&self, device_id: &str, release_id: &str, now: DateTime<Utc>) -> Result<(), RolloutError> {
        if device_id.is_empty() {
            return Ok(());
        }
        let stamp = now.to_rfc3339();
        self.with_retries("served", || {
            let current = self.store.get_device_record(device_id, release_id)?;
            match current.as_ref().map(|c| c.value.state) {
                None | Some(DeviceReleaseState::Confirmed) => {}
                // Served, pending, or blocked: nothing to reopen.
                Some(_) => return Ok(Some(())),
            }
            let record = DeviceReleaseRecord::served(device_id, release_id, &stamp);
            Ok(self
                .store
                .set_device_release_state(&record, current.as_ref())?
                .then_some(()))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::model::{InstallOutcome, ReleaseStatus, RollbackReason, TargetingRuleSet};
    use crate::service::release::CreateRelease;
    use crate::service::testutil::test_service;

    fn check_in(device: &str, current: &str) -> DeviceCheckIn {
        DeviceCheckIn {
            device_id: device.into(),
            app_id: "app".into(),
            channel: None,
            current_version: current.into(),
            platform: "ios".into(),
            os_version: "17.2".into(),
            app_version: "5.0.0".into(),
            locale: Some("en-US".into()),
            custom: BTreeMap::new(),
        }
    }

    fn release_on(
        svc: &RolloutService,
        channel: &str,
        version: &str,
        min_os: Option<&str>,
        rules: Option<TargetingRuleSet>,
    ) -> Release {
        svc.create_release(CreateRelease {
            app_id: "app".into(),
            channel: channel.into(),
            version: version.into(),
            bundle_ref: format!("bundles/app/{}.js", version),
            min_os_version: min_os.map(str::to_string),
            targeting_rules: rules,
            release_notes: None,
        })
        .unwrap()
    }

    /// First device id whose bucket for `release` satisfies `pred`.
    fn device_where(release: &str, pred: impl Fn(u32) -> bool) -> String {
        (0..10_000)
            .map(|i| format!("device-{}", i))
            .find(|d| pred(bucket::bucket(d, release)))
            .unwrap()
    }

    #[test]
    fn half_rollout_splits_on_bucket() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let r = release_on(&svc, "production", "2.0.0", None, None);
        svc.start_rollout(&r.id, 50).unwrap();

        let inside = device_where(&r.id, |b| b == 30);
        let decision = svc.decide(&check_in(&inside, "1.9.0")).unwrap();
        assert!(decision.update_available);
        assert_eq!(decision.reason, DecisionReason::UpdateAvailable);
        assert_eq!(decision.release.unwrap().version, "2.0.0");
        assert_eq!(decision.channel.as_deref(), Some("production"));

        let outside = device_where(&r.id, |b| b == 70);
        let decision = svc.decide(&check_in(&outside, "1.9.0")).unwrap();
        assert!(!decision.update_available);
        assert_eq!(decision.reason, DecisionReason::NotInRollout);
    }

    #[test]
    fn widening_keeps_included_devices() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let r = release_on(&svc, "production", "2.0.0", None, None);
        svc.start_rollout(&r.id, 30).unwrap();

        let devices: Vec<String> = (0..200).map(|i| format!("fleet-{}", i)).collect();
        let served_at = |svc: &RolloutService| -> Vec<String> {
            devices
                .iter()
                .filter(|d| svc.decide(&check_in(d, "1.0.0")).unwrap().update_available)
                .cloned()
                .collect()
        };
        let at_30 = served_at(&svc);
        svc.set_rollout_percentage(&r.id, 60).unwrap();
        let at_60 = served_at(&svc);

        assert!(!at_30.is_empty());
        assert!(at_30.iter().all(|d| at_60.contains(d)));
        assert!(at_60.len() >= at_30.len());
    }

    #[test]
    fn platform_rule_filters_regardless_of_percentage() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let ios_only: TargetingRuleSet = serde_json::from_value(json!({
            "match": "all",
            "rules": [{"field": "platform", "op": "eq", "value": "ios"}]
        }))
        .unwrap();
        svc.set_channel_targeting("app", "production", Some(ios_only)).unwrap();
        let r = release_on(&svc, "production", "2.0.0", None, None);
        svc.start_rollout(&r.id, 100).unwrap();

        let mut android = check_in("pixel", "1.0.0");
        android.platform = "android".into();
        let decision = svc.decide(&android).unwrap();
        assert!(!decision.update_available);
        assert_eq!(decision.reason, DecisionReason::NotTargeted);

        assert!(svc.decide(&check_in("iphone", "1.0.0")).unwrap().update_available);
    }

    #[test]
    fn release_rules_apply_after_channel_rules() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let german: TargetingRuleSet = serde_json::from_value(json!({
            "match": "any",
            "rules": [{"field": "locale", "operator": "in", "value": ["de-DE", "de-AT"]}]
        }))
        .unwrap();
        let r = release_on(&svc, "production", "2.0.0", None, Some(german));
        svc.start_rollout(&r.id, 100).unwrap();

        assert_eq!(
            svc.decide(&check_in("d", "1.0.0")).unwrap().reason,
            DecisionReason::NotTargeted
        );
        let mut de = check_in("d", "1.0.0");
        de.locale = Some("de-AT".into());
        assert!(svc.decide(&de).unwrap().update_available);
    }

    #[test]
    fn os_floor_blocks_old_devices() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let r = release_on(&svc, "production", "2.0.0", Some("14.0"), None);
        svc.start_rollout(&r.id, 100).unwrap();

        let mut old = check_in("d", "1.0.0");
        old.os_version = "13.0".into();
        let decision = svc.decide(&old).unwrap();
        assert!(!decision.update_available);
        assert_eq!(decision.reason, DecisionReason::OsVersionTooLow);

        let mut unknown = check_in("d", "1.0.0");
        unknown.os_version.clear();
        assert!(!svc.decide(&unknown).unwrap().update_available);

        let mut new = check_in("d", "1.0.0");
        new.os_version = "14.0".into();
        assert!(svc.decide(&new).unwrap().update_available);
    }

    #[test]
    fn never_serves_same_or_older_versions() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        for v in ["1.0.0", "1.5.0"] {
            let r = release_on(&svc, "production", v, None, None);
            svc.start_rollout(&r.id, 100).unwrap();
            svc.promote(&r.id).unwrap();
        }
        // 1.5.0 active, 2.0.0 rolling: two candidates.
        let r = release_on(&svc, "production", "2.0.0", None, None);
        svc.start_rollout(&r.id, 100).unwrap();

        for current in ["0.9.0", "1.0.0", "1.5.0", "1.9.9", "2.0.0", "2.0.0-beta", "3.0.0", "garbage"] {
            let decision = svc.decide(&check_in("dev", current)).unwrap();
            if let Some(release) = &decision.release {
                assert!(version::compare(&release.version, current).is_gt());
            }
        }
        assert_eq!(
            svc.decide(&check_in("dev", "2.0.0")).unwrap().reason,
            DecisionReason::UpToDate
        );
    }

    #[test]
    fn newest_eligible_release_wins() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let stable = release_on(&svc, "production", "1.1.0", None, None);
        svc.start_rollout(&stable.id, 100).unwrap();
        svc.promote(&stable.id).unwrap();
        let next = release_on(&svc, "production", "1.2.0", Some("99.0"), None);
        svc.start_rollout(&next.id, 100).unwrap();

        // 1.2.0 needs a newer OS, so the device falls through to 1.1.0.
        let decision = svc.decide(&check_in("dev", "1.0.0")).unwrap();
        assert_eq!(decision.release.unwrap().id, stable.id);
    }

    #[test]
    fn no_channel_and_no_release() {
        let (svc, _dir) = test_service();
        let decision = svc.decide(&check_in("dev", "1.0.0")).unwrap();
        assert_eq!(decision.reason, DecisionReason::NoChannel);
        assert!(decision.channel.is_none());

        svc.ensure_default_channels("app").unwrap();
        let r = release_on(&svc, "production", "2.0.0", None, None);
        let decision = svc.decide(&check_in("dev", "1.0.0")).unwrap();
        assert_eq!(decision.reason, DecisionReason::NoRelease);

        svc.start_rollout(&r.id, 100).unwrap();
        svc.pause(&r.id).unwrap();
        assert_eq!(
            svc.decide(&check_in("dev", "1.0.0")).unwrap().reason,
            DecisionReason::NoRelease
        );
    }

    #[test]
    fn explicit_channel_is_honoured() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let r = release_on(&svc, "staging", "2.0.0", None, None);
        svc.start_rollout(&r.id, 100).unwrap();

        assert!(!svc.decide(&check_in("dev", "1.0.0")).unwrap().update_available);
        let mut tester = check_in("dev", "1.0.0");
        tester.channel = Some("staging".into());
        let decision = svc.decide(&tester).unwrap();
        assert!(decision.update_available);
        assert_eq!(decision.channel.as_deref(), Some("staging"));
    }

    #[test]
    fn crashing_device_is_blocked_alone() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let r = release_on(&svc, "production", "2.0.0", None, None);
        svc.start_rollout(&r.id, 100).unwrap();

        assert!(svc.decide(&check_in("crashy", "1.0.0")).unwrap().update_available);
        for i in 0..3 {
            svc.report_outcome(
                "crashy",
                &r.id,
                InstallOutcome::Failed {
                    report_id: Some(format!("crash-{}", i)),
                    reason: RollbackReason::CrashDetected,
                    previous_version: Some("1.0.0".into()),
                },
            )
            .unwrap();
        }

        let decision = svc.decide(&check_in("crashy", "1.0.0")).unwrap();
        assert!(!decision.update_available);
        assert_eq!(decision.reason, DecisionReason::RolledBack);
        assert!(svc.decide(&check_in("healthy", "1.0.0")).unwrap().update_available);

        svc.clear_rollback("crashy", &r.id).unwrap();
        assert!(svc.decide(&check_in("crashy", "1.0.0")).unwrap().update_available);
    }

    #[test]
    fn check_in_records_served_and_expires_pending() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let r = release_on(&svc, "production", "2.0.0", None, None);
        svc.start_rollout(&r.id, 100).unwrap();

        let t0 = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        svc.decide_at(&check_in("dev", "1.0.0"), t0).unwrap();
        let rec = svc.device_release_state("dev", &r.id).unwrap().unwrap();
        assert_eq!(rec.state, DeviceReleaseState::Served);

        svc.report_outcome_at("dev", &r.id, InstallOutcome::Applied, t0).unwrap();
        // The app never comes up on the new bundle; the next check-in notices.
        let later = t0 + chrono::Duration::seconds(600);
        assert!(svc.decide_at(&check_in("dev", "1.0.0"), later).unwrap().update_available);
        let rec = svc.device_release_state("dev", &r.id).unwrap().unwrap();
        assert_eq!(rec.state, DeviceReleaseState::Served);
        assert_eq!(rec.failure_count, 1);
    }

    #[test]
    fn malformed_candidate_is_skipped_not_fatal() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let good = release_on(&svc, "production", "2.0.0", None, None);
        svc.start_rollout(&good.id, 100).unwrap();

        // A row written by something else with an empty bundle ref.
        let channel = svc.get_channel("app", "production").unwrap();
        let mut broken = good.clone();
        broken.id = "broken".into();
        broken.version = "9.0.0".into();
        broken.bundle_ref.clear();
        broken.status = ReleaseStatus::Active;
        broken.channel_id = channel.id;
        assert!(svc.store().insert_release(&broken).unwrap());

        let decision = svc.decide(&check_in("dev", "1.0.0")).unwrap();
        assert_eq!(decision.release.unwrap().id, good.id);
    }
}
