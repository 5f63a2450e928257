use serde::Deserialize;
use tracing::{info, warn};

use bundlenudge_core::{new_id, now_rfc3339};

use crate::error::RolloutError;
use crate::model::{Channel, Release, ReleaseStatus, TargetingRuleSet};
use crate::service::RolloutService;
use crate::store::{Commit, Stored, channel_key, release_key};
use crate::version;

/// Input for [`RolloutService::create_release`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRelease {
    pub app_id: String,
    /// Channel name; stored on the release as the channel id.
    pub channel: String,
    pub version: String,
    pub bundle_ref: String,
    #[serde(default)]
    pub min_os_version: Option<String>,
    #[serde(default)]
    pub targeting_rules: Option<TargetingRuleSet>,
    #[serde(default)]
    pub release_notes: Option<String>,
}

impl RolloutService {
    // ── CRUD ──

    /// Create a release in `draft`. It serves nobody until `start_rollout`.
    pub fn create_release(&self, input: CreateRelease) -> Result<Release, RolloutError> {
        if !version::looks_like_version(&input.version) {
            return Err(RolloutError::Validation(format!(
                "{:?} is not a version",
                input.version
            )));
        }
        if input.bundle_ref.trim().is_empty() {
            return Err(RolloutError::Validation("bundle ref cannot be empty".into()));
        }
        if let Some(min_os) = &input.min_os_version {
            if !version::looks_like_version(min_os) {
                return Err(RolloutError::Validation(format!(
                    "{:?} is not an OS version",
                    min_os
                )));
            }
        }
        if let Some(rules) = &input.targeting_rules {
            rules.validate().map_err(RolloutError::Validation)?;
        }

        let channel = self.get_channel(&input.app_id, &input.channel)?;
        let duplicate = self
            .store
            .list_channel_releases(&input.app_id, &channel.id)?
            .into_iter()
            .any(|r| {
                !r.value.status.is_terminal()
                    && version::compare(&r.value.version, &input.version).is_eq()
            });
        if duplicate {
            return Err(RolloutError::Validation(format!(
                "channel {} already has a live release of version {}",
                channel.name, input.version
            )));
        }

        let now = now_rfc3339();
        let release = Release {
            id: new_id(),
            app_id: input.app_id,
            channel_id: channel.id,
            version: input.version,
            status: ReleaseStatus::Draft,
            rollout_percentage: 0,
            bundle_ref: input.bundle_ref,
            min_os_version: input.min_os_version,
            targeting_rules: input.targeting_rules,
            release_notes: input.release_notes,
            created_at: now.clone(),
            updated_at: now,
        };
        if !self.store.insert_release(&release)? {
            return Err(RolloutError::Conflict(format!("release {} already exists", release.id)));
        }

        info!(
            "rollout: created release {} ({}) on channel {} of app {}",
            release.id, release.version, channel.name, release.app_id
        );
        Ok(release)
    }

    /// Get a release by id.
    pub fn get_release(&self, release_id: &str) -> Result<Release, RolloutError> {
        Ok(self.load_release(release_id)?.value)
    }

    /// List a channel's releases, newest version first.
    pub fn list_releases(&self, app_id: &str, channel: &str) -> Result<Vec<Release>, RolloutError> {
        let channel = self.get_channel(app_id, channel)?;
        let all = [
            ReleaseStatus::Draft,
            ReleaseStatus::Rolling,
            ReleaseStatus::Active,
            ReleaseStatus::Paused,
            ReleaseStatus::Disabled,
            ReleaseStatus::Failed,
            ReleaseStatus::Complete,
        ];
        self.store.list_candidate_releases(app_id, &channel.id, &all)
    }

    fn load_release(&self, release_id: &str) -> Result<Stored<Release>, RolloutError> {
        self.store
            .get_release(release_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("release {}", release_id)))
    }

    /// The channel row a release belongs to, looked up by channel id.
    fn release_channel(&self, release: &Release) -> Result<Stored<Channel>, RolloutError> {
        self.store
            .list_channels(&release.app_id)?
            .into_iter()
            .find(|c| c.value.id == release.channel_id)
            .ok_or_else(|| {
                RolloutError::NotFound(format!(
                    "channel {} of release {}",
                    release.channel_id, release.id
                ))
            })
    }

    /// Siblings on the same channel with the given status.
    fn siblings(
        &self,
        release: &Release,
        status: ReleaseStatus,
    ) -> Result<Vec<Stored<Release>>, RolloutError> {
        Ok(self
            .store
            .list_channel_releases(&release.app_id, &release.channel_id)?
            .into_iter()
            .filter(|r| r.value.id != release.id && r.value.status == status)
            .collect())
    }

    fn ensure_no_other_rolling(&self, release: &Release) -> Result<(), RolloutError> {
        if let Some(other) = self.siblings(release, ReleaseStatus::Rolling)?.first() {
            return Err(RolloutError::RolloutInProgress(format!(
                "release {} ({}) is already rolling on this channel",
                other.value.id, other.value.version
            )));
        }
        Ok(())
    }

    /// Move a release to `rolling` and point its channel at it. Every
    /// transition into `rolling` rewrites the channel row, so two releases
    /// racing to roll on one channel cannot both commit.
    fn begin_rolling(&self, current: &Stored<Release>, percentage: u8) -> Result<Release, RolloutError> {
        // Channel first: any later rolling transition rewrites it and fails our commit.
        let channel = self.release_channel(&current.value)?;
        self.ensure_no_other_rolling(&current.value)?;

        let now = now_rfc3339();
        let mut next = current.value.clone();
        next.status = ReleaseStatus::Rolling;
        next.rollout_percentage = percentage;
        next.updated_at = now.clone();

        let mut ch = channel.value.clone();
        ch.active_release_id = Some(next.id.clone());
        ch.updated_at = now;

        let commit = Commit::new()
            .expect(release_key(&next.id), Some(current))
            .expect(channel_key(&ch.app_id, &ch.name), Some(&channel))
            .put(release_key(&next.id), &next)?
            .put(channel_key(&ch.app_id, &ch.name), &ch)?;
        self.commit_release(commit, &next.id)?;

        info!(
            "rollout: release {} ({}) rolling at {}% on channel {}",
            next.id, next.version, percentage, ch.name
        );
        Ok(next)
    }

    // ── Lifecycle ──

    /// Start serving a draft to `percentage` of targeted devices.
    pub fn start_rollout(&self, release_id: &str, percentage: u8) -> Result<Release, RolloutError> {
        check_percentage(percentage)?;
        let current = self.load_release(release_id)?;
        expect_status(&current.value, &[ReleaseStatus::Draft], ReleaseStatus::Rolling)?;
        self.begin_rolling(&current, percentage)
    }

    /// Widen a rollout. Lowering the percentage would pull the release from
    /// devices already included, so it is rejected.
    pub fn set_rollout_percentage(&self, release_id: &str, percentage: u8) -> Result<Release, RolloutError> {
        check_percentage(percentage)?;
        let current = self.load_release(release_id)?;
        expect_status(
            &current.value,
            &[ReleaseStatus::Rolling, ReleaseStatus::Paused],
            current.value.status,
        )?;
        if percentage < current.value.rollout_percentage {
            return Err(RolloutError::NonMonotonicRollout(format!(
                "release {}: {}% -> {}%",
                release_id, current.value.rollout_percentage, percentage
            )));
        }
        if percentage == current.value.rollout_percentage {
            return Ok(current.value);
        }

        let mut next = current.value.clone();
        next.rollout_percentage = percentage;
        next.updated_at = now_rfc3339();
        let commit = Commit::new()
            .expect(release_key(release_id), Some(&current))
            .put(release_key(release_id), &next)?;
        self.commit_release(commit, release_id)?;

        info!(
            "rollout: release {} rollout {}% -> {}%",
            release_id, current.value.rollout_percentage, percentage
        );
        Ok(next)
    }

    /// Serve a release to every targeted device. The channel's previous
    /// active release is completed in the same commit.
    pub fn promote(&self, release_id: &str) -> Result<Release, RolloutError> {
        let current = self.load_release(release_id)?;
        expect_status(
            &current.value,
            &[ReleaseStatus::Rolling, ReleaseStatus::Paused],
            ReleaseStatus::Active,
        )?;
        let channel = self.release_channel(&current.value)?;
        let superseded = self.siblings(&current.value, ReleaseStatus::Active)?;

        let now = now_rfc3339();
        let mut next = current.value.clone();
        next.status = ReleaseStatus::Active;
        next.rollout_percentage = 100;
        next.updated_at = now.clone();

        let mut ch = channel.value.clone();
        ch.active_release_id = Some(next.id.clone());
        ch.updated_at = now.clone();

        let mut commit = Commit::new()
            .expect(release_key(release_id), Some(&current))
            .expect(channel_key(&ch.app_id, &ch.name), Some(&channel))
            .put(release_key(release_id), &next)?
            .put(channel_key(&ch.app_id, &ch.name), &ch)?;
        for old in &superseded {
            let mut done = old.value.clone();
            done.status = ReleaseStatus::Complete;
            done.updated_at = now.clone();
            commit = commit
                .expect(release_key(&done.id), Some(old))
                .put(release_key(&done.id), &done)?;
        }
        self.commit_release(commit, release_id)?;

        for old in &superseded {
            info!("rollout: release {} completed, superseded by {}", old.value.id, next.id);
        }
        info!("rollout: release {} ({}) promoted to active", next.id, next.version);
        Ok(next)
    }

    /// Stop serving a rolling or active release without giving it up.
    pub fn pause(&self, release_id: &str) -> Result<Release, RolloutError> {
        self.set_status(
            release_id,
            &[ReleaseStatus::Rolling, ReleaseStatus::Active],
            ReleaseStatus::Paused,
        )
    }

    /// Resume a paused release as rolling at its current percentage.
    pub fn resume(&self, release_id: &str) -> Result<Release, RolloutError> {
        let current = self.load_release(release_id)?;
        expect_status(&current.value, &[ReleaseStatus::Paused], ReleaseStatus::Rolling)?;
        let percentage = current.value.rollout_percentage;
        self.begin_rolling(&current, percentage)
    }

    /// Pull a release for good. Devices are no longer offered it.
    pub fn disable(&self, release_id: &str) -> Result<Release, RolloutError> {
        self.set_status(
            release_id,
            &[
                ReleaseStatus::Draft,
                ReleaseStatus::Rolling,
                ReleaseStatus::Active,
                ReleaseStatus::Paused,
            ],
            ReleaseStatus::Disabled,
        )
    }

    /// Record that a release failed in the field. Terminal, like `disable`.
    pub fn mark_failed(&self, release_id: &str) -> Result<Release, RolloutError> {
        self.set_status(
            release_id,
            &[ReleaseStatus::Rolling, ReleaseStatus::Active, ReleaseStatus::Paused],
            ReleaseStatus::Failed,
        )
    }

    fn set_status(
        &self,
        release_id: &str,
        from: &[ReleaseStatus],
        to: ReleaseStatus,
    ) -> Result<Release, RolloutError> {
        let current = self.load_release(release_id)?;
        expect_status(&current.value, from, to)?;

        let mut next = current.value.clone();
        next.status = to;
        next.updated_at = now_rfc3339();
        let commit = Commit::new()
            .expect(release_key(release_id), Some(&current))
            .put(release_key(release_id), &next)?;
        self.commit_release(commit, release_id)?;

        if to == ReleaseStatus::Failed {
            warn!("rollout: release {} ({}) marked failed", next.id, next.version);
        } else {
            info!("rollout: release {} {} -> {}", next.id, current.value.status, to);
        }
        Ok(next)
    }

    fn commit_release(&self, commit: Commit, release_id: &str) -> Result<(), RolloutError> {
        if !self.store.apply(commit)? {
            return Err(RolloutError::Conflict(format!(
                "release {} changed concurrently",
                release_id
            )));
        }
        Ok(())
    }
}

fn check_percentage(percentage: u8) -> Result<(), RolloutError> {
    if percentage > 100 {
        return Err(RolloutError::Validation(format!(
            "rollout percentage must be 0..=100, got {}",
            percentage
        )));
    }
    Ok(())
}

fn expect_status(release: &Release, from: &[ReleaseStatus], to: ReleaseStatus) -> Result<(), RolloutError> {
    if from.contains(&release.status) {
        return Ok(());
    }
    Err(RolloutError::InvalidTransition(format!(
        "release {} is {}, cannot move to {}",
        release.id, release.status, to
    )))
}
