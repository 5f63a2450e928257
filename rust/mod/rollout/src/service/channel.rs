use tracing::{debug, info};

use bundlenudge_core::{new_id, now_rfc3339};

use crate::error::RolloutError;
use crate::model::channel::{INITIAL_DEFAULT_CHANNEL, PROTECTED_CHANNELS, is_protected, validate_name};
use crate::model::{Channel, ReleaseStatus, TargetingRuleSet};
use crate::service::RolloutService;
use crate::store::{Commit, channel_key, default_key};

impl RolloutService {
    // ── Resolution ──

    /// Resolve a check-in's channel: the requested channel when the app has
    /// one by that name, else the app's default. None when neither exists.
    pub fn resolve_channel(
        &self,
        app_id: &str,
        requested: Option<&str>,
    ) -> Result<Option<Channel>, RolloutError> {
        if let Some(name) = requested.filter(|n| !n.is_empty()) {
            if let Some(channel) = self.store.get_channel(app_id, name)? {
                return Ok(Some(channel.value));
            }
            debug!("rollout: app {} has no channel {:?}, using default", app_id, name);
        }
        Ok(self.store.get_default_channel(app_id)?.map(|c| c.value))
    }

    // ── Administration ──

    /// Get a channel by name.
    pub fn get_channel(&self, app_id: &str, name: &str) -> Result<Channel, RolloutError> {
        self.store
            .get_channel(app_id, name)?
            .map(|c| c.value)
            .ok_or_else(|| RolloutError::NotFound(format!("channel {} of app {}", name, app_id)))
    }

    /// List an app's channels, sorted by name.
    pub fn list_channels(&self, app_id: &str) -> Result<Vec<Channel>, RolloutError> {
        let mut channels: Vec<Channel> = self
            .store
            .list_channels(app_id)?
            .into_iter()
            .map(|c| c.value)
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(channels)
    }

    /// Seed the protected channels an app starts with. `production` becomes
    /// the default unless the app already has one. Idempotent.
    pub fn ensure_default_channels(&self, app_id: &str) -> Result<Vec<Channel>, RolloutError> {
        if app_id.is_empty() {
            return Err(RolloutError::Validation("app id cannot be empty".into()));
        }
        for name in PROTECTED_CHANNELS {
            if self.store.get_channel(app_id, name)?.is_none() {
                self.insert_channel(app_id, name, None)?;
            }
        }
        if self.store.default_pointer(app_id)?.is_none() {
            self.store.set_channel_default(app_id, INITIAL_DEFAULT_CHANNEL)?;
        }
        self.list_channels(app_id)
    }

    /// Create a channel. The first channel of an app becomes its default.
    pub fn create_channel(
        &self,
        app_id: &str,
        name: &str,
        targeting_rules: Option<TargetingRuleSet>,
    ) -> Result<Channel, RolloutError> {
        if app_id.is_empty() {
            return Err(RolloutError::Validation("app id cannot be empty".into()));
        }
        validate_name(name).map_err(RolloutError::Validation)?;
        if let Some(rules) = &targeting_rules {
            rules.validate().map_err(RolloutError::Validation)?;
        }
        self.insert_channel(app_id, name, targeting_rules)
    }

    fn insert_channel(
        &self,
        app_id: &str,
        name: &str,
        targeting_rules: Option<TargetingRuleSet>,
    ) -> Result<Channel, RolloutError> {
        if self.store.get_channel(app_id, name)?.is_some() {
            return Err(RolloutError::Validation(format!(
                "channel {} already exists in app {}",
                name, app_id
            )));
        }

        let pointer = self.store.default_pointer(app_id)?;
        let now = now_rfc3339();
        let channel = Channel {
            id: new_id(),
            app_id: app_id.to_string(),
            name: name.to_string(),
            is_default: pointer.is_none(),
            targeting_rules,
            active_release_id: None,
            created_at: now.clone(),
            updated_at: now,
        };

        let mut commit = Commit::new()
            .expect_absent(channel_key(app_id, name))
            .expect(default_key(app_id), pointer.as_ref())
            .put(channel_key(app_id, name), &channel)?;
        if channel.is_default {
            commit = commit.put(default_key(app_id), &channel.name)?;
        }
        if !self.store.apply(commit)? {
            return Err(RolloutError::Conflict(format!(
                "channels of app {} changed concurrently",
                app_id
            )));
        }

        info!(
            "rollout: created channel {} of app {}{}",
            name,
            app_id,
            if channel.is_default { " (default)" } else { "" }
        );
        Ok(channel)
    }

    /// Rename a channel. Releases reference the channel id, so they follow.
    pub fn rename_channel(&self, app_id: &str, name: &str, new_name: &str) -> Result<Channel, RolloutError> {
        if is_protected(name) {
            return Err(RolloutError::ProtectedChannel(format!("{} cannot be renamed", name)));
        }
        if is_protected(new_name) {
            return Err(RolloutError::ProtectedChannel(format!("{} is reserved", new_name)));
        }
        validate_name(new_name).map_err(RolloutError::Validation)?;
        if name == new_name {
            return self.get_channel(app_id, name);
        }

        let current = self
            .store
            .get_channel(app_id, name)?
            .ok_or_else(|| RolloutError::NotFound(format!("channel {} of app {}", name, app_id)))?;
        if self.store.get_channel(app_id, new_name)?.is_some() {
            return Err(RolloutError::Validation(format!(
                "channel {} already exists in app {}",
                new_name, app_id
            )));
        }
        let pointer = self.store.default_pointer(app_id)?;

        let mut renamed = current.value.clone();
        renamed.name = new_name.to_string();
        renamed.updated_at = now_rfc3339();

        let mut commit = Commit::new()
            .expect(channel_key(app_id, name), Some(&current))
            .expect_absent(channel_key(app_id, new_name))
            .expect(default_key(app_id), pointer.as_ref())
            .delete(channel_key(app_id, name))
            .put(channel_key(app_id, new_name), &renamed)?;
        if pointer.as_ref().is_some_and(|p| p.value == name) {
            commit = commit.put(default_key(app_id), &new_name)?;
        }
        if !self.store.apply(commit)? {
            return Err(RolloutError::Conflict(format!(
                "channel {} of app {} changed concurrently",
                name, app_id
            )));
        }

        info!("rollout: renamed channel {} -> {} in app {}", name, new_name, app_id);
        Ok(renamed)
    }

    /// Delete a channel. Protected channels, the default channel and channels
    /// with a release still serving or paused mid-rollout cannot be deleted.
    pub fn delete_channel(&self, app_id: &str, name: &str) -> Result<(), RolloutError> {
        if is_protected(name) {
            return Err(RolloutError::ProtectedChannel(format!("{} cannot be deleted", name)));
        }
        let current = self
            .store
            .get_channel(app_id, name)?
            .ok_or_else(|| RolloutError::NotFound(format!("channel {} of app {}", name, app_id)))?;
        let pointer = self.store.default_pointer(app_id)?;
        if current.value.is_default || pointer.as_ref().is_some_and(|p| p.value == name) {
            return Err(RolloutError::DefaultChannel(format!(
                "{} is the default channel of app {}; promote another channel first",
                name, app_id
            )));
        }

        let live: Vec<String> = self
            .store
            .list_channel_releases(app_id, &current.value.id)?
            .into_iter()
            .filter(|r| !r.value.status.is_terminal() && r.value.status != ReleaseStatus::Draft)
            .map(|r| r.value.id)
            .collect();
        if !live.is_empty() {
            return Err(RolloutError::RolloutInProgress(format!(
                "channel {} still has releases in rollout: {}",
                name,
                live.join(", ")
            )));
        }

        let commit = Commit::new()
            .expect(channel_key(app_id, name), Some(&current))
            .expect(default_key(app_id), pointer.as_ref())
            .delete(channel_key(app_id, name));
        if !self.store.apply(commit)? {
            return Err(RolloutError::Conflict(format!(
                "channel {} of app {} changed concurrently",
                name, app_id
            )));
        }

        info!("rollout: deleted channel {} of app {}", name, app_id);
        Ok(())
    }

    /// Make `name` the app's default channel, clearing the previous default
    /// in the same commit. A concurrent swap surfaces as `Conflict`.
    pub fn set_default_channel(&self, app_id: &str, name: &str) -> Result<Channel, RolloutError> {
        let channel = self.store.set_channel_default(app_id, name)?;
        info!("rollout: default channel of app {} is now {}", app_id, name);
        Ok(channel)
    }

    /// Replace (or clear) a channel's targeting rules.
    pub fn set_channel_targeting(
        &self,
        app_id: &str,
        name: &str,
        targeting_rules: Option<TargetingRuleSet>,
    ) -> Result<Channel, RolloutError> {
        if let Some(rules) = &targeting_rules {
            rules.validate().map_err(RolloutError::Validation)?;
        }
        let current = self
            .store
            .get_channel(app_id, name)?
            .ok_or_else(|| RolloutError::NotFound(format!("channel {} of app {}", name, app_id)))?;

        let mut updated = current.value.clone();
        updated.targeting_rules = targeting_rules;
        updated.updated_at = now_rfc3339();

        let commit = Commit::new()
            .expect(channel_key(app_id, name), Some(&current))
            .put(channel_key(app_id, name), &updated)?;
        if !self.store.apply(commit)? {
            return Err(RolloutError::Conflict(format!(
                "channel {} of app {} changed concurrently",
                name, app_id
            )));
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::service::testutil::test_service;

    fn defaults(svc: &RolloutService, app: &str) -> Vec<String> {
        svc.list_channels(app)
            .unwrap()
            .into_iter()
            .filter(|c| c.is_default)
            .map(|c| c.name)
            .collect()
    }

    #[test]
    fn seeding_is_idempotent() {
        let (svc, _dir) = test_service();
        let first = svc.ensure_default_channels("app").unwrap();
        let second = svc.ensure_default_channels("app").unwrap();
        assert_eq!(first, second);

        let names: Vec<&str> = first.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["development", "production", "staging"]);
        assert_eq!(defaults(&svc, "app"), vec!["production"]);
    }

    #[test]
    fn first_channel_becomes_default() {
        let (svc, _dir) = test_service();
        let beta = svc.create_channel("app", "beta", None).unwrap();
        assert!(beta.is_default);
        let qa = svc.create_channel("app", "qa", None).unwrap();
        assert!(!qa.is_default);
        assert_eq!(defaults(&svc, "app"), vec!["beta"]);
    }

    #[test]
    fn create_rejects_bad_input() {
        let (svc, _dir) = test_service();
        svc.create_channel("app", "beta", None).unwrap();

        assert!(matches!(
            svc.create_channel("app", "beta", None),
            Err(RolloutError::Validation(_))
        ));
        assert!(matches!(
            svc.create_channel("app", "Beta!", None),
            Err(RolloutError::Validation(_))
        ));

        let bad_rules: TargetingRuleSet = serde_json::from_value(json!({
            "match": "all",
            "rules": [{"field": "platform", "op": "regex", "value": ".*"}]
        }))
        .unwrap();
        assert!(matches!(
            svc.create_channel("app", "qa", Some(bad_rules)),
            Err(RolloutError::Validation(_))
        ));
    }

    #[test]
    fn resolution_falls_back_to_default() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        svc.create_channel("app", "beta", None).unwrap();

        let explicit = svc.resolve_channel("app", Some("beta")).unwrap().unwrap();
        assert_eq!(explicit.name, "beta");
        let unknown = svc.resolve_channel("app", Some("nightly")).unwrap().unwrap();
        assert_eq!(unknown.name, "production");
        let implicit = svc.resolve_channel("app", None).unwrap().unwrap();
        assert_eq!(implicit.name, "production");

        assert!(svc.resolve_channel("other-app", None).unwrap().is_none());
    }

    #[test]
    fn protected_channels_cannot_be_renamed_or_deleted() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        svc.create_channel("app", "beta", None).unwrap();
        svc.set_default_channel("app", "beta").unwrap();

        for name in PROTECTED_CHANNELS {
            assert!(matches!(
                svc.rename_channel("app", name, "renamed"),
                Err(RolloutError::ProtectedChannel(_))
            ));
            assert!(matches!(
                svc.delete_channel("app", name),
                Err(RolloutError::ProtectedChannel(_))
            ));
        }
        assert!(matches!(
            svc.rename_channel("app", "beta", "staging"),
            Err(RolloutError::ProtectedChannel(_))
        ));
    }

    #[test]
    fn default_channel_cannot_be_deleted() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        svc.create_channel("app", "beta", None).unwrap();
        svc.set_default_channel("app", "beta").unwrap();

        assert!(matches!(
            svc.delete_channel("app", "beta"),
            Err(RolloutError::DefaultChannel(_))
        ));

        svc.set_default_channel("app", "production").unwrap();
        svc.delete_channel("app", "beta").unwrap();
        assert!(matches!(svc.get_channel("app", "beta"), Err(RolloutError::NotFound(_))));
    }

    #[test]
    fn rename_moves_default_pointer() {
        let (svc, _dir) = test_service();
        let beta = svc.create_channel("app", "beta", None).unwrap();
        let renamed = svc.rename_channel("app", "beta", "canary").unwrap();
        assert_eq!(renamed.id, beta.id);
        assert!(renamed.is_default);

        let resolved = svc.resolve_channel("app", None).unwrap().unwrap();
        assert_eq!(resolved.name, "canary");
        assert!(matches!(svc.get_channel("app", "beta"), Err(RolloutError::NotFound(_))));
    }

    #[test]
    fn exactly_one_default_after_mutations() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        for name in ["beta", "canary", "qa"] {
            svc.create_channel("app", name, None).unwrap();
        }

        svc.set_default_channel("app", "beta").unwrap();
        svc.set_default_channel("app", "canary").unwrap();
        svc.set_default_channel("app", "canary").unwrap();
        svc.rename_channel("app", "canary", "canary-2").unwrap();
        svc.delete_channel("app", "qa").unwrap();
        svc.set_default_channel("app", "staging").unwrap();
        svc.delete_channel("app", "beta").unwrap();

        assert_eq!(defaults(&svc, "app"), vec!["staging"]);
    }

    #[test]
    fn concurrent_default_swaps_leave_one_default() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let names: Vec<String> = (0..6).map(|i| format!("ch-{}", i)).collect();
        for name in &names {
            svc.create_channel("app", name, None).unwrap();
        }

        let handles: Vec<_> = names
            .iter()
            .cloned()
            .map(|name| {
                let svc = Arc::clone(&svc);
                std::thread::spawn(move || svc.set_default_channel("app", &name))
            })
            .collect();
        for h in handles {
            match h.join().unwrap() {
                Ok(_) => {}
                Err(e) => assert!(e.is_retryable(), "unexpected error: {}", e),
            }
        }

        let defaults = defaults(&svc, "app");
        assert_eq!(defaults.len(), 1);
        let pointer = svc.resolve_channel("app", None).unwrap().unwrap();
        assert_eq!(pointer.name, defaults[0]);
    }

    #[test]
    fn targeting_can_be_set_and_cleared() {
        let (svc, _dir) = test_service();
        svc.ensure_default_channels("app").unwrap();
        let rules: TargetingRuleSet = serde_json::from_value(json!({
            "match": "all",
            "rules": [{"field": "platform", "op": "eq", "value": "ios"}]
        }))
        .unwrap();

        let updated = svc.set_channel_targeting("app", "staging", Some(rules.clone())).unwrap();
        assert_eq!(updated.targeting_rules, Some(rules));
        let cleared = svc.set_channel_targeting("app", "staging", None).unwrap();
        assert!(cleared.targeting_rules.is_none());
    }
}
