pub mod channel;
pub mod decision;
pub mod release;
pub mod rollback;

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use bundlenudge_kv::KVStore;

use crate::error::RolloutError;
use crate::store::RolloutStore;

/// Configuration for the rollout engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Consecutive failed starts that roll a release back on a device.
    pub failure_threshold: u32,
    /// How long an applied bundle may stay unconfirmed, in seconds.
    pub confirmation_timeout_secs: i64,
    /// Attempts for conditional writes that must not be dropped.
    pub max_commit_attempts: u32,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            confirmation_timeout_secs: 300, // 5 min
            max_commit_attempts: 5,
        }
    }
}

/// The rollout engine. Holds no state between calls beyond the store handle,
/// so any number of instances may serve the same data.
pub struct RolloutService {
    pub(crate) store: RolloutStore,
    pub(crate) config: RolloutConfig,
}

impl RolloutService {
    pub fn new(kv: Arc<dyn KVStore>, config: RolloutConfig) -> Arc<Self> {
        Arc::new(Self {
            store: RolloutStore::new(kv),
            config,
        })
    }

    /// Access the underlying store.
    pub fn store(&self) -> &RolloutStore {
        &self.store
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Run `attempt` until it commits. `Ok(None)` from the closure means its
    /// conditional write lost a race and it should re-read and try again.
    pub(crate) fn with_retries<T>(
        &self,
        what: &str,
        mut attempt: impl FnMut() -> Result<Option<T>, RolloutError>,
    ) -> Result<T, RolloutError> {
        let attempts = self.config.max_commit_attempts.max(1);
        for n in 1..=attempts {
            if let Some(done) = attempt()? {
                return Ok(done);
            }
            debug!("rollout: {} lost a write race (attempt {}/{})", what, n, attempts);
        }
        Err(RolloutError::Conflict(format!(
            "{}: gave up after {} attempts",
            what, attempts
        )))
    }
}


#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::testutil::test_service;
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = RolloutConfig::default();
        assert_eq!(cfg.failure_threshold, 3);
        assert_eq!(cfg.confirmation_timeout_secs, 300);
        assert_eq!(cfg.max_commit_attempts, 5);
    }

    #[test]
    fn retries_until_commit() {
        let (svc, _dir) = test_service();
        let calls = Cell::new(0);
        let out = svc
            .with_retries("test", || {
                calls.set(calls.get() + 1);
                Ok((calls.get() == 3).then_some("done"))
            })
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_with_retryable_conflict() {
        let (svc, _dir) = test_service();
        let err = svc
            .with_retries::<()>("always losing", || Ok(None))
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
