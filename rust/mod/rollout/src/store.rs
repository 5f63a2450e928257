//! Persistent storage for the rollout engine, backed by a `KVStore`.
//!
//! Key layout:
//!
//! ```text
//! rollout:release:{release}                              Release
//! rollout:channel_release:{app}:{channel_id}:{release}   ""           (index)
//! rollout:channel:{app}:{name}                           Channel
//! rollout:default:{app}                                  "name"       (default pointer)
//! rollout:device:{device}:{release}                      DeviceReleaseRecord
//! rollout:report:{report}                                RollbackReport (append-only)
//! rollout:release_report:{release}:{report}              RollbackReport (index copy)
//! rollout:marker:{marker}                                timestamp    (idempotency)
//! ```
//!
//! Ids are opaque, so prefix scans may pick up rows of a longer id sharing the
//! prefix; every scan re-checks the decoded row's own ids.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use bundlenudge_core::now_rfc3339;
use bundlenudge_kv::{Check, KVStore, Write};

use crate::error::RolloutError;
use crate::model::{Channel, DeviceReleaseRecord, Release, ReleaseStatus, RollbackReport};
use crate::version;

pub(crate) fn release_key(release_id: &str) -> String {
    format!("rollout:release:{}", release_id)
}

fn channel_release_prefix(app_id: &str, channel_id: &str) -> String {
    format!("rollout:channel_release:{}:{}:", app_id, channel_id)
}

pub(crate) fn channel_release_key(app_id: &str, channel_id: &str, release_id: &str) -> String {
    format!("{}{}", channel_release_prefix(app_id, channel_id), release_id)
}

pub(crate) fn channel_key(app_id: &str, name: &str) -> String {
    format!("rollout:channel:{}:{}", app_id, name)
}

fn channel_prefix(app_id: &str) -> String {
    format!("rollout:channel:{}:", app_id)
}

pub(crate) fn default_key(app_id: &str) -> String {
    format!("rollout:default:{}", app_id)
}

pub(crate) fn device_key(device_id: &str, release_id: &str) -> String {
    format!("rollout:device:{}:{}", device_id, release_id)
}

fn device_prefix(device_id: &str) -> String {
    format!("rollout:device:{}:", device_id)
}

/// Report ids come from devices, so they are only unique per (device, release).
pub(crate) fn report_key(device_id: &str, release_id: &str, report_id: &str) -> String {
    format!("rollout:report:{}:{}:{}", device_id, release_id, report_id)
}

fn release_report_prefix(release_id: &str) -> String {
    format!("rollout:release_report:{}:", release_id)
}

pub(crate) fn release_report_key(report: &RollbackReport) -> String {
    format!(
        "{}{}:{}",
        release_report_prefix(&report.release_id),
        report.device_id,
        report.id
    )
}

pub(crate) fn marker_key(marker: &str) -> String {
    format!("rollout:marker:{}", marker)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RolloutError> {
    serde_json::to_vec(value).map_err(|e| RolloutError::Internal(format!("serialize: {}", e)))
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, RolloutError> {
    serde_json::from_slice(bytes)
        .map_err(|e| RolloutError::Internal(format!("deserialize {}: {}", key, e)))
}

/// A decoded row plus the exact bytes it was decoded from, so a later commit
/// can require that nobody changed it in between.
#[derive(Debug, Clone)]
pub struct Stored<T> {
    pub value: T,
    raw: Vec<u8>,
}

impl<T> Stored<T> {
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// A set of preconditions and writes applied atomically by [`RolloutStore::apply`].
#[derive(Debug, Default)]
pub struct Commit {
    checks: Vec<(String, Option<Vec<u8>>)>,
    writes: Vec<(String, Option<Vec<u8>>)>,
}

impl Commit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to still hold the bytes of `row` (or be absent for None).
    pub fn expect<T>(mut self, key: String, row: Option<&Stored<T>>) -> Self {
        self.checks.push((key, row.map(|r| r.raw.clone())));
        self
    }

    pub fn expect_absent(mut self, key: String) -> Self {
        self.checks.push((key, None));
        self
    }

    pub fn put<T: Serialize>(mut self, key: String, value: &T) -> Result<Self, RolloutError> {
        self.writes.push((key, Some(encode(value)?)));
        Ok(self)
    }

    pub fn delete(mut self, key: String) -> Self {
        self.writes.push((key, None));
        self
    }
}

/// Persistence adapter over a generic `KVStore`.
pub struct RolloutStore {
    kv: Arc<dyn KVStore>,
}

impl RolloutStore {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self { kv }
    }

    /// Apply a commit. `Ok(false)` means a precondition failed and nothing was written.
    pub fn apply(&self, commit: Commit) -> Result<bool, RolloutError> {
        let checks: Vec<Check<'_>> = commit
            .checks
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
            .collect();
        let writes: Vec<Write<'_>> = commit
            .writes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
            .collect();
        Ok(self.kv.commit_if(&checks, &writes)?)
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Stored<T>>, RolloutError> {
        match self.kv.get(key)? {
            Some(raw) => Ok(Some(Stored {
                value: decode(key, &raw)?,
                raw,
            })),
            None => Ok(None),
        }
    }

    /// Decode every row under a prefix, skipping (and logging) rows that fail.
    fn scan_lenient<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<Stored<T>>, RolloutError> {
        let mut rows = Vec::new();
        for (key, raw) in self.kv.scan(prefix)? {
            match serde_json::from_slice(&raw) {
                Ok(value) => rows.push(Stored { value, raw }),
                Err(e) => warn!("rollout store: skipping undecodable row {}: {}", key, e),
            }
        }
        Ok(rows)
    }

    pub fn exists(&self, key: &str) -> Result<bool, RolloutError> {
        Ok(self.kv.get(key)?.is_some())
    }

    // ── Releases ──

    pub fn get_release(&self, release_id: &str) -> Result<Option<Stored<Release>>, RolloutError> {
        self.load(&release_key(release_id))
    }

    /// Insert a new release and its channel index entry.
    pub fn insert_release(&self, release: &Release) -> Result<bool, RolloutError> {
        let commit = Commit::new()
            .expect_absent(release_key(&release.id))
            .put(release_key(&release.id), release)?
            .put(
                channel_release_key(&release.app_id, &release.channel_id, &release.id),
                &"",
            )?;
        self.apply(commit)
    }

    /// Every release indexed under a channel, in no particular order.
    pub fn list_channel_releases(
        &self,
        app_id: &str,
        channel_id: &str,
    ) -> Result<Vec<Stored<Release>>, RolloutError> {
        let prefix = channel_release_prefix(app_id, channel_id);
        let mut releases = Vec::new();
        for (key, _) in self.kv.scan(&prefix)? {
            let release_id = &key[prefix.len()..];
            let raw = match self.kv.get(&release_key(release_id))? {
                Some(raw) => raw,
                None => {
                    warn!("rollout store: index {} points at a missing release", key);
                    continue;
                }
            };
            match serde_json::from_slice::<Release>(&raw) {
                Ok(value) if value.app_id == app_id && value.channel_id == channel_id => {
                    releases.push(Stored { value, raw });
                }
                Ok(_) => {}
                Err(e) => warn!("rollout store: skipping undecodable release {}: {}", release_id, e),
            }
        }
        Ok(releases)
    }

    /// Releases on a channel whose status is in `statuses`, highest version
    /// first; equal versions fall back to newest `created_at` first.
    pub fn list_candidate_releases(
        &self,
        app_id: &str,
        channel_id: &str,
        statuses: &[ReleaseStatus],
    ) -> Result<Vec<Release>, RolloutError> {
        let mut candidates: Vec<Release> = self
            .list_channel_releases(app_id, channel_id)?
            .into_iter()
            .map(|s| s.value)
            .filter(|r| statuses.contains(&r.status))
            .collect();
        candidates.sort_by(|a, b| match version::compare(&b.version, &a.version) {
            Ordering::Equal => b.created_at.cmp(&a.created_at),
            other => other,
        });
        Ok(candidates)
    }

    // ── Channels ──

    pub fn get_channel(&self, app_id: &str, name: &str) -> Result<Option<Stored<Channel>>, RolloutError> {
        self.load(&channel_key(app_id, name))
    }

    pub fn list_channels(&self, app_id: &str) -> Result<Vec<Stored<Channel>>, RolloutError> {
        let mut channels: Vec<Stored<Channel>> = self.scan_lenient(&channel_prefix(app_id))?;
        channels.retain(|c| c.value.app_id == app_id);
        Ok(channels)
    }

    /// The app's default pointer: the name of its default channel.
    pub fn default_pointer(&self, app_id: &str) -> Result<Option<Stored<String>>, RolloutError> {
        self.load(&default_key(app_id))
    }

    /// The app's default channel, following the default pointer.
    pub fn get_default_channel(&self, app_id: &str) -> Result<Option<Stored<Channel>>, RolloutError> {
        match self.default_pointer(app_id)? {
            Some(pointer) => {
                let channel = self.get_channel(app_id, &pointer.value)?;
                if channel.is_none() {
                    warn!(
                        "rollout store: default pointer of app {} names missing channel {}",
                        app_id, pointer.value
                    );
                }
                Ok(channel)
            }
            None => Ok(None),
        }
    }

    /// Make `name` the app's default channel in one conditional commit.
    ///
    /// The pointer, the outgoing default row and the incoming row are all
    /// preconditions, so of two concurrent swaps at most one lands; the loser
    /// gets a retryable `Conflict`.
    pub fn set_channel_default(&self, app_id: &str, name: &str) -> Result<Channel, RolloutError> {
        let target = self
            .get_channel(app_id, name)?
            .ok_or_else(|| RolloutError::NotFound(format!("channel {} of app {}", name, app_id)))?;
        let pointer = self.default_pointer(app_id)?;

        let already = pointer.as_ref().is_some_and(|p| p.value == name);
        if already && target.value.is_default {
            return Ok(target.value);
        }

        let now = now_rfc3339();
        let mut incoming = target.value.clone();
        incoming.is_default = true;
        incoming.updated_at = now.clone();

        let mut commit = Commit::new()
            .expect(default_key(app_id), pointer.as_ref())
            .expect(channel_key(app_id, name), Some(&target))
            .put(channel_key(app_id, name), &incoming)?
            .put(default_key(app_id), &name)?;

        if let Some(previous) = pointer.as_ref().filter(|p| p.value != name) {
            if let Some(outgoing) = self.get_channel(app_id, &previous.value)? {
                let mut cleared = outgoing.value.clone();
                cleared.is_default = false;
                cleared.updated_at = now;
                commit = commit
                    .expect(channel_key(app_id, &previous.value), Some(&outgoing))
                    .put(channel_key(app_id, &previous.value), &cleared)?;
            }
        }

        if !self.apply(commit)? {
            return Err(RolloutError::Conflict(format!(
                "default channel of app {} changed concurrently",
                app_id
            )));
        }
        Ok(incoming)
    }

    // ── Device state ──

    pub fn get_device_record(
        &self,
        device_id: &str,
        release_id: &str,
    ) -> Result<Option<Stored<DeviceReleaseRecord>>, RolloutError> {
        self.load(&device_key(device_id, release_id))
    }

    pub fn list_device_records(&self, device_id: &str) -> Result<Vec<Stored<DeviceReleaseRecord>>, RolloutError> {
        let mut records: Vec<Stored<DeviceReleaseRecord>> = self.scan_lenient(&device_prefix(device_id))?;
        records.retain(|r| r.value.device_id == device_id);
        Ok(records)
    }

    /// Consecutive failed starts recorded for the pair.
    pub fn failure_count(&self, device_id: &str, release_id: &str) -> Result<u32, RolloutError> {
        Ok(self
            .get_device_record(device_id, release_id)?
            .map(|r| r.value.failure_count)
            .unwrap_or(0))
    }

    /// Conditionally replace a pair's record. `expected` is the row the caller
    /// read; None means the pair must have no record yet.
    pub fn set_device_release_state(
        &self,
        record: &DeviceReleaseRecord,
        expected: Option<&Stored<DeviceReleaseRecord>>,
    ) -> Result<bool, RolloutError> {
        let key = device_key(&record.device_id, &record.release_id);
        let commit = Commit::new().expect(key.clone(), expected).put(key, record)?;
        self.apply(commit)
    }

    // ── Reports ──

    pub fn get_report(
        &self,
        device_id: &str,
        release_id: &str,
        report_id: &str,
    ) -> Result<Option<RollbackReport>, RolloutError> {
        Ok(self
            .load(&report_key(device_id, release_id, report_id))?
            .map(|s: Stored<RollbackReport>| s.value))
    }

    /// Append a report on its own, without touching any counter.
    /// Returns false when the device already filed a report with this id
    /// against the same release.
    pub fn record_rollback_report(&self, report: &RollbackReport) -> Result<bool, RolloutError> {
        let key = report_key(&report.device_id, &report.release_id, &report.id);
        let commit = Commit::new()
            .expect_absent(key.clone())
            .put(key, report)?
            .put(release_report_key(report), report)?;
        self.apply(commit)
    }

    pub fn list_release_reports(&self, release_id: &str) -> Result<Vec<RollbackReport>, RolloutError> {
        Ok(self
            .scan_lenient::<RollbackReport>(&release_report_prefix(release_id))?
            .into_iter()
            .map(|s| s.value)
            .filter(|r| r.release_id == release_id)
            .collect())
    }
}
