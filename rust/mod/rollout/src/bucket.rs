//! Deterministic device → bucket mapping for staged rollouts.
//!
//! Algorithm v1, fixed so that any port produces identical buckets:
//!
//! ```text
//! digest = sha256(utf8(device_id) || ":" || utf8(release_id))
//! bucket = u32::from_be_bytes(digest[0..4]) % 100
//! ```
//!
//! The bucket depends only on the pair, never on the percentage, so raising a
//! release from 30% to 60% keeps every device that was already included.

use sha2::{Digest, Sha256};

/// Version of the bucketing algorithm above. Bump only with a migration plan:
/// changing it reshuffles every in-flight rollout.
pub const BUCKET_ALGORITHM_VERSION: u32 = 1;

/// Number of buckets; percentages are expressed against this.
pub const BUCKET_COUNT: u32 = 100;

/// Bucket in `[0, 100)` for a (device, release) pair.
pub fn bucket(device_id: &str, release_id: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hasher.update(b":");
    hasher.update(release_id.as_bytes());
    let digest = hasher.finalize();

    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    head % BUCKET_COUNT
}

/// Whether the device falls inside a rollout of `percentage` (0..=100).
pub fn is_included(device_id: &str, release_id: &str, percentage: u8) -> bool {
    bucket(device_id, release_id) < u32::from(percentage)
}
