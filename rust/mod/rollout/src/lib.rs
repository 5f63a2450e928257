//! OTA release resolution and rollout safety.
//!
//! Given a device check-in, [`RolloutService::decide`] picks the newest
//! release the device may have on its channel, gated by OS floor, targeting
//! rules, a deterministic rollout bucket and per-device rollback blocks.
//! [`RolloutService::report_outcome`] feeds install signals back into the
//! per-(device, release) state machine that produces those blocks.
//!
//! All state lives in a [`bundlenudge_kv::KVStore`]; the service itself is
//! stateless between calls.

pub mod bucket;
pub mod error;
pub mod model;
pub mod service;
pub mod store;
pub mod targeting;
pub mod version;

pub use error::RolloutError;
pub use service::release::CreateRelease;
pub use service::{RolloutConfig, RolloutService};
pub use store::RolloutStore;
