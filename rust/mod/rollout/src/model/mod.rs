pub mod channel;
pub mod decision;
pub mod device;
pub mod release;
pub mod rollback;
pub mod targeting;

pub use channel::Channel;
pub use decision::{DecisionReason, RolloutDecision};
pub use device::{Attributes, DeviceCheckIn};
pub use release::{Release, ReleaseStatus, SERVING_STATUSES};
pub use rollback::{
    DeviceReleaseRecord, DeviceReleaseState, InstallOutcome, ReleaseHealth, RollbackReason,
    RollbackReport,
};
pub use targeting::{MatchMode, RuleOp, TargetingRule, TargetingRuleSet};
