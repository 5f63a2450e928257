//! Targeting rule evaluation.
//!
//! Evaluation never errors and is never more permissive on bad configuration
//! than on missing data: a missing attribute, an unparsable number or an
//! unsupported operator all make that rule fail.

use crate::model::{Attributes, MatchMode, RuleOp, TargetingRule, TargetingRuleSet};
use crate::version;

/// Field semver operators read when the rule names none.
const DEFAULT_SEMVER_FIELD: &str = "appVersion";

/// Evaluate a rule set against a device.
pub fn evaluate(rule_set: &TargetingRuleSet, device: &impl Attributes) -> bool {
    match rule_set.match_mode {
        MatchMode::All => rule_set.rules.iter().all(|r| evaluate_rule(r, device)),
        MatchMode::Any => rule_set.rules.iter().any(|r| evaluate_rule(r, device)),
    }
}

/// Evaluate an optional rule set; no rules means everyone is targeted.
pub fn evaluate_optional(rule_set: Option<&TargetingRuleSet>, device: &impl Attributes) -> bool {
    rule_set.is_none_or(|rs| evaluate(rs, device))
}

/// Evaluate a single rule.
pub fn evaluate_rule(rule: &TargetingRule, device: &impl Attributes) -> bool {
    let field = match &rule.op {
        RuleOp::SemverGte(_) | RuleOp::SemverLte(_) if rule.field.trim().is_empty() => {
            DEFAULT_SEMVER_FIELD
        }
        _ => rule.field.as_str(),
    };

    let Some(actual) = device.attribute(field) else {
        return false;
    };

    match &rule.op {
        RuleOp::Eq(expected) => actual == expected,
        RuleOp::In(allowed) => allowed.iter().any(|v| v == actual),
        RuleOp::Gte(threshold) => as_number(actual).is_some_and(|n| n >= *threshold),
        RuleOp::Lte(threshold) => as_number(actual).is_some_and(|n| n <= *threshold),
        RuleOp::SemverGte(min) => version::gte(actual, min),
        RuleOp::SemverLte(max) => version::lte(actual, max),
        RuleOp::Unsupported { op, .. } => {
            tracing::debug!("targeting: unsupported operator {:?} on {:?} fails closed", op, field);
            false
        }
    }
}

fn as_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}
