//! Targeting rule types.
//!
//! On the wire a rule is `{"field": .., "op": .., "value": ..}` (`operator`
//! is accepted as an alias for `op`). Deserialization turns it into the closed
//! [`RuleOp`] set; anything that does not fit becomes [`RuleOp::Unsupported`]
//! so that a stored row with an unknown operator still loads and then fails
//! closed at evaluation. Writes go through [`TargetingRuleSet::validate`],
//! which refuses `Unsupported` outright.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Every rule must pass; an empty list passes.
    #[default]
    All,
    /// At least one rule must pass; an empty list targets nothing.
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TargetingRuleSet {
    #[serde(rename = "match", default)]
    pub match_mode: MatchMode,

    #[serde(default)]
    pub rules: Vec<TargetingRule>,
}

impl TargetingRuleSet {
    pub fn all(rules: Vec<TargetingRule>) -> Self {
        Self { match_mode: MatchMode::All, rules }
    }

    pub fn any(rules: Vec<TargetingRule>) -> Self {
        Self { match_mode: MatchMode::Any, rules }
    }

    /// Reject rule sets that would only ever fail closed.
    pub fn validate(&self) -> Result<(), String> {
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.field.trim().is_empty() && !rule.op.is_semver() {
                return Err(format!("rule {}: field is required", i));
            }
            if let RuleOp::Unsupported { op, value } = &rule.op {
                return Err(format!(
                    "rule {}: unsupported operator {:?} with value {}",
                    i, op, value
                ));
            }
        }
        Ok(())
    }

    /// Parse and validate a rule set supplied by an admin request.
    pub fn from_json(value: Value) -> Result<Self, String> {
        let set: Self = serde_json::from_value(value).map_err(|e| e.to_string())?;
        set.validate()?;
        Ok(set)
    }
}

/// A single predicate over one device attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRule", into = "RawRule")]
pub struct TargetingRule {
    /// Device attribute name. For semver operators an empty field means `appVersion`.
    pub field: String,
    pub op: RuleOp,
}

impl TargetingRule {
    pub fn new(field: impl Into<String>, op: RuleOp) -> Self {
        Self { field: field.into(), op }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOp {
    /// String equality.
    Eq(String),
    /// Attribute is one of the listed strings.
    In(Vec<String>),
    /// Attribute, read as a number, is >= the threshold.
    Gte(f64),
    /// Attribute, read as a number, is <= the threshold.
    Lte(f64),
    /// Attribute, read as a version, is >= the given version.
    SemverGte(String),
    /// Attribute, read as a version, is <= the given version.
    SemverLte(String),
    /// Unknown operator or a value of the wrong shape. Never matches.
    Unsupported { op: String, value: Value },
}

impl RuleOp {
    pub fn name(&self) -> &str {
        match self {
            Self::Eq(_) => "eq",
            Self::In(_) => "in",
            Self::Gte(_) => "gte",
            Self::Lte(_) => "lte",
            Self::SemverGte(_) => "semver_gte",
            Self::SemverLte(_) => "semver_lte",
            Self::Unsupported { op, .. } => op,
        }
    }

    fn is_semver(&self) -> bool {
        matches!(self, Self::SemverGte(_) | Self::SemverLte(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRule {
    #[serde(default)]
    field: String,
    #[serde(alias = "operator")]
    op: String,
    #[serde(default)]
    value: Value,
}

/// Scalars are accepted as strings; numbers and bools are stringified.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|f| f.is_finite())
}

impl From<RawRule> for TargetingRule {
    fn from(raw: RawRule) -> Self {
        let parsed = match raw.op.as_str() {
            "eq" => scalar_string(&raw.value).map(RuleOp::Eq),
            "in" => raw.value.as_array().and_then(|items| {
                items
                    .iter()
                    .map(scalar_string)
                    .collect::<Option<Vec<_>>>()
                    .map(RuleOp::In)
            }),
            "gte" => number(&raw.value).map(RuleOp::Gte),
            "lte" => number(&raw.value).map(RuleOp::Lte),
            "semver_gte" => raw.value.as_str().map(|s| RuleOp::SemverGte(s.to_string())),
            "semver_lte" => raw.value.as_str().map(|s| RuleOp::SemverLte(s.to_string())),
            _ => None,
        };

        let op = parsed.unwrap_or_else(|| RuleOp::Unsupported {
            op: raw.op.clone(),
            value: raw.value.clone(),
        });
        TargetingRule { field: raw.field, op }
    }
}

impl From<TargetingRule> for RawRule {
    fn from(rule: TargetingRule) -> Self {
        let name = rule.op.name().to_string();
        let value = match rule.op {
            RuleOp::Eq(s) | RuleOp::SemverGte(s) | RuleOp::SemverLte(s) => Value::String(s),
            RuleOp::In(items) => Value::Array(items.into_iter().map(Value::String).collect()),
            RuleOp::Gte(n) | RuleOp::Lte(n) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            RuleOp::Unsupported { value, .. } => value,
        };
        RawRule { field: rule.field, op: name, value }
    }
}
