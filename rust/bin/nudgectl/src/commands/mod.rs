pub mod channel;
pub mod device;
pub mod release;

use anyhow::Result;
use serde::Serialize;

use rollout::model::TargetingRuleSet;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Read a JSON argument, or a file when it starts with `@`.
pub(crate) fn read_json_arg(arg: &str) -> Result<serde_json::Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

/// Parse and validate a `--rules` argument.
pub(crate) fn parse_rules(arg: Option<&str>) -> Result<Option<TargetingRuleSet>> {
    match arg {
        Some(raw) => {
            let value = read_json_arg(raw)?;
            let rules = TargetingRuleSet::from_json(value)
                .map_err(|e| anyhow::anyhow!("invalid targeting rules: {}", e))?;
            Ok(Some(rules))
        }
        None => Ok(None),
    }
}

pub(crate) fn or_dash(value: Option<&str>) -> &str {
    value.filter(|s| !s.is_empty()).unwrap_or("-")
}
