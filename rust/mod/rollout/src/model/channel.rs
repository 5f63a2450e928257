use serde::{Deserialize, Serialize};

use super::targeting::TargetingRuleSet;

/// Channels every app is seeded with. They can never be renamed or deleted.
pub const PROTECTED_CHANNELS: [&str; 3] = ["production", "staging", "development"];

/// The channel that starts out as an app's default.
pub const INITIAL_DEFAULT_CHANNEL: &str = "production";

const MAX_NAME_LEN: usize = 63;

/// A named release track within an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,

    pub app_id: String,

    /// Lowercase/hyphen slug, unique per app.
    pub name: String,

    /// Mirror of the app's default pointer, kept in sync in the same commit.
    #[serde(default)]
    pub is_default: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting_rules: Option<TargetingRuleSet>,

    /// The release most recently put into rollout on this channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_release_id: Option<String>,

    pub created_at: String,

    pub updated_at: String,
}

pub fn is_protected(name: &str) -> bool {
    PROTECTED_CHANNELS.contains(&name)
}

/// Validate a channel slug: `[a-z0-9-]`, 1..=63 chars, no leading or
/// trailing hyphen.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(format!(
            "channel name must be 1..={} characters, got {}",
            MAX_NAME_LEN,
            name.len()
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "channel name {:?} may only contain lowercase letters, digits and '-'",
            name
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!("channel name {:?} cannot start or end with '-'", name));
    }
    Ok(())
}
