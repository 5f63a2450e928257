//! Channel administration commands.

use anyhow::Result;

use rollout::RolloutService;
use rollout::model::Channel;

use super::{or_dash, parse_rules, print_json};

fn print_table(channels: &[Channel]) {
    println!("{:2} {:20} {:34} {:8} {:34}", "", "NAME", "ID", "RULES", "ACTIVE RELEASE");
    for ch in channels {
        let marker = if ch.is_default { "*" } else { " " };
        let rules = ch
            .targeting_rules
            .as_ref()
            .map(|r| r.rules.len().to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:2} {:20} {:34} {:8} {:34}",
            marker,
            ch.name,
            ch.id,
            rules,
            or_dash(ch.active_release_id.as_deref())
        );
    }
}

/// Seed production/staging/development.
pub fn init(svc: &RolloutService, app: &str, json: bool) -> Result<()> {
    let channels = svc.ensure_default_channels(app)?;
    if json {
        return print_json(&channels);
    }
    print_table(&channels);
    Ok(())
}

pub fn list(svc: &RolloutService, app: &str, json: bool) -> Result<()> {
    let channels = svc.list_channels(app)?;
    if json {
        return print_json(&channels);
    }
    if channels.is_empty() {
        println!("No channels for app \"{}\".", app);
        println!("Run: nudgectl channel init {}", app);
        return Ok(());
    }
    print_table(&channels);
    Ok(())
}

pub fn create(svc: &RolloutService, app: &str, name: &str, rules: Option<&str>) -> Result<()> {
    let channel = svc.create_channel(app, name, parse_rules(rules)?)?;
    println!("Channel \"{}\" created.", channel.name);
    print_json(&channel)
}

pub fn rename(svc: &RolloutService, app: &str, name: &str, new_name: &str) -> Result<()> {
    svc.rename_channel(app, name, new_name)?;
    println!("Channel \"{}\" renamed to \"{}\".", name, new_name);
    Ok(())
}

pub fn delete(svc: &RolloutService, app: &str, name: &str) -> Result<()> {
    svc.delete_channel(app, name)?;
    println!("Channel \"{}\" deleted.", name);
    Ok(())
}

pub fn set_default(svc: &RolloutService, app: &str, name: &str) -> Result<()> {
    svc.set_default_channel(app, name)?;
    println!("Default channel of \"{}\" is now \"{}\".", app, name);
    Ok(())
}

pub fn target(svc: &RolloutService, app: &str, name: &str, rules: Option<&str>, clear: bool) -> Result<()> {
    if rules.is_none() && !clear {
        anyhow::bail!("Provide --rules or --clear.");
    }
    let channel = svc.set_channel_targeting(app, name, parse_rules(rules)?)?;
    println!("Channel \"{}\" targeting updated.", channel.name);
    print_json(&channel)
}
