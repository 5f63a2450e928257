//! Release lifecycle commands.

use anyhow::Result;

use rollout::model::Release;
use rollout::{CreateRelease, RolloutService};

use super::{or_dash, print_json};

/// Lifecycle moves that take only a release id.
#[derive(Debug, Clone, Copy)]
pub enum Transition {
    Promote,
    Pause,
    Resume,
    Disable,
    Fail,
}

pub fn create(svc: &RolloutService, input: CreateRelease, json: bool) -> Result<()> {
    let release = svc.create_release(input)?;
    if json {
        return print_json(&release);
    }
    println!("Release {} ({}) created as draft.", release.id, release.version);
    Ok(())
}

pub fn get(svc: &RolloutService, id: &str) -> Result<()> {
    print_json(&svc.get_release(id)?)
}

pub fn list(svc: &RolloutService, app: &str, channel: &str, json: bool) -> Result<()> {
    let releases = svc.list_releases(app, channel)?;
    if json {
        return print_json(&releases);
    }
    print_table(&releases);
    Ok(())
}

fn print_table(releases: &[Release]) {
    println!("{:34} {:12} {:10} {:>5} {:8}", "ID", "VERSION", "STATUS", "PCT", "MIN OS");
    for r in releases {
        println!(
            "{:34} {:12} {:10} {:>4}% {:8}",
            r.id,
            r.version,
            r.status.as_str(),
            r.rollout_percentage,
            or_dash(r.min_os_version.as_deref())
        );
    }
}

pub fn start(svc: &RolloutService, id: &str, percentage: u8) -> Result<()> {
    let release = svc.start_rollout(id, percentage)?;
    println!("Release {} rolling at {}%.", release.id, release.rollout_percentage);
    Ok(())
}

pub fn set_percentage(svc: &RolloutService, id: &str, percentage: u8) -> Result<()> {
    let release = svc.set_rollout_percentage(id, percentage)?;
    println!("Release {} now at {}%.", release.id, release.rollout_percentage);
    Ok(())
}

pub fn transition(svc: &RolloutService, id: &str, to: Transition) -> Result<()> {
    let release = match to {
        Transition::Promote => svc.promote(id)?,
        Transition::Pause => svc.pause(id)?,
        Transition::Resume => svc.resume(id)?,
        Transition::Disable => svc.disable(id)?,
        Transition::Fail => svc.mark_failed(id)?,
    };
    println!("Release {} is {}.", release.id, release.status);
    Ok(())
}
