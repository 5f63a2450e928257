//! Device-facing commands: check-ins, outcomes, rollback blocks.

use anyhow::Result;

use rollout::RolloutService;
use rollout::model::{DeviceCheckIn, InstallOutcome, RollbackReason};

use super::{print_json, read_json_arg};

/// Run a check-in and print the decision.
pub fn check(svc: &RolloutService, check_in: &str) -> Result<()> {
    let check_in: DeviceCheckIn = serde_json::from_value(read_json_arg(check_in)?)?;
    let decision = svc.decide(&check_in)?;
    print_json(&decision)
}

/// Build an outcome from its command-line spelling: `applied`, `confirmed`,
/// or a rollback reason such as `crash_detected`.
pub fn parse_outcome(
    outcome: &str,
    report_id: Option<String>,
    previous_version: Option<String>,
) -> Result<InstallOutcome> {
    match outcome {
        "applied" => Ok(InstallOutcome::Applied),
        "confirmed" => Ok(InstallOutcome::Confirmed),
        other => {
            let reason: RollbackReason = serde_json::from_value(serde_json::Value::from(other))
                .map_err(|_| {
                    anyhow::anyhow!(
                        "unknown outcome \"{}\" (expected applied, confirmed, crash_detected, health_check_failed, hash_mismatch or manual)",
                        other
                    )
                })?;
            Ok(InstallOutcome::Failed {
                report_id,
                reason,
                previous_version,
            })
        }
    }
}

pub fn report(svc: &RolloutService, device: &str, release: &str, outcome: InstallOutcome) -> Result<()> {
    let record = svc.report_outcome(device, release, outcome)?;
    print_json(&record)
}

pub fn state(svc: &RolloutService, device: &str, release: &str) -> Result<()> {
    match svc.device_release_state(device, release)? {
        Some(record) => print_json(&record),
        None => {
            println!("Release {} was never served to device {}.", release, device);
            Ok(())
        }
    }
}

pub fn clear_rollback(svc: &RolloutService, device: &str, release: &str) -> Result<()> {
    svc.clear_rollback(device, release)?;
    println!("Rollback block on release {} cleared for device {}.", release, device);
    Ok(())
}

pub fn health(svc: &RolloutService, release: &str, json: bool) -> Result<()> {
    let health = svc.release_health(release)?;
    if json {
        return print_json(&health);
    }
    println!("Release:  {}", health.release_id);
    println!("Reports:  {}", health.total_reports);
    println!("Devices:  {}", health.distinct_devices);
    for (reason, count) in &health.by_reason {
        println!("  {:22} {}", reason.as_str(), count);
    }
    Ok(())
}
