//! `nudgectl`: operator CLI for the rollout engine.
//!
//! Works directly against a local store: seed and manage channels, move
//! releases through their lifecycle, replay device check-ins and outcomes,
//! and lift rollback blocks.

mod commands;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::debug;

use bundlenudge_kv::{KVStore, RedbStore};
use rollout::{CreateRelease, RolloutService};

use commands::release::Transition;
use config::CtlConfig;

/// Rollout engine CLI.
#[derive(Parser, Debug)]
#[command(name = "nudgectl", about = "BundleNudge rollout engine CLI")]
struct Cli {
    /// Path to config file (default: ~/.bundlenudge/nudgectl.toml).
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides [storage] data_dir).
    #[arg(long = "data-dir", global = true)]
    data_dir: Option<PathBuf>,

    /// Database file (overrides [storage] db_path).
    #[arg(long = "db", global = true)]
    db: Option<PathBuf>,

    /// Output format: table or json.
    #[arg(long = "output", short = 'o', global = true, default_value = "table")]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Channel administration.
    Channel {
        #[command(subcommand)]
        action: ChannelAction,
    },

    /// Release lifecycle.
    Release {
        #[command(subcommand)]
        action: ReleaseAction,
    },

    /// Run an update check and print the decision.
    Check {
        /// DeviceCheckIn JSON, or @file.
        check_in: String,
    },

    /// Report an install outcome for a served release.
    Report {
        device: String,
        release: String,
        /// applied, confirmed, crash_detected, health_check_failed, hash_mismatch or manual.
        outcome: String,
        /// Idempotency id for failure reports.
        #[arg(long)]
        report_id: Option<String>,
        /// Version the device fell back to.
        #[arg(long)]
        previous_version: Option<String>,
    },

    /// Show the state of a (device, release) pair.
    State { device: String, release: String },

    /// Lift a rollback block so the release can be served to the device again.
    #[command(name = "clear-rollback")]
    ClearRollback { device: String, release: String },

    /// Summarize rollback reports against a release.
    Health { release: String },

    /// Show version.
    Version,
}

#[derive(Subcommand, Debug)]
enum ChannelAction {
    /// Seed production (default), staging and development.
    Init { app: String },
    /// List an app's channels; the default is marked with `*`.
    List { app: String },
    /// Create a channel.
    Create {
        app: String,
        name: String,
        /// Targeting rule set JSON, or @file.
        #[arg(long)]
        rules: Option<String>,
    },
    /// Rename a channel.
    Rename {
        app: String,
        name: String,
        new_name: String,
    },
    /// Delete a channel.
    Delete {
        app: String,
        name: String,
        /// Skip confirmation.
        #[arg(long = "yes", short = 'y')]
        yes: bool,
    },
    /// Make a channel the app's default.
    Default { app: String, name: String },
    /// Replace or clear a channel's targeting rules.
    Target {
        app: String,
        name: String,
        #[arg(long)]
        rules: Option<String>,
        #[arg(long, conflicts_with = "rules")]
        clear: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ReleaseAction {
    /// Create a draft release.
    Create {
        #[arg(long)]
        app: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        bundle: String,
        #[arg(long)]
        min_os: Option<String>,
        /// Targeting rule set JSON, or @file.
        #[arg(long)]
        rules: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show a release.
    Get { id: String },
    /// List a channel's releases.
    List { app: String, channel: String },
    /// Start rolling a draft out.
    Start {
        id: String,
        #[arg(long, default_value_t = 10)]
        percent: u8,
    },
    /// Raise the rollout percentage.
    Percent { id: String, percent: u8 },
    /// Serve to 100% and complete the previous active release.
    Promote { id: String },
    Pause { id: String },
    Resume { id: String },
    Disable { id: String },
    /// Mark a release as failed in the field.
    Fail { id: String },
}

fn open_service(cli: &Cli) -> anyhow::Result<Arc<RolloutService>> {
    let config_path = cli.config.clone().unwrap_or_else(CtlConfig::default_path);
    let config = CtlConfig::load(&config_path)?;
    let db_path = config
        .service_config(cli.data_dir.clone(), cli.db.clone())
        .resolve_db_path();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    debug!("opening store at {}", db_path.display());
    let kv: Arc<dyn KVStore> = Arc::new(RedbStore::open(&db_path)?);
    Ok(RolloutService::new(kv, config.rollout))
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    eprint!("{} [y/N]: ", prompt);
    let mut s = String::new();
    std::io::stdin().read_line(&mut s)?;
    Ok(s.trim().eq_ignore_ascii_case("y"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Version = cli.command {
        println!("nudgectl v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let json = cli.output == "json";
    let svc = open_service(&cli)?;

    match cli.command {
        Commands::Channel { action } => match action {
            ChannelAction::Init { app } => commands::channel::init(&svc, &app, json)?,
            ChannelAction::List { app } => commands::channel::list(&svc, &app, json)?,
            ChannelAction::Create { app, name, rules } => {
                commands::channel::create(&svc, &app, &name, rules.as_deref())?
            }
            ChannelAction::Rename { app, name, new_name } => {
                commands::channel::rename(&svc, &app, &name, &new_name)?
            }
            ChannelAction::Delete { app, name, yes } => {
                if !yes && !confirm(&format!("Delete channel \"{}\"?", name))? {
                    println!("Cancelled.");
                    return Ok(());
                }
                commands::channel::delete(&svc, &app, &name)?
            }
            ChannelAction::Default { app, name } => commands::channel::set_default(&svc, &app, &name)?,
            ChannelAction::Target {
                app,
                name,
                rules,
                clear,
            } => commands::channel::target(&svc, &app, &name, rules.as_deref(), clear)?,
        },

        Commands::Release { action } => match action {
            ReleaseAction::Create {
                app,
                channel,
                version,
                bundle,
                min_os,
                rules,
                notes,
            } => {
                let input = CreateRelease {
                    app_id: app,
                    channel,
                    version,
                    bundle_ref: bundle,
                    min_os_version: min_os,
                    targeting_rules: commands::parse_rules(rules.as_deref())?,
                    release_notes: notes,
                };
                commands::release::create(&svc, input, json)?
            }
            ReleaseAction::Get { id } => commands::release::get(&svc, &id)?,
            ReleaseAction::List { app, channel } => commands::release::list(&svc, &app, &channel, json)?,
            ReleaseAction::Start { id, percent } => commands::release::start(&svc, &id, percent)?,
            ReleaseAction::Percent { id, percent } => commands::release::set_percentage(&svc, &id, percent)?,
            ReleaseAction::Promote { id } => commands::release::transition(&svc, &id, Transition::Promote)?,
            ReleaseAction::Pause { id } => commands::release::transition(&svc, &id, Transition::Pause)?,
            ReleaseAction::Resume { id } => commands::release::transition(&svc, &id, Transition::Resume)?,
            ReleaseAction::Disable { id } => commands::release::transition(&svc, &id, Transition::Disable)?,
            ReleaseAction::Fail { id } => commands::release::transition(&svc, &id, Transition::Fail)?,
        },

        Commands::Check { check_in } => commands::device::check(&svc, &check_in)?,

        Commands::Report {
            device,
            release,
            outcome,
            report_id,
            previous_version,
        } => {
            let outcome = commands::device::parse_outcome(&outcome, report_id, previous_version)?;
            commands::device::report(&svc, &device, &release, outcome)?
        }

        Commands::State { device, release } => commands::device::state(&svc, &device, &release)?,

        Commands::ClearRollback { device, release } => {
            commands::device::clear_rollback(&svc, &device, &release)?
        }

        Commands::Health { release } => commands::device::health(&svc, &release, json)?,

        Commands::Version => unreachable!("handled before opening the store"),
    }

    Ok(())
}
