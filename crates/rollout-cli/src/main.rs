use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rollout_installer::{AgentConfig, UpdateContext, UpdateOutcome, UpdateResult};
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/rollout/rollout.toml";

#[derive(Parser, Debug)]
#[command(name = "rollout")]
#[command(about = "Standalone device update agent", long_about = None)]
struct Cli {
    /// Config file path (missing file means defaults).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the data directory from config/environment.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install an update artifact from a local path.
    Install { src: String },
    /// Commit the update that is in progress.
    Commit,
    /// Roll back the update that is in progress.
    Rollback,
    /// Print the name of the currently installed artifact.
    ShowArtifact,
    /// Print the currently committed provides, one key=value per line.
    ShowProvides,
    /// List the installed update modules.
    Modules,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("ROLLOUT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::load(Path::new(DEFAULT_CONFIG_PATH))?,
    };
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir;
    }

    let ctx = UpdateContext::open(&config)?;

    match cli.command {
        Commands::Install { src } => Ok(report(rollout_installer::install(&ctx, &src))),
        Commands::Commit => Ok(report(rollout_installer::commit(&ctx))),
        Commands::Rollback => Ok(report(rollout_installer::rollback(&ctx))),
        Commands::ShowArtifact => {
            let provides = ctx.load_provides()?;
            match provides.get("artifact_name") {
                Some(name) if !name.is_empty() => println!("{name}"),
                _ => println!("unknown"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::ShowProvides => {
            for (key, value) in ctx.load_provides()? {
                println!("{key}={value}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Modules => {
            for name in rollout_modules::discover_modules(&ctx.layout().modules_dir())? {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report(outcome: UpdateOutcome) -> ExitCode {
    if let Some(err) = &outcome.error {
        error!("{err}");
    }
    for line in result_messages(outcome.result) {
        println!("{line}");
    }
    if outcome.result.is_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

const REBOOT_LINE: &str = "At least one payload requested a reboot of the device it updated.";
const INCONSISTENT_LINE: &str = "System may be in an inconsistent state.";

fn result_messages(result: UpdateResult) -> Vec<&'static str> {
    match result {
        UpdateResult::FailedNothingDone => vec!["Installation failed. System not modified."],
        UpdateResult::NoUpdateInProgress => vec!["No update in progress."],
        UpdateResult::Installed => vec![
            "Installed, but not committed.",
            "Use 'commit' to update, or 'rollback' to roll back the update.",
        ],
        UpdateResult::InstalledRebootRequired => vec![
            "Installed, but not committed.",
            "Use 'commit' to update, or 'rollback' to roll back the update.",
            REBOOT_LINE,
        ],
        UpdateResult::InstalledAndCommitted => vec!["Installed and committed."],
        UpdateResult::InstalledAndCommittedRebootRequired => {
            vec!["Installed and committed.", REBOOT_LINE]
        }
        UpdateResult::Committed => vec!["Committed."],
        UpdateResult::InstalledButFailedInPostCommit => {
            vec!["Installed and committed, but one or more post-commit steps failed."]
        }
        UpdateResult::NoRollback => vec![
            "Update Module does not support rollback.",
            INCONSISTENT_LINE,
        ],
        UpdateResult::RolledBack => vec!["Rolled back."],
        UpdateResult::RollbackFailed => vec!["Rollback failed.", INCONSISTENT_LINE],
        UpdateResult::FailedAndRolledBack => vec!["Installation failed.", "Rolled back."],
        UpdateResult::FailedAndNoRollback => vec![
            "Installation failed, and the Update Module does not support rollback.",
            INCONSISTENT_LINE,
        ],
        UpdateResult::FailedAndRollbackFailed => vec![
            "Installation failed, and rollback also failed.",
            INCONSISTENT_LINE,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn every_result_has_a_message() {
        let results = [
            UpdateResult::FailedNothingDone,
            UpdateResult::NoUpdateInProgress,
            UpdateResult::Installed,
            UpdateResult::InstalledRebootRequired,
            UpdateResult::InstalledAndCommitted,
            UpdateResult::InstalledAndCommittedRebootRequired,
            UpdateResult::Committed,
            UpdateResult::InstalledButFailedInPostCommit,
            UpdateResult::NoRollback,
            UpdateResult::RolledBack,
            UpdateResult::RollbackFailed,
            UpdateResult::FailedAndRolledBack,
            UpdateResult::FailedAndNoRollback,
            UpdateResult::FailedAndRollbackFailed,
        ];
        for result in results {
            assert!(!result_messages(result).is_empty());
        }
    }

    #[test]
    fn reboot_results_mention_the_reboot_request() {
        assert!(result_messages(UpdateResult::InstalledRebootRequired).contains(&REBOOT_LINE));
        assert!(
            result_messages(UpdateResult::InstalledAndCommittedRebootRequired)
                .contains(&REBOOT_LINE)
        );
    }
}
