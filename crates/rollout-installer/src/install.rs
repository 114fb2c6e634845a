use std::fs;

use rollout_artifact::{self as artifact, Artifact, ParserConfig};
use rollout_modules::{ModuleProvider, RebootAction, UpdateModule};
use tracing::error;

use crate::commit::do_commit;
use crate::context::UpdateContext;
use crate::rollback::installation_failure_handler;
use crate::state_data::{
    load_standalone_data, remove_standalone_data, save_standalone_data,
    standalone_data_from_header, StandaloneData,
};
use crate::{ErrorKind, UpdateError, UpdateOutcome, UpdateResult};

/// Installs the artifact at the local path `src`. Exactly one update may be
/// in flight; a present state record rejects the call before anything runs.
pub fn install(ctx: &UpdateContext, src: &str) -> UpdateOutcome {
    let modules = match ctx.process_modules() {
        Ok(modules) => modules,
        Err(err) => return UpdateOutcome::failed_nothing_done(err),
    };
    install_with_modules(ctx, src, &modules)
}

pub fn install_with_modules(
    ctx: &UpdateContext,
    src: &str,
    modules: &dyn ModuleProvider,
) -> UpdateOutcome {
    match load_standalone_data(ctx.store()) {
        Err(err) => return UpdateOutcome::failed_nothing_done(err),
        Ok(Some(_)) => {
            return UpdateOutcome::failed_nothing_done(UpdateError::new(
                ErrorKind::OperationInProgress,
                "Update already in progress. Please commit or roll back first",
            ));
        }
        Ok(None) => {}
    }

    if src.starts_with("http://") || src.starts_with("https://") {
        return UpdateOutcome::failed_nothing_done(UpdateError::new(
            ErrorKind::NotSupported,
            "HTTP not supported yet",
        ));
    }

    let file = match fs::File::open(src) {
        Ok(file) => file,
        Err(err) => {
            return UpdateOutcome::failed_nothing_done(UpdateError::new(
                ErrorKind::Io,
                format!("Could not open {src}: {err}"),
            ));
        }
    };

    let config = ParserConfig {
        artifact_scripts_dir: ctx.layout().artifact_scripts_dir(),
        trusted_key_hex: ctx.trusted_key_hex().map(str::to_string),
    };
    let mut parsed = match artifact::parse(file, &config) {
        Ok(parsed) => parsed,
        Err(err) => return UpdateOutcome::failed_nothing_done(err.into()),
    };

    let header = match parsed.payload_header_view(0) {
        Ok(header) => header,
        Err(err) => return UpdateOutcome::failed_nothing_done(err.into()),
    };

    let module = modules.module_for(&header.payload_type);

    if let Err(err) = module.prepare_file_tree(&header) {
        let mut err = UpdateError::from(err);
        if let Err(cleanup_err) = module.cleanup() {
            err = err.followed_by(cleanup_err.into());
        }
        return UpdateOutcome::failed_nothing_done(err);
    }

    let data = standalone_data_from_header(&header);
    if let Err(err) = save_standalone_data(ctx.store(), &data) {
        let mut err = err;
        if let Err(cleanup_err) = module.cleanup() {
            err = err.followed_by(cleanup_err.into());
        }
        return UpdateOutcome::failed_nothing_done(err);
    }

    do_install_states(ctx, &data, &mut parsed, module.as_ref())
}

fn do_install_states(
    ctx: &UpdateContext,
    data: &StandaloneData,
    parsed: &mut Artifact,
    module: &dyn UpdateModule,
) -> UpdateOutcome {
    let mut payload = match parsed.next_payload() {
        Ok(payload) => payload,
        Err(err) => return UpdateOutcome::failed_nothing_done(err.into()),
    };

    println!("Installing artifact...");

    if let Err(err) = module.download(&mut payload) {
        let mut err = UpdateError::from(err);
        if let Err(cleanup_err) = module.cleanup() {
            err = err.followed_by(cleanup_err.into());
        }
        if let Err(remove_err) = remove_standalone_data(ctx.store()) {
            err = err.followed_by(remove_err);
        }
        return UpdateOutcome::failed_nothing_done(err);
    }
    drop(payload);

    if let Err(err) = module.artifact_install() {
        error!("Installation failed: {err}");
        return installation_failure_handler(ctx, data, module, err.into());
    }

    let reboot = match module.needs_reboot() {
        Ok(reboot) => reboot,
        Err(err) => {
            error!("Could not query for reboot: {err}");
            return installation_failure_handler(ctx, data, module, err.into());
        }
    };

    let rollback_support = match module.supports_rollback() {
        Ok(support) => support,
        Err(err) => {
            error!("Could not query for rollback support: {err}");
            return installation_failure_handler(ctx, data, module, err.into());
        }
    };

    if rollback_support {
        if reboot != RebootAction::No {
            return UpdateOutcome::ok(UpdateResult::InstalledRebootRequired);
        }
        return UpdateOutcome::ok(UpdateResult::Installed);
    }

    println!("Update Module doesn't support rollback. Committing immediately.");

    let mut outcome = do_commit(ctx, data, module);
    if outcome.result == UpdateResult::Committed {
        outcome.result = if reboot != RebootAction::No {
            UpdateResult::InstalledAndCommittedRebootRequired
        } else {
            UpdateResult::InstalledAndCommitted
        };
    }
    outcome
}
