use rollout_modules::{ModuleProvider, UpdateModule};
use tracing::error;

use crate::context::UpdateContext;
use crate::state_data::{load_standalone_data, remove_standalone_data, StandaloneData};
use crate::types::accumulate;
use crate::{ErrorKind, UpdateError, UpdateOutcome, UpdateResult};

/// Rolls back the in-progress update. Requires a persisted state record.
pub fn rollback(ctx: &UpdateContext) -> UpdateOutcome {
    let modules = match ctx.process_modules() {
        Ok(modules) => modules,
        Err(err) => return UpdateOutcome::failed_nothing_done(err),
    };
    rollback_with_modules(ctx, &modules)
}

pub fn rollback_with_modules(ctx: &UpdateContext, modules: &dyn ModuleProvider) -> UpdateOutcome {
    let data = match load_standalone_data(ctx.store()) {
        Err(err) => return UpdateOutcome::failed_nothing_done(err),
        Ok(None) => {
            return UpdateOutcome::new(
                UpdateResult::NoUpdateInProgress,
                Some(UpdateError::new(
                    ErrorKind::NoUpdateInProgress,
                    "Cannot roll back",
                )),
            );
        }
        Ok(Some(data)) => data,
    };

    let module = modules.module_for(&data.payload_types[0]);
    let mut outcome = do_rollback(module.as_ref());

    if outcome.result == UpdateResult::NoRollback {
        // No rollback support. The state record stays so a later commit, or
        // a restored rollback capability, can still act on it.
        return outcome;
    }

    if let Err(err) = module.cleanup() {
        outcome.result = UpdateResult::FailedAndRollbackFailed;
        accumulate(&mut outcome.error, err.into());
    }

    let post = if outcome.result == UpdateResult::RolledBack {
        remove_standalone_data(ctx.store())
    } else {
        commit_broken_artifact(ctx, &data)
    };
    if let Err(err) = post {
        outcome.result = UpdateResult::RollbackFailed;
        accumulate(&mut outcome.error, err);
    }

    outcome
}

/// Queries rollback support and runs the rollback callout. A failed support
/// query reads as "no rollback" with the query error attached.
pub(crate) fn do_rollback(module: &dyn UpdateModule) -> UpdateOutcome {
    match module.supports_rollback() {
        Err(err) => UpdateOutcome::new(UpdateResult::NoRollback, Some(err.into())),
        Ok(false) => UpdateOutcome::ok(UpdateResult::NoRollback),
        Ok(true) => match module.artifact_rollback() {
            Err(err) => UpdateOutcome::new(UpdateResult::RollbackFailed, Some(err.into())),
            Ok(()) => UpdateOutcome::ok(UpdateResult::RolledBack),
        },
    }
}

/// Recovery routine for any install or commit failure after the state has
/// been persisted. Attempts rollback, runs the failure and cleanup callouts,
/// then either clears the state (rolled back) or commits the broken-artifact
/// record in the same transaction that removes the state. The triggering
/// error stays first in the chain; recovery errors accumulate behind it.
pub(crate) fn installation_failure_handler(
    ctx: &UpdateContext,
    data: &StandaloneData,
    module: &dyn UpdateModule,
    primary: UpdateError,
) -> UpdateOutcome {
    let mut outcome = do_rollback(module);
    let rollback_err = outcome.error.take();
    outcome.error = Some(primary);
    if let Some(err) = rollback_err {
        accumulate(&mut outcome.error, err);
    }
    let mapped = match outcome.result {
        UpdateResult::RolledBack => UpdateResult::FailedAndRolledBack,
        UpdateResult::NoRollback => UpdateResult::FailedAndNoRollback,
        UpdateResult::RollbackFailed => UpdateResult::FailedAndRollbackFailed,
        other => {
            // Should not happen.
            accumulate(
                &mut outcome.error,
                UpdateError::new(
                    ErrorKind::Programming,
                    format!(
                        "Unexpected result `{other}` in installation failure handler. This is a bug."
                    ),
                ),
            );
            return UpdateOutcome::new(UpdateResult::FailedAndRollbackFailed, outcome.error);
        }
    };
    outcome.result = mapped;

    if let Err(err) = module.artifact_failure() {
        outcome.result = UpdateResult::FailedAndRollbackFailed;
        accumulate(&mut outcome.error, err.into());
    }

    if let Err(err) = module.cleanup() {
        outcome.result = UpdateResult::FailedAndRollbackFailed;
        accumulate(&mut outcome.error, err.into());
    }

    let post = if outcome.result == UpdateResult::FailedAndRolledBack {
        remove_standalone_data(ctx.store())
    } else {
        commit_broken_artifact(ctx, data)
    };
    if let Err(err) = post {
        outcome.result = UpdateResult::FailedAndRollbackFailed;
        accumulate(&mut outcome.error, err);
    }

    outcome
}

/// Records the failed artifact as the device's current state: the name gets
/// the broken suffix, the `artifact_name` provides entry follows when the
/// map is present, and the standalone state is removed in the same
/// transaction.
pub(crate) fn commit_broken_artifact(
    ctx: &UpdateContext,
    data: &StandaloneData,
) -> Result<(), UpdateError> {
    error!(
        artifact_name = %data.artifact_name,
        "recording broken artifact after unrecoverable failure"
    );
    let broken_name = format!(
        "{}{}",
        data.artifact_name,
        UpdateContext::BROKEN_ARTIFACT_NAME_SUFFIX
    );
    let mut provides = data.artifact_provides.clone();
    if let Some(map) = provides.as_mut() {
        map.insert("artifact_name".to_string(), broken_name.clone());
    }

    ctx.commit_artifact_data(
        &broken_name,
        &data.artifact_group,
        &provides,
        &data.artifact_clears_provides,
        |txn| {
            txn.remove(UpdateContext::STANDALONE_STATE_KEY);
            Ok(())
        },
    )
}
