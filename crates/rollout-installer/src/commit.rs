use rollout_modules::{ModuleProvider, UpdateModule};
use tracing::error;

use crate::context::UpdateContext;
use crate::rollback::installation_failure_handler;
use crate::state_data::{load_standalone_data, StandaloneData};
use crate::types::accumulate;
use crate::{ErrorKind, UpdateError, UpdateOutcome, UpdateResult};

/// Commits the in-progress update. Requires a persisted state record.
pub fn commit(ctx: &UpdateContext) -> UpdateOutcome {
    let modules = match ctx.process_modules() {
        Ok(modules) => modules,
        Err(err) => return UpdateOutcome::failed_nothing_done(err),
    };
    commit_with_modules(ctx, &modules)
}

pub fn commit_with_modules(ctx: &UpdateContext, modules: &dyn ModuleProvider) -> UpdateOutcome {
    let data = match load_standalone_data(ctx.store()) {
        Err(err) => return UpdateOutcome::failed_nothing_done(err),
        Ok(None) => {
            return UpdateOutcome::new(
                UpdateResult::NoUpdateInProgress,
                Some(UpdateError::new(
                    ErrorKind::NoUpdateInProgress,
                    "Cannot commit",
                )),
            );
        }
        Ok(Some(data)) => data,
    };

    let module = modules.module_for(&data.payload_types[0]);
    do_commit(ctx, &data, module.as_ref())
}

/// The commit tail shared by `commit` and the no-rollback install path.
/// Post-commit failures (cleanup, provides commit) downgrade the result but
/// never undo the commit; their errors accumulate.
pub(crate) fn do_commit(
    ctx: &UpdateContext,
    data: &StandaloneData,
    module: &dyn UpdateModule,
) -> UpdateOutcome {
    if let Err(err) = module.artifact_commit() {
        error!("Commit failed: {err}");
        return installation_failure_handler(ctx, data, module, err.into());
    }

    let mut result = UpdateResult::Committed;
    let mut return_err = None;

    if let Err(err) = module.cleanup() {
        result = UpdateResult::InstalledButFailedInPostCommit;
        accumulate(&mut return_err, err.into());
    }

    if let Err(err) = ctx.commit_artifact_data(
        &data.artifact_name,
        &data.artifact_group,
        &data.artifact_provides,
        &data.artifact_clears_provides,
        |txn| {
            txn.remove(UpdateContext::STANDALONE_STATE_KEY);
            Ok(())
        },
    ) {
        result = UpdateResult::InstalledButFailedInPostCommit;
        accumulate(&mut return_err, err);
    }

    UpdateOutcome::new(result, return_err)
}
