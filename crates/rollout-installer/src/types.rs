use std::fmt;

use rollout_artifact::ArtifactError;
use rollout_modules::ModuleError;
use rollout_store::StoreError;

/// Terminal results of the standalone operations. Every public operation
/// ends in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    FailedNothingDone,
    NoUpdateInProgress,
    Installed,
    InstalledRebootRequired,
    InstalledAndCommitted,
    InstalledAndCommittedRebootRequired,
    Committed,
    InstalledButFailedInPostCommit,
    NoRollback,
    RolledBack,
    RollbackFailed,
    FailedAndRolledBack,
    FailedAndNoRollback,
    FailedAndRollbackFailed,
}

impl UpdateResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailedNothingDone => "failed-nothing-done",
            Self::NoUpdateInProgress => "no-update-in-progress",
            Self::Installed => "installed",
            Self::InstalledRebootRequired => "installed-reboot-required",
            Self::InstalledAndCommitted => "installed-and-committed",
            Self::InstalledAndCommittedRebootRequired => {
                "installed-and-committed-reboot-required"
            }
            Self::Committed => "committed",
            Self::InstalledButFailedInPostCommit => "installed-but-failed-in-post-commit",
            Self::NoRollback => "no-rollback",
            Self::RolledBack => "rolled-back",
            Self::RollbackFailed => "rollback-failed",
            Self::FailedAndRolledBack => "failed-and-rolled-back",
            Self::FailedAndNoRollback => "failed-and-no-rollback",
            Self::FailedAndRollbackFailed => "failed-and-rollback-failed",
        }
    }

    /// Whether the operation as a whole should be reported as failed.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FailedNothingDone
                | Self::NoUpdateInProgress
                | Self::InstalledButFailedInPostCommit
                | Self::NoRollback
                | Self::RollbackFailed
                | Self::FailedAndRolledBack
                | Self::FailedAndNoRollback
                | Self::FailedAndRollbackFailed
        )
    }
}

impl fmt::Display for UpdateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic error classes. Tests and callers match on these rather than on
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    KeyNotFound,
    Io,
    Json,
    FieldMissing,
    FieldType,
    DatabaseValue,
    NotSupported,
    OperationInProgress,
    NoUpdateInProgress,
    Signature,
    Module,
    Programming,
}

/// An error with a primary cause and any number of follow-up errors folded
/// in. Secondary failures (cleanup on top of an install error, for example)
/// never displace the primary; they accumulate behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateError {
    pub kind: ErrorKind,
    pub message: String,
    pub followed_by: Vec<UpdateError>,
}

impl UpdateError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            followed_by: Vec::new(),
        }
    }

    /// Folds `next` into this error as a follow-up.
    pub fn followed_by(mut self, next: UpdateError) -> Self {
        self.followed_by.push(next);
        self
    }

    /// The full cause list, primary first, follow-ups flattened in order.
    pub fn chain(&self) -> Vec<&UpdateError> {
        let mut out = vec![self];
        for next in &self.followed_by {
            out.extend(next.chain());
        }
        out
    }

    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.chain().iter().any(|err| err.kind == kind)
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for next in &self.followed_by {
            write!(f, "; followed by: {next}")?;
        }
        Ok(())
    }
}

impl std::error::Error for UpdateError {}

impl From<StoreError> for UpdateError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            StoreError::Io { .. } => ErrorKind::Io,
            StoreError::Corrupt { .. } => ErrorKind::Json,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<ArtifactError> for UpdateError {
    fn from(err: ArtifactError) -> Self {
        let kind = match &err {
            ArtifactError::Io(_) => ErrorKind::Io,
            ArtifactError::Parse(_) => ErrorKind::Json,
            ArtifactError::Signature(_) => ErrorKind::Signature,
            ArtifactError::PayloadIndex(_) | ArtifactError::PayloadConsumed => {
                ErrorKind::Programming
            }
        };
        Self::new(kind, err.to_string())
    }
}

impl From<ModuleError> for UpdateError {
    fn from(err: ModuleError) -> Self {
        Self::new(ErrorKind::Module, err.to_string())
    }
}

/// What a public operation hands back: the terminal result plus the full
/// diagnostic chain, when there is one. The result is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub result: UpdateResult,
    pub error: Option<UpdateError>,
}

impl UpdateOutcome {
    pub fn ok(result: UpdateResult) -> Self {
        Self {
            result,
            error: None,
        }
    }

    pub fn new(result: UpdateResult, error: Option<UpdateError>) -> Self {
        Self { result, error }
    }

    pub fn failed_nothing_done(error: UpdateError) -> Self {
        Self::new(UpdateResult::FailedNothingDone, Some(error))
    }
}

/// Accumulates a follow-up error onto the slot without losing the primary.
pub(crate) fn accumulate(slot: &mut Option<UpdateError>, err: UpdateError) {
    *slot = Some(match slot.take() {
        Some(prev) => prev.followed_by(err),
        None => err,
    });
}
