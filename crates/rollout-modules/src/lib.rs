//! Facade over external update modules.
//!
//! An update module is an external program that knows how to apply one
//! payload type. The core drives it through a fixed set of lifecycle states;
//! this crate owns that callout contract and the process-backed
//! implementation of it.

mod process;

pub use process::{discover_modules, ModuleEnv, ProcessModule, ProcessModules};

use std::io;

use rollout_artifact::{Payload, PayloadHeaderView};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("update module io error: {0}")]
    Io(#[from] io::Error),
    #[error("update module {state} failed: status={status} stderr='{stderr}'")]
    Failed {
        state: &'static str,
        status: String,
        stderr: String,
    },
    #[error("update module {state} returned unexpected output '{output}'")]
    BadOutput { state: &'static str, output: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    No,
    Automatic,
    Yes,
}

impl RebootAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::No => "No",
            Self::Automatic => "Automatic",
            Self::Yes => "Yes",
        }
    }

    /// Parses the module's stdout token. An empty token means `No`.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "" | "No" => Some(Self::No),
            "Automatic" => Some(Self::Automatic),
            "Yes" => Some(Self::Yes),
            _ => None,
        }
    }
}

/// The lifecycle callouts the update core drives. The work directory is
/// internal to the implementation.
pub trait UpdateModule {
    fn prepare_file_tree(&self, header: &PayloadHeaderView) -> Result<(), ModuleError>;
    fn download(&self, payload: &mut Payload<'_>) -> Result<(), ModuleError>;
    fn artifact_install(&self) -> Result<(), ModuleError>;
    fn needs_reboot(&self) -> Result<RebootAction, ModuleError>;
    fn supports_rollback(&self) -> Result<bool, ModuleError>;
    fn artifact_commit(&self) -> Result<(), ModuleError>;
    fn artifact_rollback(&self) -> Result<(), ModuleError>;
    fn artifact_failure(&self) -> Result<(), ModuleError>;
    fn cleanup(&self) -> Result<(), ModuleError>;
}

/// Factory keyed by the payload-type string from the artifact header.
pub trait ModuleProvider {
    fn module_for(&self, payload_type: &str) -> Box<dyn UpdateModule>;
}
