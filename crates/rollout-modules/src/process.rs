use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use rollout_artifact::{Payload, PayloadHeaderView};
use serde_json::json;
use tracing::{debug, warn};

use crate::{ModuleError, ModuleProvider, RebootAction, UpdateModule};

/// File-tree protocol version written into the work tree.
const TREE_VERSION: &str = "3";

/// Device-side facts the module file tree exposes to the module.
#[derive(Debug, Clone, Default)]
pub struct ModuleEnv {
    pub device_type: String,
    pub current_provides: BTreeMap<String, String>,
}

/// Process-backed update module. The module executable is invoked as
/// `<module> <State> <work_dir>`; query states report through stdout.
pub struct ProcessModule {
    module_path: PathBuf,
    work_dir: PathBuf,
    env: ModuleEnv,
}

impl ProcessModule {
    pub fn new(
        module_path: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        env: ModuleEnv,
    ) -> Self {
        Self {
            module_path: module_path.into(),
            work_dir: work_dir.into(),
            env,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn run_state(&self, state: &'static str) -> Result<std::process::Output, ModuleError> {
        debug!(
            module = %self.module_path.display(),
            state, "invoking update module"
        );
        let output = Command::new(&self.module_path)
            .arg(state)
            .arg(&self.work_dir)
            .output()
            .map_err(|err| {
                ModuleError::Io(io::Error::new(
                    err.kind(),
                    format!(
                        "failed to start update module {}: {err}",
                        self.module_path.display()
                    ),
                ))
            })?;

        if !output.status.success() {
            return Err(ModuleError::Failed {
                state,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    fn call_state(&self, state: &'static str) -> Result<(), ModuleError> {
        self.run_state(state).map(|_| ())
    }

    fn query_state(&self, state: &'static str) -> Result<String, ModuleError> {
        let output = self.run_state(state)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or("").trim().to_string())
    }

    fn files_dir(&self) -> PathBuf {
        self.work_dir.join("files")
    }
}

fn create_data_file(dir: &Path, name: &str, content: &str) -> Result<(), ModuleError> {
    let path = dir.join(name);
    fs::write(&path, content.as_bytes()).map_err(|err| {
        ModuleError::Io(io::Error::new(
            err.kind(),
            format!("failed to write {}: {err}", path.display()),
        ))
    })
}

impl UpdateModule for ProcessModule {
    /// Builds the work tree the module protocol prescribes: a `version`
    /// marker, the device's current identity, the artifact header under
    /// `header/`, and empty `tmp/` and `files/` directories.
    fn prepare_file_tree(&self, header: &PayloadHeaderView) -> Result<(), ModuleError> {
        let header_dir = self.work_dir.join("header");
        for dir in [
            self.work_dir.clone(),
            header_dir.clone(),
            self.work_dir.join("tmp"),
            self.files_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|err| {
                ModuleError::Io(io::Error::new(
                    err.kind(),
                    format!("failed to create {}: {err}", dir.display()),
                ))
            })?;
        }

        create_data_file(&self.work_dir, "version", &format!("{TREE_VERSION}\n"))?;

        let current_value = |key: &str| match self.env.current_provides.get(key) {
            Some(value) => format!("{value}\n"),
            None => String::new(),
        };
        create_data_file(
            &self.work_dir,
            "current_artifact_name",
            &current_value("artifact_name"),
        )?;
        create_data_file(
            &self.work_dir,
            "current_artifact_group",
            &current_value("artifact_group"),
        )?;
        create_data_file(
            &self.work_dir,
            "current_device_type",
            &format!("{}\n", self.env.device_type),
        )?;

        create_data_file(&header_dir, "artifact_name", &header.artifact_name)?;
        create_data_file(&header_dir, "artifact_group", &header.artifact_group)?;
        create_data_file(&header_dir, "payload_type", &header.payload_type)?;

        let type_info = json!({
            "artifact_provides": header.type_info.artifact_provides,
            "clears_artifact_provides": header.type_info.clears_artifact_provides,
        });
        create_data_file(&header_dir, "type_info", &type_info.to_string())
    }

    /// Streams the payload into `files/` and then runs the module's
    /// `Download` state. The payload reader enforces size and checksum, so a
    /// corrupt stream fails before the module sees the `Download` state.
    fn download(&self, payload: &mut Payload<'_>) -> Result<(), ModuleError> {
        let dest = self.files_dir().join(payload.name());
        let mut file = fs::File::create(&dest).map_err(|err| {
            ModuleError::Io(io::Error::new(
                err.kind(),
                format!("failed to create {}: {err}", dest.display()),
            ))
        })?;
        io::copy(payload, &mut file)?;
        self.call_state("Download")
    }

    fn artifact_install(&self) -> Result<(), ModuleError> {
        self.call_state("ArtifactInstall")
    }

    fn needs_reboot(&self) -> Result<RebootAction, ModuleError> {
        let token = self.query_state("NeedsArtifactReboot")?;
        RebootAction::parse(&token).ok_or(ModuleError::BadOutput {
            state: "NeedsArtifactReboot",
            output: token,
        })
    }

    fn supports_rollback(&self) -> Result<bool, ModuleError> {
        let token = self.query_state("SupportsRollback")?;
        match token.as_str() {
            "" | "No" => Ok(false),
            "Yes" => Ok(true),
            _ => Err(ModuleError::BadOutput {
                state: "SupportsRollback",
                output: token,
            }),
        }
    }

    fn artifact_commit(&self) -> Result<(), ModuleError> {
        self.call_state("ArtifactCommit")
    }

    fn artifact_rollback(&self) -> Result<(), ModuleError> {
        self.call_state("ArtifactRollback")
    }

    fn artifact_failure(&self) -> Result<(), ModuleError> {
        self.call_state("ArtifactFailure")
    }

    /// Runs the module's `Cleanup` state and deletes the work tree. The tree
    /// is deleted even when the callout fails; the callout error wins.
    fn cleanup(&self) -> Result<(), ModuleError> {
        let callout = self.call_state("Cleanup");

        match fs::remove_dir_all(&self.work_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if callout.is_ok() {
                    return Err(ModuleError::Io(io::Error::new(
                        err.kind(),
                        format!(
                            "failed to remove work tree {}: {err}",
                            self.work_dir.display()
                        ),
                    )));
                }
                warn!(
                    work_dir = %self.work_dir.display(),
                    error = %err,
                    "failed to remove work tree after Cleanup failure"
                );
            }
        }
        callout
    }
}

/// Process-backed module factory: one executable per payload type under
/// `modules_dir`, one shared work tree per operation.
pub struct ProcessModules {
    pub modules_dir: PathBuf,
    pub work_tree: PathBuf,
    pub env: ModuleEnv,
}

impl ModuleProvider for ProcessModules {
    fn module_for(&self, payload_type: &str) -> Box<dyn UpdateModule> {
        Box::new(ProcessModule::new(
            self.modules_dir.join(payload_type),
            self.work_tree.clone(),
            self.env.clone(),
        ))
    }
}

/// Lists the update modules installed under `modules_dir`, sorted by name.
/// Only executable regular files count; anything else is skipped with a
/// warning. A missing directory means no modules.
pub fn discover_modules(modules_dir: &Path) -> Result<Vec<String>, ModuleError> {
    let entries = match fs::read_dir(modules_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(ModuleError::Io(io::Error::new(
                err.kind(),
                format!("failed to read {}: {err}", modules_dir.display()),
            )));
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(ModuleError::Io)?;
        let path = entry.path();
        if !entry.file_type().map_err(ModuleError::Io)?.is_file() {
            warn!(path = %path.display(), "not a regular file, skipping");
            continue;
        }
        if !is_executable(&path).map_err(ModuleError::Io)? {
            warn!(path = %path.display(), "update module is not executable, skipping");
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)?.permissions().mode();
    Ok(mode & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> io::Result<bool> {
    Ok(true)
}
