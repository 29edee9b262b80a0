//! Execution backends: how one external command becomes a process

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::config::RunnerKind;
use crate::error::{DwiprocError, Result};
use crate::plan::Command;
use crate::tool::Tool;

/// Timeout for the container engine availability probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Executables on `PATH`
    Local,
    /// docker or podman
    Docker { engine: &'static str },
    /// singularity or apptainer
    Singularity { engine: &'static str },
}

impl Backend {
    pub fn from_kind(kind: RunnerKind) -> Self {
        match kind {
            RunnerKind::Local => Self::Local,
            RunnerKind::Docker => Self::Docker { engine: "docker" },
            RunnerKind::Podman => Self::Docker { engine: "podman" },
            RunnerKind::Singularity => Self::Singularity { engine: "singularity" },
            RunnerKind::Apptainer => Self::Singularity { engine: "apptainer" },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Docker { engine } | Self::Singularity { engine } => engine,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// Image (or executable directory for `Local`) used for `tool`
    ///
    /// The map is keyed by tool identity (`mrtrix3`) or by canonical image tag
    /// (`mrtrix3/mrtrix3:3.0.4`). Singularity images are local `.sif` files,
    /// so there is no default.
    pub fn resolve_image(&self, tool: Tool, images: &BTreeMap<String, String>) -> Result<Option<String>> {
        let configured = images
            .get(tool.as_str())
            .or_else(|| tool.canonical_image().and_then(|tag| images.get(tag)))
            .cloned();
        match self {
            Self::Local => Ok(configured),
            Self::Docker { .. } => configured
                .or_else(|| tool.canonical_image().map(str::to_string))
                .map(Some)
                .ok_or_else(|| self.unresolved(tool)),
            Self::Singularity { .. } => configured.map(Some).ok_or_else(|| self.unresolved(tool)),
        }
    }

    fn unresolved(&self, tool: Tool) -> DwiprocError {
        DwiprocError::ImageUnresolved {
            tool: tool.to_string(),
            runner: self.name().to_string(),
        }
    }

    /// Program and arguments to spawn
    ///
    /// Container backends pass `env` on the command line; the local backend
    /// sets it on the child process instead.
    pub fn command_line(
        &self,
        cmd: &Command,
        image: Option<&str>,
        cwd: &Path,
        mounts: &[PathBuf],
        env: &BTreeMap<String, String>,
    ) -> (String, Vec<String>) {
        let cwd = cwd.display().to_string();
        match self {
            Self::Local => {
                let program = match image {
                    Some(dir) => Path::new(dir).join(&cmd.program).display().to_string(),
                    None => cmd.program.clone(),
                };
                (program, cmd.args.clone())
            }
            Self::Docker { engine } => {
                let mut args = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "--entrypoint".to_string(),
                    cmd.program.clone(),
                ];
                for mount in mounts {
                    let mount = mount.display();
                    args.extend(["-v".to_string(), format!("{mount}:{mount}")]);
                }
                args.extend(["-w".to_string(), cwd]);
                for (key, value) in env {
                    args.extend(["-e".to_string(), format!("{key}={value}")]);
                }
                args.extend(image.map(str::to_string));
                args.extend(cmd.args.iter().cloned());
                (engine.to_string(), args)
            }
            Self::Singularity { engine } => {
                let mut args = vec!["exec".to_string()];
                for mount in mounts {
                    let mount = mount.display();
                    args.extend(["--bind".to_string(), format!("{mount}:{mount}")]);
                }
                args.extend(["--pwd".to_string(), cwd]);
                for (key, value) in env {
                    args.extend(["--env".to_string(), format!("{key}={value}")]);
                }
                args.extend(image.map(str::to_string));
                args.push(cmd.program.clone());
                args.extend(cmd.args.iter().cloned());
                (engine.to_string(), args)
            }
        }
    }

    /// Check the container engine answers `--version`
    pub fn probe(&self) -> Result<()> {
        let engine = match self {
            Self::Local => return Ok(()),
            Self::Docker { engine } | Self::Singularity { engine } => *engine,
        };
        let available = std::process::Command::new(engine)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .and_then(|mut child| match child.wait_timeout(PROBE_TIMEOUT)? {
                Some(status) => Ok(status.success()),
                None => {
                    let _ = child.kill();
                    Ok(false)
                }
            })
            .unwrap_or(false);
        if available {
            Ok(())
        } else {
            Err(DwiprocError::Spawn {
                program: engine.to_string(),
                details: "container engine not available".to_string(),
            })
        }
    }
}
