//! Materialize a module's runtime dependencies.
//!
//! Strategies, first match wins:
//! 1. a pre-staged dependency tree is configured and the manifest asks for it: replace
//!    `node_modules` with a copy of the shared tree;
//! 2. `skip_install`: nothing to do;
//! 3. spawn `<installer> install [--verbose] [extra options...]` in the manifest directory.
//!
//! A successful install is followed by the cleanup hook when one is enabled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::{DmlError, Result};
use crate::manifest::Manifest;
use crate::utils::{copy_dir_recursive, remove_dir_if_exists, spawn_streaming};

pub const DEPENDENCY_DIR: &str = "node_modules";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallStrategy {
    Prestaged,
    Skip,
    Spawn,
}

pub struct DependencyInstaller {
    config: Arc<Config>,
}

impl DependencyInstaller {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn strategy(&self, manifest: &Manifest) -> InstallStrategy {
        if self.config.prestaged_dependencies_dir.is_some() && manifest.override_dependencies {
            InstallStrategy::Prestaged
        } else if self.config.skip_install {
            InstallStrategy::Skip
        } else {
            InstallStrategy::Spawn
        }
    }

    /// Whether loading a fresh module will spawn the installer. The manifest is not known
    /// before download, so a configured pre-staged tree counts as "might not spawn".
    pub fn will_spawn(&self) -> bool {
        !self.config.skip_install && self.config.prestaged_dependencies_dir.is_none()
    }

    /// Fail early when the installer will be needed but is not there.
    pub async fn ensure_available(&self) -> Result<()> {
        if !self.will_spawn() {
            return Ok(());
        }
        let path = &self.config.installer_executable_path;
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(()),
            Err(_) => Err(DmlError::InstallerMissing { path: path.clone() }),
        }
    }

    pub fn install_args(&self) -> Vec<String> {
        let mut args = vec!["install".to_string()];
        if self.config.install_verbose {
            args.push("--verbose".to_string());
        }
        args.extend(self.config.installer_extra_options.iter().cloned());
        args
    }

    pub async fn install(&self, module: &str, manifest_dir: &Path, manifest: &Manifest) -> Result<InstallStrategy> {
        let strategy = self.strategy(manifest);
        match strategy {
            InstallStrategy::Prestaged => {
                if let Some(shared) = &self.config.prestaged_dependencies_dir {
                    info!(module, from = %shared.display(), "copying pre-staged dependencies");
                    copy_prestaged(shared, &manifest_dir.join(DEPENDENCY_DIR)).await?;
                }
            }
            InstallStrategy::Skip => {
                info!(module, dir = %manifest_dir.display(), "skipping dependency install per configuration");
                return Ok(strategy);
            }
            InstallStrategy::Spawn => {
                info!(module, dir = %manifest_dir.display(), "installing dependencies");
                let program = &self.config.installer_executable_path;
                run_checked(program, &self.install_args(), manifest_dir).await?;
            }
        }
        self.run_cleanup(module, manifest_dir).await?;
        Ok(strategy)
    }

    async fn run_cleanup(&self, module: &str, manifest_dir: &Path) -> Result<()> {
        let Some(exe) = self.config.cleanup.active_executable() else {
            return Ok(());
        };
        info!(module, hook = %exe.display(), "running cleanup hook");
        run_checked(exe, &self.config.cleanup.args, manifest_dir).await
    }
}

async fn run_checked(program: &Path, args: &[String], cwd: &Path) -> Result<()> {
    let code = spawn_streaming(program, args, Some(cwd), false)
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DmlError::InstallerMissing {
                    path: program.to_path_buf(),
                }
            } else {
                DmlError::io("spawn", program, e)
            }
        })?;
    match code {
        Some(0) => Ok(()),
        code => Err(DmlError::InstallerExit {
            program: program.display().to_string(),
            code,
        }),
    }
}

async fn copy_prestaged(shared: &Path, dest: &Path) -> Result<()> {
    let (src, dst): (PathBuf, PathBuf) = (shared.to_path_buf(), dest.to_path_buf());
    tokio::task::spawn_blocking(move || -> Result<u64> {
        remove_dir_if_exists(&dst).map_err(|e| DmlError::io("remove dependency dir", &dst, e))?;
        copy_dir_recursive(&src, &dst).map_err(|e| DmlError::io("copy pre-staged dependencies", &src, e))
    })
    .await
    .map_err(|e| DmlError::io("copy pre-staged dependencies", shared, std::io::Error::other(e)))??;
    Ok(())
}
