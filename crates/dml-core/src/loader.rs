//! The load and eviction pipelines.
//!
//! Load: cache check, lock, disk check, then download, extract, install (each followed by a
//! checkpoint), load code, checkpoint, unlock. Any failure after the lock is taken goes through
//! `recover`, which quarantines the installation directory; the lock is always released.

use std::ffi::OsString;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::archive::PackageFormat;
use crate::config::Config;
use crate::error::{DmlError, Result, Stage};
use crate::events::{panic_message, EventBus, ModuleEvent};
use crate::installer::DependencyInstaller;
use crate::lock::{FileLockService, LockService};
use crate::manifest::{find_manifest, Manifest};
use crate::module::{CodeLoader, LoadContext, ModuleHandle};
use crate::registry::{LoadedCode, ModuleKey, ModuleRegistry};
use crate::transport::Transport;
use crate::utils::remove_dir_if_exists;

pub const QUARANTINE_SUFFIX: &str = "-ERROR";

/// Per-call overrides for `load`.
#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    /// `.zip` or `.tar.gz`; defaults to the configured extension.
    pub extension: Option<String>,
    /// Full download URL; bypasses `<packageServerUrl>/<name><extension>`.
    pub url: Option<String>,
    /// Sub-directory namespacing the lock and the installation path.
    pub scope: Option<String>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = Some(ext.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// Everything one pipeline run derives from the name and options.
#[derive(Debug)]
struct ModuleTarget {
    key: ModuleKey,
    lock_key: String,
    extension: String,
    source_url: String,
    download_dir: PathBuf,
    download_path: PathBuf,
    install_base: PathBuf,
    install_path: PathBuf,
}

impl ModuleTarget {
    fn new(config: &Config, name: &str, opts: &LoadOptions) -> Self {
        let scope = opts.scope.clone().filter(|s| !s.is_empty());
        let extension = opts
            .extension
            .clone()
            .unwrap_or_else(|| config.default_package_extension.clone());
        let package_file = format!("{}{}", name, extension);
        let source_url = opts
            .url
            .clone()
            .unwrap_or_else(|| format!("{}/{}", config.package_server_url, package_file));

        let mut download_dir = absolute(&config.download_dir);
        let mut install_base = absolute(&config.install_root);
        if let Some(scope) = &scope {
            download_dir.push(scope);
            install_base.push(scope);
        }
        let download_path = download_dir.join(&package_file);
        let install_path = install_base.join(name);

        Self {
            lock_key: scope.clone().unwrap_or_else(|| name.to_string()),
            key: ModuleKey::new(name, scope),
            extension,
            source_url,
            download_dir,
            download_path,
            install_base,
            install_path,
        }
    }

    fn name(&self) -> &str {
        &self.key.name
    }
}

fn absolute(p: &Path) -> PathBuf {
    if p.is_absolute() {
        return p.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(p))
        .unwrap_or_else(|_| p.to_path_buf())
}

/// `<path>-ERROR`, next to `path`.
pub fn quarantine_path(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_os_string();
    s.push(QUARANTINE_SUFFIX);
    PathBuf::from(s)
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DmlError::InvalidModuleName {
            name: name.to_string(),
        });
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        warn!(module = name, "module name contains path separators or '..'; it is joined into lock, download and install paths as-is");
    }
    Ok(())
}

/// Acquires, installs, loads and evicts modules. One instance per host process; share it
/// behind an `Arc`.
pub struct DynamicModuleLoader {
    config: Arc<Config>,
    locks: Arc<dyn LockService>,
    code_loader: Arc<dyn CodeLoader>,
    installer: DependencyInstaller,
    transport: Transport,
    registry: ModuleRegistry,
    loaded: LoadedCode,
    events: EventBus,
}

impl DynamicModuleLoader {
    pub fn new(config: Config, locks: Arc<dyn LockService>, code_loader: Arc<dyn CodeLoader>) -> Self {
        let config = Arc::new(config);
        Self {
            installer: DependencyInstaller::new(config.clone()),
            transport: Transport::new(),
            registry: ModuleRegistry::new(),
            loaded: LoadedCode::new(),
            events: EventBus::new(),
            config,
            locks,
            code_loader,
        }
    }

    /// Loader using lock files under `config.lock_dir`.
    pub fn with_file_locks(config: Config, code_loader: Arc<dyn CodeLoader>) -> Self {
        let locks = Arc::new(FileLockService::new(absolute(&config.lock_dir)));
        Self::new(config, locks, code_loader)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn loaded_code(&self) -> &LoadedCode {
        &self.loaded
    }

    /// Where `name` is (or would be) installed.
    pub fn install_path(&self, name: &str, scope: Option<&str>) -> PathBuf {
        let opts = LoadOptions {
            scope: scope.map(str::to_string),
            ..LoadOptions::default()
        };
        ModuleTarget::new(&self.config, name, &opts).install_path
    }

    /// Ensure `name` is on disk, installed and loaded; return its handle.
    pub async fn load(&self, name: &str, opts: LoadOptions) -> Result<ModuleHandle> {
        validate_name(name)?;
        let target = ModuleTarget::new(&self.config, name, &opts);
        debug!(?target, "resolved module target");

        if let Some(handle) = self.cached(&target).await {
            debug!(module = name, "registry hit");
            return Ok(handle);
        }

        let owner = self.config.lock_owner.as_str();
        self.locks
            .acquire_exclusive(&target.lock_key, owner, self.config.lock_timeout())
            .await
            .map_err(|e| e.at(name, Stage::Lock))?;

        let outcome = self.run_locked(&target).await;
        if let Err(e) = &outcome {
            error!(module = name, error = %e, "load failed");
            self.recover(&target).await;
        }

        let released = self.locks.release(&target.lock_key, owner).await;
        match (outcome, released) {
            (Ok(handle), Ok(())) => Ok(handle),
            (Ok(_), Err(unlock)) => Err(unlock.at(name, Stage::Lock)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unlock)) => {
                warn!(module = name, error = %unlock, "failed to release lock after failed load");
                Err(e)
            }
        }
    }

    /// Registry hit whose entry point still exists and whose code is still loaded.
    async fn cached(&self, target: &ModuleTarget) -> Option<ModuleHandle> {
        let entry = self.registry.get(&target.key)?;
        if tokio::fs::metadata(&entry).await.is_err() {
            return None;
        }
        self.loaded.get(&entry)
    }

    async fn run_locked(&self, target: &ModuleTarget) -> Result<ModuleHandle> {
        // Another caller may have finished while we waited for the lock.
        if let Some(handle) = self.cached(target).await {
            return Ok(handle);
        }
        let manifest_dir = match self.installed_manifest_dir(target).await? {
            Some(dir) => {
                info!(module = target.name(), dir = %dir.display(), "already installed");
                dir
            }
            None => self.acquire(target).await?,
        };
        self.load_code(target, &manifest_dir).await
    }

    /// Manifest directory of an existing installation. A directory without a manifest is a
    /// leftover from a crash and is removed.
    async fn installed_manifest_dir(&self, target: &ModuleTarget) -> Result<Option<PathBuf>> {
        if tokio::fs::metadata(&target.install_path).await.is_err() {
            return Ok(None);
        }
        let root = target.install_path.clone();
        let found = tokio::task::spawn_blocking(move || find_manifest(&root))
            .await
            .map_err(|e| DmlError::io("scan install dir", &target.install_path, std::io::Error::other(e)))?;
        match found {
            Ok(dir) => Ok(Some(dir)),
            Err(DmlError::ManifestNotFound { .. }) => {
                warn!(module = target.name(), path = %target.install_path.display(), "removing partial installation");
                let path = target.install_path.clone();
                tokio::task::spawn_blocking(move || remove_dir_if_exists(&path))
                    .await
                    .map_err(|e| DmlError::io("remove partial install", &target.install_path, std::io::Error::other(e)))?
                    .map_err(|e| DmlError::io("remove partial install", &target.install_path, e))?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Download, extract and install. Returns the manifest directory.
    async fn acquire(&self, target: &ModuleTarget) -> Result<PathBuf> {
        let name = target.name();
        let format = PackageFormat::from_extension(&target.extension).map_err(|e| e.at(name, Stage::Download))?;
        self.installer
            .ensure_available()
            .await
            .map_err(|e| e.at(name, Stage::Install))?;

        for dir in [&target.download_dir, &target.install_base, &target.install_path] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| DmlError::io("create directory", dir, e).at(name, Stage::Download))?;
        }

        info!(module = name, url = %target.source_url, to = %target.download_path.display(), "downloading module");
        let file = self
            .transport
            .fetch(&target.source_url, &target.download_path)
            .await
            .map_err(|e| e.at(name, Stage::Download))?;
        self.events
            .checkpoint(&ModuleEvent::Downloaded {
                name: name.to_string(),
                file: file.clone(),
            })
            .await
            .map_err(|e| e.at(name, Stage::Download))?;

        info!(module = name, format = %format, "extracting module");
        let manifest_dir = format
            .extract(
                &file,
                &target.install_base,
                &target.install_path,
                &self.config.unzip_executable_path,
            )
            .await
            .map_err(|e| e.at(name, Stage::Extract))?;
        self.events
            .checkpoint(&ModuleEvent::Extracted {
                name: name.to_string(),
                path: manifest_dir.clone(),
            })
            .await
            .map_err(|e| e.at(name, Stage::Extract))?;

        let manifest = Manifest::read(&manifest_dir)
            .await
            .map_err(|e| e.at(name, Stage::Install))?;
        self.installer
            .install(name, &manifest_dir, &manifest)
            .await
            .map_err(|e| e.at(name, Stage::Install))?;
        self.events
            .checkpoint(&ModuleEvent::Installed {
                name: name.to_string(),
                path: manifest_dir.clone(),
            })
            .await
            .map_err(|e| e.at(name, Stage::Install))?;

        Ok(manifest_dir)
    }

    async fn load_code(&self, target: &ModuleTarget, manifest_dir: &Path) -> Result<ModuleHandle> {
        let name = target.name();
        let manifest = Manifest::read(manifest_dir)
            .await
            .map_err(|e| e.at(name, Stage::Load))?;
        let entry = manifest.entry_point(manifest_dir, &self.config.default_entry_point);
        if tokio::fs::metadata(&entry).await.is_err() {
            return Err(DmlError::Load {
                path: entry,
                message: "entry point does not exist".to_string(),
            }
            .at(name, Stage::Load));
        }

        let (handle, fresh) = match self.loaded.get(&entry) {
            Some(handle) => (handle, false),
            None => {
                let cx = LoadContext {
                    module: name,
                    manifest: &manifest,
                    module_dir: manifest_dir,
                    loaded: &self.loaded,
                };
                let loaded = AssertUnwindSafe(self.code_loader.load(&entry, &cx))
                    .catch_unwind()
                    .await;
                let handle = match loaded {
                    Ok(Ok(handle)) => handle,
                    Ok(Err(e)) => {
                        return Err(DmlError::Load {
                            path: entry,
                            message: e.to_string(),
                        }
                        .at(name, Stage::Load))
                    }
                    Err(panic) => {
                        return Err(DmlError::Load {
                            path: entry,
                            message: format!("loader panicked: {}", panic_message(panic)),
                        }
                        .at(name, Stage::Load))
                    }
                };
                (handle, true)
            }
        };

        info!(module = name, entry = %entry.display(), "module loaded");
        self.events
            .checkpoint(&ModuleEvent::Loaded { name: name.to_string() })
            .await
            .map_err(|e| e.at(name, Stage::Load))?;

        // Published only once approved: the unlocked cache check must never see a vetoed load.
        if fresh {
            self.loaded.insert(entry.clone(), handle.clone());
        }
        self.registry.insert(target.key.clone(), entry);
        Ok(handle)
    }

    /// Forget in-memory state for the failed module and quarantine its directory.
    /// Nothing here can fail the pipeline; problems are logged.
    async fn recover(&self, target: &ModuleTarget) {
        self.registry.remove(&target.key);
        let dropped = self.loaded.invalidate_prefix(&target.install_path);
        if dropped > 0 {
            debug!(module = target.name(), dropped, "dropped loaded code of failed module");
        }
        quarantine(&target.install_path).await;
    }

    /// Drop `name` from the caches (after running its destroy hook) so the next load reads it
    /// from disk again. Resolves with the module name.
    pub async fn evict(&self, name: &str, scope: Option<&str>) -> Result<String> {
        validate_name(name)?;
        let opts = LoadOptions {
            scope: scope.map(str::to_string),
            ..LoadOptions::default()
        };
        let target = ModuleTarget::new(&self.config, name, &opts);
        let owner = self.config.lock_owner.as_str();
        self.locks
            .acquire_exclusive(&target.lock_key, owner, self.config.lock_timeout())
            .await
            .map_err(|e| e.at(name, Stage::Lock))?;

        let entry = self.registry.get(&target.key);
        if let Some(handle) = entry.as_deref().and_then(|p| self.loaded.get(p)) {
            self.destroy(name, handle).await;
        }

        self.registry.remove(&target.key);
        if let Some(entry) = &entry {
            self.loaded.remove(entry);
        }
        let purged = self.loaded.invalidate_prefix(&target.install_path);
        debug!(module = name, purged, "purged loaded code");

        self.events
            .notify(&ModuleEvent::Evicted { name: name.to_string() })
            .await;
        info!(module = name, "module evicted");

        self.locks
            .release(&target.lock_key, owner)
            .await
            .map_err(|e| e.at(name, Stage::Evict))?;
        Ok(name.to_string())
    }

    /// Run the module's destroy hook. Failures and panics are logged; only a clean run is
    /// reported as `moduleDestroyed`.
    async fn destroy(&self, name: &str, handle: ModuleHandle) {
        if !handle.supports_destroy() {
            return;
        }
        match AssertUnwindSafe(handle.destroy()).catch_unwind().await {
            Ok(Ok(())) => {
                self.events
                    .notify(&ModuleEvent::Destroyed { name: name.to_string() })
                    .await;
            }
            Ok(Err(e)) => warn!(module = name, error = %e, "destroy hook failed"),
            Err(panic) => warn!(module = name, panic = %panic_message(panic), "destroy hook panicked"),
        }
    }
}

/// First failure wins: move `path` to `<path>-ERROR`, or delete it when that already exists.
async fn quarantine(path: &Path) {
    if tokio::fs::metadata(path).await.is_err() {
        return;
    }
    let quarantined = quarantine_path(path);
    if tokio::fs::metadata(&quarantined).await.is_ok() {
        info!(path = %path.display(), existing = %quarantined.display(), "quarantine exists, deleting failed install");
        if let Err(e) = tokio::fs::remove_dir_all(path).await {
            error!(path = %path.display(), error = %e, "unable to delete failed install");
        }
    } else {
        info!(path = %path.display(), to = %quarantined.display(), "quarantining failed install");
        if let Err(e) = tokio::fs::rename(path, &quarantined).await {
            error!(path = %path.display(), error = %e, "unable to quarantine failed install");
        }
    }
}
