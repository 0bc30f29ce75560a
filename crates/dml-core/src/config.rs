//! Loader configuration: defaults, optional .dmlrc (JSON) in the working dir or home, then env.
//! The merged result is fully populated; nothing downstream falls back to defaults on its own.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CONFIG_FILE_NAME: &str = ".dmlrc";

/// Post-install hook run in the module directory after a successful dependency install.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupHook {
    pub enabled: bool,
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
}

impl CleanupHook {
    /// The executable to run, when the hook is switched on and has one.
    pub fn active_executable(&self) -> Option<&Path> {
        if self.enabled {
            self.executable.as_deref()
        } else {
            None
        }
    }
}

/// Process-wide loader settings. Built once, read by every pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub installer_executable_path: PathBuf,
    pub installer_extra_options: Vec<String>,
    pub install_verbose: bool,
    pub skip_install: bool,
    pub download_dir: PathBuf,
    pub install_root: PathBuf,
    pub package_server_url: String,
    pub default_package_extension: String,
    pub lock_timeout_ms: u64,
    pub lock_dir: PathBuf,
    pub lock_owner: String,
    pub unzip_executable_path: PathBuf,
    /// Packing counterpart of `unzip_executable_path`. Loading never packs; tooling that
    /// builds `.zip` packages for a server reads it from here.
    pub zip_executable_path: PathBuf,
    pub default_entry_point: String,
    pub prestaged_dependencies_dir: Option<PathBuf>,
    pub cleanup: CleanupHook,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            installer_executable_path: PathBuf::from("/usr/local/bin/npm"),
            installer_extra_options: Vec::new(),
            install_verbose: false,
            skip_install: false,
            download_dir: PathBuf::from("downloads"),
            install_root: PathBuf::from("installed-modules"),
            package_server_url: "http://localhost".to_string(),
            default_package_extension: ".tar.gz".to_string(),
            lock_timeout_ms: 30_000,
            lock_dir: PathBuf::from("locks"),
            lock_owner: "DynamicModuleLoader".to_string(),
            unzip_executable_path: PathBuf::from("/usr/bin/unzip"),
            zip_executable_path: PathBuf::from("/usr/bin/zip"),
            default_entry_point: "lib/index.js".to_string(),
            prestaged_dependencies_dir: None,
            cleanup: CleanupHook::default(),
        }
    }
}

/// Overlay read from .dmlrc. Every field optional; absent keys keep the current value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub installer_executable_path: Option<PathBuf>,
    pub installer_extra_options: Option<Vec<String>>,
    pub install_verbose: Option<bool>,
    pub skip_install: Option<bool>,
    pub download_dir: Option<PathBuf>,
    pub install_root: Option<PathBuf>,
    pub package_server_url: Option<String>,
    pub default_package_extension: Option<String>,
    pub lock_timeout_ms: Option<u64>,
    pub lock_dir: Option<PathBuf>,
    pub lock_owner: Option<String>,
    pub unzip_executable_path: Option<PathBuf>,
    pub zip_executable_path: Option<PathBuf>,
    pub default_entry_point: Option<String>,
    pub prestaged_dependencies_dir: Option<PathBuf>,
    pub cleanup: Option<CleanupHook>,
}

impl Config {
    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms)
    }

    /// Apply a .dmlrc overlay.
    pub fn merge(&mut self, file: ConfigFile) {
        if let Some(v) = file.installer_executable_path {
            self.installer_executable_path = v;
        }
        if let Some(v) = file.installer_extra_options {
            self.installer_extra_options = v;
        }
        if let Some(v) = file.install_verbose {
            self.install_verbose = v;
        }
        if let Some(v) = file.skip_install {
            self.skip_install = v;
        }
        if let Some(v) = file.download_dir {
            self.download_dir = v;
        }
        if let Some(v) = file.install_root {
            self.install_root = v;
        }
        if let Some(v) = file.package_server_url {
            self.package_server_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = file.default_package_extension {
            self.default_package_extension = v;
        }
        if let Some(v) = file.lock_timeout_ms {
            self.lock_timeout_ms = v;
        }
        if let Some(v) = file.lock_dir {
            self.lock_dir = v;
        }
        if let Some(v) = file.lock_owner {
            self.lock_owner = v;
        }
        if let Some(v) = file.unzip_executable_path {
            self.unzip_executable_path = v;
        }
        if let Some(v) = file.zip_executable_path {
            self.zip_executable_path = v;
        }
        if let Some(v) = file.default_entry_point {
            self.default_entry_point = v;
        }
        if file.prestaged_dependencies_dir.is_some() {
            self.prestaged_dependencies_dir = file.prestaged_dependencies_dir;
        }
        if let Some(v) = file.cleanup {
            self.cleanup = v;
        }
    }

    /// Apply DML_* overrides. `var` is the env lookup (std::env::var in production).
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str| {
            non_empty(key).and_then(|v| match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Some(true),
                "0" | "false" | "no" => Some(false),
                _ => None,
            })
        };

        if let Some(v) = non_empty("DML_INSTALLER") {
            self.installer_executable_path = PathBuf::from(v);
        }
        if let Some(v) = flag("DML_INSTALL_VERBOSE") {
            self.install_verbose = v;
        }
        if let Some(v) = flag("DML_SKIP_INSTALL") {
            self.skip_install = v;
        }
        if let Some(v) = non_empty("DML_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty("DML_INSTALL_ROOT") {
            self.install_root = PathBuf::from(v);
        }
        if let Some(v) = non_empty("DML_PACKAGE_SERVER_URL") {
            self.package_server_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = non_empty("DML_PACKAGE_EXTENSION") {
            self.default_package_extension = v;
        }
        if let Some(v) = non_empty("DML_LOCK_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.lock_timeout_ms = v;
        }
        if let Some(v) = non_empty("DML_LOCK_DIR") {
            self.lock_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty("DML_LOCK_OWNER") {
            self.lock_owner = v;
        }
        if let Some(v) = non_empty("DML_UNZIP") {
            self.unzip_executable_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("DML_ZIP") {
            self.zip_executable_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("DML_PRESTAGED_DEPENDENCIES") {
            self.prestaged_dependencies_dir = Some(PathBuf::from(v));
        }
    }
}

fn read_config_file(path: &Path) -> Option<ConfigFile> {
    let s = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<ConfigFile>(&s) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring invalid config file");
            None
        }
    }
}

/// Load config from .dmlrc in dir, then ~/.dmlrc, then DML_* env. Missing or invalid file = defaults.
pub fn load_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    let mut candidates = vec![dir.join(CONFIG_FILE_NAME)];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(CONFIG_FILE_NAME));
    }
    for path in &candidates {
        if path.is_file() {
            if let Some(file) = read_config_file(path) {
                debug!(path = %path.display(), "loaded config file");
                cfg.merge(file);
            }
            break;
        }
    }
    cfg.apply_env(|k| std::env::var(k).ok());
    cfg
}
