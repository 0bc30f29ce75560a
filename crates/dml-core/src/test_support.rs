//! Fixtures shared by the unit and pipeline tests.

use std::any::Any;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;

use crate::error::BoxError;
use crate::module::{CodeLoader, LoadContext, LoadedModule, ModuleHandle};

pub const ENTRY_FILE: &str = "lib/index.json";

/// Write a module tree: package.json pointing at lib/index.json, and the descriptor itself.
/// `destroy` is "ok", "error" or "panic" to give the module a destroy hook.
pub fn write_module_dir(dir: &Path, display_name: &str, destroy: Option<&str>) {
    std::fs::create_dir_all(dir.join("lib")).expect("mkdir lib");
    let manifest = serde_json::json!({
        "name": "test-dynamic-module",
        "version": "0.0.1",
        "main": ENTRY_FILE,
    });
    std::fs::write(dir.join("package.json"), manifest.to_string()).expect("write manifest");
    let descriptor = serde_json::json!({ "name": display_name, "destroy": destroy });
    std::fs::write(dir.join(ENTRY_FILE), descriptor.to_string()).expect("write descriptor");
}

/// Tarball whose single top-level directory is `top`.
pub fn tar_gz_fixture(src: &Path, top: &str, out: &Path) -> PathBuf {
    let f = File::create(out).expect("create tarball");
    let enc = GzEncoder::new(f, Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder.append_dir_all(top, src).expect("append tree");
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
    out.to_path_buf()
}

/// Zip whose single top-level directory is `top`, built with the zip tool.
pub fn zip_fixture(zip: &Path, src: &Path, top: &str, out: &Path) -> PathBuf {
    let staging = tempfile::tempdir().expect("staging");
    crate::utils::copy_dir_recursive(src, &staging.path().join(top)).expect("stage tree");
    let status = std::process::Command::new(zip)
        .arg("-q")
        .arg("-r")
        .arg(out)
        .arg(top)
        .current_dir(staging.path())
        .status()
        .expect("run zip");
    assert!(status.success(), "zip failed");
    out.to_path_buf()
}

pub fn tool_available(name: &str) -> Option<PathBuf> {
    ["/usr/bin", "/bin", "/usr/local/bin"]
        .iter()
        .map(|d| Path::new(d).join(name))
        .find(|p| p.is_file())
}

pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    name: Option<String>,
    destroy: Option<String>,
}

/// Module loaded from a JSON descriptor instead of native code.
pub struct DescriptorModule {
    entry_point: PathBuf,
    name: Option<String>,
    destroy: Option<String>,
    pub destroyed: AtomicUsize,
}

#[async_trait]
impl LoadedModule for DescriptorModule {
    fn entry_point(&self) -> &Path {
        &self.entry_point
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn supports_destroy(&self) -> bool {
        matches!(self.destroy.as_deref(), Some("ok" | "error" | "panic"))
    }

    async fn destroy(&self) -> Result<(), BoxError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        match self.destroy.as_deref() {
            Some("error") => Err("destroy failed".into()),
            Some("panic") => panic!("destroy panicked"),
            _ => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct DescriptorLoader {
    pub loads: AtomicUsize,
}

impl DescriptorLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeLoader for DescriptorLoader {
    async fn load(&self, entry_point: &Path, _cx: &LoadContext<'_>) -> Result<ModuleHandle, BoxError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let body = tokio::fs::read(entry_point).await?;
        let d: Descriptor = serde_json::from_slice(&body)?;
        Ok(Arc::new(DescriptorModule {
            entry_point: entry_point.to_path_buf(),
            name: d.name,
            destroy: d.destroy,
            destroyed: AtomicUsize::new(0),
        }))
    }
}
