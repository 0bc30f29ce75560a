//! package.json: locating it inside an extracted module and reading the fields the loader uses.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DmlError, Result};
use crate::installer::DEPENDENCY_DIR;

pub const MANIFEST_FILE: &str = "package.json";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: Option<String>,
    pub version: Option<String>,
    pub main: Option<String>,
    /// Replace whatever the installer would produce with the pre-staged dependency tree.
    #[serde(default)]
    pub override_dependencies: bool,
}

impl Manifest {
    pub async fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let s = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| DmlError::io("read manifest", &path, e))?;
        serde_json::from_str(&s).map_err(|e| DmlError::Load {
            path,
            message: format!("invalid {}: {}", MANIFEST_FILE, e),
        })
    }

    /// `main` relative to the module dir, or the configured default when absent.
    pub fn entry_point(&self, dir: &Path, default_entry: &str) -> PathBuf {
        let rel = self
            .main
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(default_entry);
        dir.join(rel)
    }
}

/// Directory of the package.json with the shortest path under `root`.
/// Ties at the same depth go to the lexicographically smallest path. Dependency trees are
/// not searched; they carry package.json files of their own.
pub fn find_manifest(root: &Path) -> Result<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    collect_manifests(root, &mut found);
    found
        .into_iter()
        .min_by(|a, b| {
            a.as_os_str()
                .len()
                .cmp(&b.as_os_str().len())
                .then_with(|| a.cmp(b))
        })
        .ok_or_else(|| DmlError::ManifestNotFound {
            dir: root.to_path_buf(),
        })
}

fn collect_manifests(dir: &Path, out: &mut Vec<PathBuf>) {
    if dir.join(MANIFEST_FILE).is_file() {
        out.push(dir.to_path_buf());
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(ft) = entry.file_type() else { continue };
        if ft.is_dir() && entry.file_name() != DEPENDENCY_DIR {
            collect_manifests(&entry.path(), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, body: &str) {
        std::fs::create_dir_all(dir).expect("mkdir");
        std::fs::write(dir.join(MANIFEST_FILE), body).expect("write manifest");
    }

    #[test]
    fn finds_shallowest_manifest() {
        let td = tempfile::tempdir().expect("tmp");
        let root = td.path();
        write_manifest(&root.join("package/lib/nested"), "{}");
        write_manifest(&root.join("package"), "{}");
        assert_eq!(find_manifest(root).expect("found"), root.join("package"));
    }

    #[test]
    fn manifest_at_root_wins() {
        let td = tempfile::tempdir().expect("tmp");
        write_manifest(td.path(), "{}");
        write_manifest(&td.path().join("sub"), "{}");
        assert_eq!(find_manifest(td.path()).expect("found"), td.path());
    }

    #[test]
    fn ignores_dependency_trees() {
        let td = tempfile::tempdir().expect("tmp");
        write_manifest(&td.path().join("node_modules/dep"), "{}");
        assert!(matches!(
            find_manifest(td.path()),
            Err(DmlError::ManifestNotFound { .. })
        ));
        write_manifest(&td.path().join("pkg/deep"), "{}");
        assert_eq!(find_manifest(td.path()).expect("found"), td.path().join("pkg/deep"));
    }

    #[tokio::test]
    async fn entry_point_uses_main_or_default() {
        let td = tempfile::tempdir().expect("tmp");
        write_manifest(td.path(), r#"{"name":"m","main":"dist/main.so","overrideDependencies":true}"#);
        let m = Manifest::read(td.path()).await.expect("read");
        assert!(m.override_dependencies);
        assert_eq!(m.entry_point(td.path(), "lib/index.js"), td.path().join("dist/main.so"));

        let m = Manifest::default();
        assert!(!m.override_dependencies);
        assert_eq!(m.entry_point(td.path(), "lib/index.js"), td.path().join("lib/index.js"));
    }

    #[tokio::test]
    async fn malformed_manifest_is_load_error() {
        let td = tempfile::tempdir().expect("tmp");
        write_manifest(td.path(), "{ nope");
        assert!(matches!(Manifest::read(td.path()).await, Err(DmlError::Load { .. })));
    }
}
