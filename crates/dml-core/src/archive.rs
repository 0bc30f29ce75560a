//! Package formats. `.tar.gz` is unpacked in-process into the installation base; `.zip` goes
//! through the external unzip tool into the module's own directory.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, info};

use crate::error::{DmlError, Result};
use crate::manifest::{find_manifest, MANIFEST_FILE};
use crate::utils::spawn_streaming;

pub const ZIP_SUFFIX: &str = ".zip";
pub const TAR_GZIP_SUFFIX: &str = ".tar.gz";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageFormat {
    Zip,
    TarGz,
}

impl PackageFormat {
    pub fn from_extension(ext: &str) -> Result<Self> {
        match ext {
            ZIP_SUFFIX => Ok(PackageFormat::Zip),
            TAR_GZIP_SUFFIX => Ok(PackageFormat::TarGz),
            other => Err(DmlError::UnknownPackageFormat {
                extension: other.to_string(),
            }),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            PackageFormat::Zip => ZIP_SUFFIX,
            PackageFormat::TarGz => TAR_GZIP_SUFFIX,
        }
    }

    /// Unpack `archive` and return the directory holding the module's manifest.
    ///
    /// `install_base` is `<installRoot>[/<scope>]`, `install_path` is `install_base/<name>`.
    /// Tarballs carry the module directory at their top level, so they unpack into the base
    /// and the manifest must then sit directly in `install_path`. Zips may wrap the module in
    /// arbitrary directories; they unpack into `install_path` and the manifest with the shortest path wins.
    pub async fn extract(
        &self,
        archive: &Path,
        install_base: &Path,
        install_path: &Path,
        unzip: &Path,
    ) -> Result<PathBuf> {
        match self {
            PackageFormat::TarGz => {
                info!(archive = %archive.display(), dest = %install_base.display(), "unpacking tarball");
                let src = archive.to_path_buf();
                let dest = install_base.to_path_buf();
                tokio::task::spawn_blocking(move || unpack_tar_gz(&src, &dest))
                    .await
                    .map_err(|e| DmlError::Extraction {
                        archive: archive.to_path_buf(),
                        message: format!("extraction task failed: {}", e),
                    })??;
                if !install_path.join(MANIFEST_FILE).is_file() {
                    return Err(DmlError::ManifestNotFound {
                        dir: install_path.to_path_buf(),
                    });
                }
                Ok(install_path.to_path_buf())
            }
            PackageFormat::Zip => {
                info!(archive = %archive.display(), dest = %install_path.display(), "unzipping");
                unzip_into(unzip, archive, install_path).await?;
                let root = install_path.to_path_buf();
                let dir = tokio::task::spawn_blocking(move || find_manifest(&root))
                    .await
                    .map_err(|e| DmlError::Extraction {
                        archive: archive.to_path_buf(),
                        message: format!("manifest search failed: {}", e),
                    })??;
                debug!(dir = %dir.display(), "found {}", MANIFEST_FILE);
                Ok(dir)
            }
        }
    }
}

impl fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Unpack entry by entry; `unpack_in` refuses entries that would land outside `dest`.
fn unpack_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let extraction = |message: String| DmlError::Extraction {
        archive: archive.to_path_buf(),
        message,
    };

    let f = File::open(archive).map_err(|e| DmlError::io("open archive", archive, e))?;
    let dec = GzDecoder::new(BufReader::new(f));
    let mut tar = Archive::new(dec);
    tar.set_preserve_permissions(true);

    std::fs::create_dir_all(dest).map_err(|e| DmlError::io("create install dir", dest, e))?;

    let entries = tar.entries().map_err(|e| extraction(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| extraction(e.to_string()))?;
        let unpacked = entry.unpack_in(dest).map_err(|e| extraction(e.to_string()))?;
        if !unpacked {
            let path = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(extraction(format!("entry '{}' escapes the install directory", path)));
        }
    }
    Ok(())
}

async fn unzip_into(unzip: &Path, archive: &Path, dest: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| DmlError::io("create install dir", dest, e))?;
    let args = vec![
        "-o".to_string(),
        archive.to_string_lossy().into_owned(),
        "-d".to_string(),
        dest.to_string_lossy().into_owned(),
    ];
    let code = spawn_streaming(unzip, &args, None, true)
        .await
        .map_err(|e| DmlError::Extraction {
            archive: archive.to_path_buf(),
            message: format!("cannot run '{}': {}", unzip.display(), e),
        })?;
    match code {
        Some(0) => Ok(()),
        other => Err(DmlError::Extraction {
            archive: archive.to_path_buf(),
            message: format!(
                "exit code of '{}' was {}. See log for details",
                unzip.display(),
                other.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{tar_gz_fixture, tool_available, write_module_dir, zip_fixture};

    #[test]
    fn extension_dispatch() {
        assert_eq!(PackageFormat::from_extension(".zip").unwrap(), PackageFormat::Zip);
        assert_eq!(PackageFormat::from_extension(".tar.gz").unwrap(), PackageFormat::TarGz);
        assert!(matches!(
            PackageFormat::from_extension(".tgz"),
            Err(DmlError::UnknownPackageFormat { .. })
        ));
        assert_eq!(PackageFormat::Zip.to_string(), ".zip");
    }

    #[tokio::test]
    async fn tar_gz_unpacks_into_base() {
        let td = tempfile::tempdir().expect("tmp");
        let src = td.path().join("src");
        write_module_dir(&src, "This Is My Name", None);
        let archive = tar_gz_fixture(&src, "m", &td.path().join("m.tar.gz"));

        let base = td.path().join("installed");
        let dir = PackageFormat::TarGz
            .extract(&archive, &base, &base.join("m"), Path::new("/usr/bin/unzip"))
            .await
            .expect("extract");
        assert_eq!(dir, base.join("m"));
        assert!(dir.join("lib/index.json").is_file());
    }

    #[tokio::test]
    async fn tar_gz_without_module_dir_is_manifest_not_found() {
        let td = tempfile::tempdir().expect("tmp");
        let src = td.path().join("src");
        write_module_dir(&src, "x", None);
        let archive = tar_gz_fixture(&src, "other-name", &td.path().join("m.tar.gz"));

        let base = td.path().join("installed");
        let err = PackageFormat::TarGz
            .extract(&archive, &base, &base.join("m"), Path::new("/usr/bin/unzip"))
            .await
            .expect_err("wrong top-level dir");
        assert!(matches!(err, DmlError::ManifestNotFound { .. }));
    }

    #[tokio::test]
    async fn corrupt_tar_gz_is_extraction_error() {
        let td = tempfile::tempdir().expect("tmp");
        let archive = td.path().join("bad.tar.gz");
        std::fs::write(&archive, b"definitely not gzip").expect("write");
        let base = td.path().join("installed");
        let err = PackageFormat::TarGz
            .extract(&archive, &base, &base.join("m"), Path::new("/usr/bin/unzip"))
            .await
            .expect_err("corrupt");
        assert!(matches!(err, DmlError::Extraction { .. }));
    }

    #[tokio::test]
    async fn zip_finds_nested_manifest() {
        let (Some(zip), Some(unzip)) = (tool_available("zip"), tool_available("unzip")) else {
            eprintln!("zip/unzip not installed; skipping");
            return;
        };
        let td = tempfile::tempdir().expect("tmp");
        let src = td.path().join("src");
        write_module_dir(&src, "This Is My Name", None);
        // A fixture tree deeper in the archive must not win over the wrapper's manifest.
        write_module_dir(&src.join("test/fixtures/sample"), "sample", None);
        let archive = zip_fixture(&zip, &src, "wrapper", &td.path().join("m.zip"));

        let base = td.path().join("installed");
        let install_path = base.join("m");
        let dir = PackageFormat::Zip
            .extract(&archive, &base, &install_path, &unzip)
            .await
            .expect("extract");
        assert_eq!(dir, install_path.join("wrapper"));
    }

    #[tokio::test]
    async fn failing_unzip_reports_exit_code() {
        let Some(unzip) = tool_available("unzip") else {
            eprintln!("unzip not installed; skipping");
            return;
        };
        let td = tempfile::tempdir().expect("tmp");
        let archive = td.path().join("bad.zip");
        std::fs::write(&archive, b"not a zip").expect("write");
        let base = td.path().join("installed");
        let err = PackageFormat::Zip
            .extract(&archive, &base, &base.join("m"), &unzip)
            .await
            .expect_err("bad zip");
        assert!(err.to_string().contains("exit code"));
    }
}
