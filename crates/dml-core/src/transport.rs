//! Fetch a module package into a local file. Supports file://, http:// and https:// sources.
//! The body streams into `<target>.part` and is only renamed onto the target after the write
//! side has been flushed and synced, so a failed download never looks complete.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::error::{DmlError, Result};

const PART_SUFFIX: &str = ".part";
#[cfg(feature = "http-reqwest")]
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Where a package comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Locator {
    File(PathBuf),
    Http(String),
}

impl Locator {
    pub fn parse(source: &str) -> Result<Self> {
        let Some((scheme, rest)) = source.split_once("://") else {
            return Err(DmlError::UnknownProtocol {
                url: source.to_string(),
            });
        };
        match scheme.to_ascii_lowercase().as_str() {
            "file" => {
                // file:///abs/path and file://localhost/abs/path
                let path = rest.strip_prefix("localhost").unwrap_or(rest);
                if path.is_empty() {
                    return Err(DmlError::UnknownProtocol {
                        url: source.to_string(),
                    });
                }
                Ok(Locator::File(PathBuf::from(path)))
            }
            "http" | "https" => Ok(Locator::Http(source.to_string())),
            _ => Err(DmlError::UnknownProtocol {
                url: source.to_string(),
            }),
        }
    }
}

/// Download client. One per loader; the HTTP client inside reuses connections.
pub struct Transport {
    #[cfg(feature = "http-reqwest")]
    client: reqwest::Client,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "http-reqwest")]
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Fetch `source` into `target`. Returns the target path.
    pub async fn fetch(&self, source: &str, target: &Path) -> Result<PathBuf> {
        debug!(source, target = %target.display(), "downloading");
        let part = part_path(target);
        let result = match Locator::parse(source)? {
            Locator::File(path) => copy_local(&path, &part).await,
            Locator::Http(url) => self.get_to_file(&url, &part).await,
        };
        match result {
            Ok(()) => {
                tokio::fs::rename(&part, target)
                    .await
                    .map_err(|e| DmlError::io("finalize download", target, e))?;
                Ok(target.to_path_buf())
            }
            Err(e) => {
                error!(source, target = %target.display(), error = %e, "download failed");
                let _ = tokio::fs::remove_file(&part).await;
                let _ = tokio::fs::remove_file(target).await;
                Err(e)
            }
        }
    }

    #[cfg(feature = "http-reqwest")]
    async fn get_to_file(&self, url: &str, dest: &Path) -> Result<()> {
        let transport_err = |status: Option<u16>, message: String| DmlError::Transport {
            url: url.to_string(),
            status,
            message,
        };

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_err(e.status().map(|s| s.as_u16()), e.to_string()))?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(transport_err(
                Some(status.as_u16()),
                format!("Status code {}", status.as_u16()),
            ));
        }

        let mut out = tokio::fs::File::create(dest)
            .await
            .map_err(|e| DmlError::io("create download file", dest, e))?;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| transport_err(Some(status.as_u16()), e.to_string()))?
        {
            out.write_all(&chunk)
                .await
                .map_err(|e| DmlError::io("write download file", dest, e))?;
        }
        finish(out, dest).await
    }

    #[cfg(not(feature = "http-reqwest"))]
    async fn get_to_file(&self, url: &str, _dest: &Path) -> Result<()> {
        Err(DmlError::Transport {
            url: url.to_string(),
            status: None,
            message: "built without HTTP support (enable the http-reqwest feature)".to_string(),
        })
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_os_string();
    s.push(PART_SUFFIX);
    PathBuf::from(s)
}

async fn copy_local(source: &Path, dest: &Path) -> Result<()> {
    let mut input = tokio::fs::File::open(source)
        .await
        .map_err(|e| DmlError::Transport {
            url: format!("file://{}", source.display()),
            status: None,
            message: e.to_string(),
        })?;
    let mut out = tokio::fs::File::create(dest)
        .await
        .map_err(|e| DmlError::io("create download file", dest, e))?;
    tokio::io::copy(&mut input, &mut out)
        .await
        .map_err(|e| DmlError::io("copy local package", source, e))?;
    finish(out, dest).await
}

/// Flush and sync; the download counts as complete only after this.
async fn finish(mut out: tokio::fs::File, dest: &Path) -> Result<()> {
    out.flush()
        .await
        .map_err(|e| DmlError::io("flush download file", dest, e))?;
    out.sync_all()
        .await
        .map_err(|e| DmlError::io("sync download file", dest, e))?;
    Ok(())
}
