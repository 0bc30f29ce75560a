use std::fs;
use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Spawn `program` in `cwd`, stream stdout to the log at info (stderr at warn when
/// `stderr_as_warning`), and wait for exit. Returns the exit code (None when killed by a signal).
pub async fn spawn_streaming(
    program: &Path,
    args: &[String],
    cwd: Option<&Path>,
    stderr_as_warning: bool,
) -> io::Result<Option<i32>> {
    let label = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let mut child = cmd.spawn()?;

    let out = child.stdout.take().map(|s| {
        let label = label.clone();
        tokio::spawn(async move { pump(s, &label, false).await })
    });
    let err = child.stderr.take().map(|s| {
        let label = label.clone();
        tokio::spawn(async move { pump(s, &label, stderr_as_warning).await })
    });

    let status = child.wait().await?;
    for task in [out, err].into_iter().flatten() {
        let _ = task.await;
    }
    Ok(status.code())
}

async fn pump<R: AsyncRead + Unpin>(stream: R, label: &str, warning: bool) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if warning {
            warn!("{} (stderr): {}", label, line);
        } else {
            info!("{}: {}", label, line);
        }
    }
}

/// Recursively copy `src` into `dest` (created if missing). Files go through reflink when the
/// filesystem supports it; symlinks are recreated, not followed.
pub fn copy_dir_recursive(src: &Path, dest: &Path) -> io::Result<u64> {
    fs::create_dir_all(dest)?;
    let mut copied = 0u64;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ft = entry.file_type()?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if ft.is_dir() {
            copied += copy_dir_recursive(&from, &to)?;
        } else if ft.is_symlink() {
            copy_symlink(&from, &to)?;
            copied += 1;
        } else {
            reflink_copy::reflink_or_copy(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let target = fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let meta = fs::metadata(from)?;
    if meta.is_dir() {
        copy_dir_recursive(from, to).map(|_| ())
    } else {
        fs::copy(from, to).map(|_| ())
    }
}

/// remove_dir_all that treats "already gone" as success.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
