//! Integration tests: run the dml binary and check exit codes and output.

use std::path::Path;
use std::process::Command;

fn dml() -> Command {
    Command::new(env!("CARGO_BIN_EXE_dml"))
}

/// dml confined to `dir`: no ~/.dmlrc, relative paths land in `dir`.
fn dml_in(dir: &Path) -> Command {
    let mut cmd = dml();
    cmd.current_dir(dir)
        .env("HOME", dir)
        .env("NO_COLOR", "1")
        .env_remove("DML_LOG");
    for (key, _) in std::env::vars() {
        if key.starts_with("DML_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

#[test]
fn test_help() {
    let out = dml().arg("--help").output().unwrap();
    assert!(out.status.success(), "dml --help should succeed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("load"));
    assert!(stdout.contains("evict"));
    assert!(stdout.contains("config"));
}

#[test]
fn test_version() {
    let out = dml().arg("--version").output().unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_config_json_reflects_env_and_rc_file() {
    let td = tempfile::tempdir().expect("tmp");
    std::fs::write(td.path().join(".dmlrc"), r#"{ "lockOwner": "from-rc" }"#).unwrap();
    let out = dml_in(td.path())
        .args(["config", "--json"])
        .env("DML_INSTALL_ROOT", "/srv/modules")
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json output");
    assert_eq!(v["installRoot"], "/srv/modules");
    assert_eq!(v["lockOwner"], "from-rc");
    assert_eq!(v["defaultPackageExtension"], ".tar.gz");
}

#[test]
fn test_load_missing_package_fails() {
    let td = tempfile::tempdir().expect("tmp");
    let server = format!("file://{}", td.path().join("server").display());
    let out = dml_in(td.path())
        .args(["load", "no-such-module"])
        .env("DML_PACKAGE_SERVER_URL", &server)
        .env("DML_SKIP_INSTALL", "1")
        .env("DML_LOCK_TIMEOUT_MS", "1000")
        .output()
        .unwrap();
    assert!(!out.status.success(), "loading a missing package should fail");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no-such-module"));
    assert!(stderr.contains("download"));
    // Lock released even though the load failed.
    assert!(!td.path().join("locks/no-such-module.lock").exists());
}

#[test]
fn test_load_rejects_unknown_extension() {
    let out = dml().args(["load", "m", "--extension", ".rar"]).output().unwrap();
    assert!(!out.status.success());
}

#[test]
fn test_evict_unloaded_module_succeeds() {
    let td = tempfile::tempdir().expect("tmp");
    let out = dml_in(td.path()).args(["evict", "m"]).output().unwrap();
    assert!(out.status.success(), "evict should succeed: {}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Evicted m"));
}
