//! Shelling out to external toolchains.
//!
//! The toolchains themselves (rustc, TinyGo, extism-js, extism-py, the
//! AssemblyScript compiler) are external collaborators — this module only
//! knows how to locate an executable on `PATH` and run it, capturing its
//! stdout/stderr for surfacing as a `BuildError` on failure.

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Locate an executable on `PATH`, or fail with a clear message.
pub fn locate(binary: &str) -> Result<PathBuf> {
    which::which(binary).with_context(|| format!("'{binary}' not found on PATH"))
}

/// Output of a completed external process invocation.
pub struct ProcessOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run `binary` with `args` in `working_dir`, capturing stdout/stderr rather
/// than inheriting the parent's (the caller here is a server request, not an
/// interactive CLI, so output is captured and returned instead of streamed
/// live).
#[tracing::instrument(level = "debug", skip(binary, args))]
pub async fn run_captured(
    binary: &Path,
    args: &[impl AsRef<OsStr> + std::fmt::Debug],
    working_dir: impl AsRef<Path>,
) -> Result<ProcessOutput> {
    let output = Command::new(binary)
        .current_dir(working_dir.as_ref())
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("error spawning {binary:?} with args {args:?}"))?;

    Ok(ProcessOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captured_reports_exit_status() {
        let binary = locate("true").expect("'true' should be on PATH in CI environments");
        let out = run_captured(&binary, &[] as &[&str], ".").await.unwrap();
        assert!(out.success);
    }

    #[test]
    fn locate_missing_binary_fails() {
        assert!(locate("ignition-builder-that-does-not-exist").is_err());
    }
}
