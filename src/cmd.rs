//! Privileged host command execution.
//!
//! Every external tool the driver touches (losetup, qemu-nbd, kpartx,
//! mount, rbd, resize tools) goes through this module so exit status,
//! stdout and stderr are captured uniformly. Host tools run under sudo;
//! the invoking process blocks until the tool exits.

use crate::error::{Error, Result};
use std::process::{Command, Stdio};

/// Captured output of a finished host command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    /// Exit code (-1 if terminated by signal).
    pub status: i32,
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
}

impl CmdOutput {
    /// True if the command exited zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Run a host command under sudo, failing on non-zero exit.
pub fn run(program: &str, args: &[&str]) -> Result<CmdOutput> {
    let out = run_unchecked(program, args)?;

    if !out.success() {
        return Err(Error::command_failed(program, out.stderr.clone()));
    }

    Ok(out)
}

/// Run a host command under sudo, tolerating non-zero exit.
///
/// Used where a failing probe is an answer, not an error (e.g. kpartx
/// on a partition-less device, fstab probing).
pub fn run_unchecked(program: &str, args: &[&str]) -> Result<CmdOutput> {
    tracing::debug!(command = %program, args = ?args, "running host command");

    let output = Command::new("sudo")
        .arg(program)
        .args(args)
        .output()
        .map_err(|e| Error::command_failed(program, e.to_string()))?;

    let out = CmdOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if !out.success() {
        tracing::debug!(command = %program, status = out.status, stderr = %out.stderr,
            "host command exited non-zero");
    }

    Ok(out)
}

/// Check if a host tool can be spawned at all.
pub fn is_available(tool: &str) -> bool {
    Command::new(tool)
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Require a host tool, mapping absence to `BackendUnavailable`.
pub fn require(tool: &str) -> Result<()> {
    if is_available(tool) {
        Ok(())
    } else {
        Err(Error::backend_unavailable(tool))
    }
}

/// Create a directory (and parents) as root.
pub fn mkdir_p(path: &std::path::Path) -> Result<()> {
    // Try unprivileged first; datastore directories are often root-owned.
    if std::fs::create_dir_all(path).is_ok() {
        return Ok(());
    }

    run("mkdir", &["-p", &path.to_string_lossy()])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_available_for_missing_tool() {
        assert!(!is_available("definitely-not-a-real-tool-xyz"));
    }

    #[test]
    fn test_require_maps_to_backend_unavailable() {
        let err = require("definitely-not-a-real-tool-xyz").unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { .. }));
        assert!(err.to_string().contains("definitely-not-a-real-tool-xyz"));
    }

    #[test]
    fn test_cmd_output_success() {
        let out = CmdOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(out.success());

        let out = CmdOutput {
            status: 2,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert!(!out.success());
    }
}
