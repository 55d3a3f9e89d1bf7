//! Git subprocess invocation.
//!
//! Thin async wrapper around the `git` binary. Every call carries an explicit
//! time budget so a wedged remote or filesystem cannot hang a worker, and the
//! three failure modes (binary missing, non-zero exit, timeout) map onto the
//! `ToolError` taxonomy.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::ToolError;

const GIT_HINT: &str = "install git and ensure it is on PATH";

/// Captured output of a finished git command.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Handle on a git binary, normally just `git` from PATH.
#[derive(Debug, Clone)]
pub struct Git {
    binary: PathBuf,
}

impl Default for Git {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

impl Git {
    #[cfg(test)]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs git and requires a zero exit; stderr becomes the error detail
    /// otherwise.
    pub async fn run(
        &self,
        cwd: Option<&Path>,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput, ToolError> {
        let output = self.run_status(cwd, args, timeout).await?;
        if !output.success() {
            return Err(ToolError::Failed {
                tool: "git",
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Runs git and reports a non-zero exit as data rather than an error.
    /// Used where failure is an answer, e.g. `rev-parse --verify` on a ref
    /// that may not exist yet.
    pub async fn run_status(
        &self,
        cwd: Option<&Path>,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput, ToolError> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|err| ToolError::from_spawn("git", GIT_HINT, err))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::TimedOut { tool: "git" })?
            .map_err(|err| ToolError::Failed {
                tool: "git",
                stderr: err.to_string(),
            })?;

        Ok(GitOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_stdout_for_successful_command() {
        let git = Git::default();
        let output = git
            .run(None, &["--version"], Duration::from_secs(10))
            .await
            .expect("git --version should succeed");
        assert!(output.stdout.to_ascii_lowercase().contains("git version"));
    }

    #[tokio::test]
    async fn run_classifies_non_zero_exit_as_failed() {
        let git = Git::default();
        let dir = tempfile::tempdir().expect("tempdir");
        let err = git
            .run(
                Some(dir.path()),
                &["definitely-not-a-real-subcommand"],
                Duration::from_secs(10),
            )
            .await
            .expect_err("unknown subcommand should fail");
        match err {
            ToolError::Failed { tool, stderr } => {
                assert_eq!(tool, "git");
                assert!(!stderr.is_empty());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_classifies_missing_binary_as_missing() {
        let git = Git::with_binary("/definitely/missing/git-binary");
        let err = git
            .run(None, &["status"], Duration::from_secs(10))
            .await
            .expect_err("missing binary should fail");
        assert!(matches!(err, ToolError::Missing { tool: "git", .. }));
    }

    #[tokio::test]
    async fn run_status_reports_non_zero_as_data() {
        let git = Git::default();
        let dir = tempfile::tempdir().expect("tempdir");
        git.run(
            Some(dir.path()),
            &["init", "--quiet"],
            Duration::from_secs(10),
        )
        .await
        .expect("git init");

        let output = git
            .run_status(
                Some(dir.path()),
                &["rev-parse", "--verify", "no-such-ref"],
                Duration::from_secs(10),
            )
            .await
            .expect("rev-parse should run");
        assert!(!output.success());
    }
}
