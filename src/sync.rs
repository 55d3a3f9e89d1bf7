//! Repository synchronization.
//!
//! Brings a service's working copy to the tip of its pinned branch before
//! every start: clone on first use, fetch + hard reset afterwards, then an
//! optional dependency install. Blocking by design; the start worker owns
//! retry policy (there is none — a failed sync fails the start cycle).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::info;

use crate::error::ToolError;
use crate::git::Git;
use crate::service::ServiceSpec;

const CLONE_TIMEOUT: Duration = Duration::from_secs(120);
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

const NPM_HINT: &str = "install Node.js from https://nodejs.org";

/// Clones the repository on first use, otherwise fast-forwards the working
/// copy to `origin/<branch>` with a hard reset. Returns the working-copy
/// path.
pub async fn ensure_repo(
    git: &Git,
    spec: &ServiceSpec,
    services_dir: &Path,
) -> Result<PathBuf, ToolError> {
    let dir = services_dir.join(&spec.name);
    if !dir.exists() {
        info!(service = %spec.name, branch = %spec.branch, "cloning repository");
        let url = spec.clone_url();
        let dir_arg = dir.to_string_lossy().into_owned();
        git.run(
            None,
            &[
                "clone",
                "--depth",
                "1",
                "--branch",
                &spec.branch,
                &url,
                &dir_arg,
            ],
            CLONE_TIMEOUT,
        )
        .await?;
    } else {
        info!(service = %spec.name, branch = %spec.branch, "syncing repository");
        git.run(
            Some(&dir),
            &["fetch", "--depth", "1", "origin", &spec.branch],
            FETCH_TIMEOUT,
        )
        .await?;
        let target = format!("origin/{}", spec.branch);
        git.run(Some(&dir), &["reset", "--hard", &target], FETCH_TIMEOUT)
            .await?;
    }
    Ok(dir)
}

/// Runs `npm install` when the working copy carries a `package.json`;
/// otherwise does nothing.
pub async fn install_dependencies(dir: &Path) -> Result<(), ToolError> {
    if !dir.join("package.json").exists() {
        return Ok(());
    }
    info!(dir = %dir.display(), "installing dependencies");
    let child = Command::new("npm")
        .arg("install")
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| ToolError::from_spawn("npm", NPM_HINT, err))?;

    let output = tokio::time::timeout(INSTALL_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| ToolError::TimedOut { tool: "npm install" })?
        .map_err(|err| ToolError::Failed {
            tool: "npm install",
            stderr: err.to_string(),
        })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            tool: "npm install",
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_origin(git: &Git, dir: &Path) {
        let t = Duration::from_secs(10);
        git.run(Some(dir), &["init", "--quiet", "-b", "main"], t)
            .await
            .expect("git init");
        git.run(Some(dir), &["config", "user.email", "dev@example.com"], t)
            .await
            .expect("config email");
        git.run(Some(dir), &["config", "user.name", "Dev"], t)
            .await
            .expect("config name");
        std::fs::write(dir.join("README.md"), "hello\n").expect("write file");
        git.run(Some(dir), &["add", "."], t).await.expect("add");
        git.run(Some(dir), &["commit", "-q", "-m", "initial"], t)
            .await
            .expect("commit");
    }

    fn spec(name: &str, origin: &Path) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            repo: origin.to_string_lossy().into_owned(),
            branch: "main".to_string(),
            start_command: "true".to_string(),
            url: None,
            backup: true,
        }
    }

    #[tokio::test]
    async fn clones_then_resets_to_remote_tip() {
        let git = Git::default();
        let root = tempfile::tempdir().expect("tempdir");
        let origin = root.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        init_origin(&git, &origin).await;

        let services_dir = root.path().join("services");
        std::fs::create_dir_all(&services_dir).unwrap();
        let spec = spec("web", &origin);

        let dir = ensure_repo(&git, &spec, &services_dir).await.expect("clone");
        assert!(dir.join("README.md").exists());

        // Advance the origin, dirty the working copy, and sync again: the
        // copy must land on the new tip with local edits discarded.
        std::fs::write(origin.join("README.md"), "updated\n").unwrap();
        let t = Duration::from_secs(10);
        git.run(Some(&origin), &["commit", "-q", "-am", "update"], t)
            .await
            .expect("second commit");
        std::fs::write(dir.join("README.md"), "local edit\n").unwrap();

        let dir = ensure_repo(&git, &spec, &services_dir).await.expect("sync");
        let contents = std::fs::read_to_string(dir.join("README.md")).unwrap();
        assert_eq!(contents, "updated\n");
    }

    #[tokio::test]
    async fn clone_failure_carries_stderr() {
        let git = Git::default();
        let root = tempfile::tempdir().expect("tempdir");
        let services_dir = root.path().join("services");
        std::fs::create_dir_all(&services_dir).unwrap();
        let spec = spec("gone", Path::new("/definitely/missing/repo.git"));

        let err = ensure_repo(&git, &spec, &services_dir)
            .await
            .expect_err("clone of a missing repo should fail");
        match err {
            ToolError::Failed { tool, stderr } => {
                assert_eq!(tool, "git");
                assert!(!stderr.is_empty());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn install_skips_without_package_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        install_dependencies(dir.path())
            .await
            .expect("no package.json means no-op");
    }
}
