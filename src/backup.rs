//! Silent working-tree backups.
//!
//! On a fixed interval, every backup-enabled service with an existing working
//! copy gets its uncommitted changes committed to a dedicated `fairy-backup`
//! branch using git plumbing only: the user's branch, HEAD, and staged state
//! are left exactly as they were, and the snapshot is invisible to a normal
//! `git status`. Nothing in this module ever raises to its caller; failures
//! are appended to a per-service log file and traced, and one service's
//! failure never blocks another's backup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::git::Git;
use crate::service::ServiceSpec;

/// Branch receiving the snapshots.
pub const BACKUP_BRANCH: &str = "fairy-backup";
const BACKUP_REF: &str = "refs/heads/fairy-backup";
/// Per-service file receiving backup failure reports.
pub const BACKUP_LOG: &str = "fairy-backup.log";

/// Spawns the shared backup task. It observes the current service list
/// through `specs_rx` so removed services stop being swept, and runs until
/// the sender side is dropped.
pub fn spawn_backup_loop(
    git: Git,
    services_dir: PathBuf,
    interval: Duration,
    push: bool,
    specs_rx: watch::Receiver<Vec<ServiceSpec>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if specs_rx.has_changed().is_err() {
                // Supervisor is gone; nothing left to back up.
                return;
            }
            let specs = specs_rx.borrow().clone();
            for spec in specs {
                if !spec.backup {
                    continue;
                }
                let dir = services_dir.join(&spec.name);
                if dir.exists() {
                    backup_service(&git, &dir, push).await;
                }
            }
        }
    })
}

/// Snapshots one working copy. Catches every failure: logged, never raised.
pub async fn backup_service(git: &Git, dir: &Path, push: bool) {
    match snapshot(git, dir, push).await {
        Ok(Some(commit)) => debug!(dir = %dir.display(), %commit, "backup snapshot written"),
        Ok(None) => {}
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "backup failed");
            log_backup_failure(dir, &format!("backup error: {}", err));
        }
    }
}

/// The plumbing sequence. Returns the new commit id, or None when the tree
/// was clean and nothing was written.
async fn snapshot(git: &Git, dir: &Path, push: bool) -> Result<Option<String>, ToolError> {
    let status = git
        .run(Some(dir), &["status", "--porcelain"], Duration::from_secs(10))
        .await?;
    if status.stdout.trim().is_empty() {
        return Ok(None);
    }

    // Stage everything, capture the tree, then put the index back the way it
    // was; the working branch never notices.
    git.run(Some(dir), &["add", "-A"], Duration::from_secs(30))
        .await?;
    let tree = git
        .run(Some(dir), &["write-tree"], Duration::from_secs(10))
        .await?
        .stdout
        .trim()
        .to_string();

    let parent = resolve_parent(git, dir).await?;

    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let message = format!("fairy-backup: {}", timestamp);
    let commit = git
        .run(
            Some(dir),
            &["commit-tree", &tree, "-p", &parent, "-m", &message],
            Duration::from_secs(10),
        )
        .await?
        .stdout
        .trim()
        .to_string();

    git.run(
        Some(dir),
        &["update-ref", BACKUP_REF, &commit],
        Duration::from_secs(5),
    )
    .await?;

    git.run(Some(dir), &["reset", "-q", "HEAD"], Duration::from_secs(10))
        .await?;

    if push {
        // Best effort: the next interval retries from the new tip.
        let result = git
            .run_status(
                Some(dir),
                &["push", "origin", BACKUP_BRANCH],
                Duration::from_secs(30),
            )
            .await;
        match result {
            Ok(output) if !output.success() => {
                log_backup_failure(dir, &format!("push failed: {}", output.stderr.trim()));
            }
            Ok(_) => {}
            Err(err) => log_backup_failure(dir, &format!("push failed: {}", err)),
        }
    }

    Ok(Some(commit))
}

/// Parent of the next snapshot: the backup branch tip when it exists,
/// otherwise the current HEAD commit.
async fn resolve_parent(git: &Git, dir: &Path) -> Result<String, ToolError> {
    let tip = git
        .run_status(
            Some(dir),
            &["rev-parse", "--verify", BACKUP_BRANCH],
            Duration::from_secs(5),
        )
        .await?;
    if tip.success() {
        return Ok(tip.stdout.trim().to_string());
    }
    let head = git
        .run(Some(dir), &["rev-parse", "HEAD"], Duration::from_secs(5))
        .await?;
    Ok(head.stdout.trim().to_string())
}

fn log_backup_failure(dir: &Path, message: &str) {
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let line = format!("{} {}\n", stamp, message);
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(BACKUP_LOG))
        .and_then(|mut file| file.write_all(line.as_bytes()));
    if result.is_err() {
        debug!(dir = %dir.display(), "could not write backup log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn git_ok(git: &Git, dir: &Path, args: &[&str]) -> String {
        git.run(Some(dir), args, Duration::from_secs(10))
            .await
            .unwrap_or_else(|err| panic!("git {:?} failed: {}", args, err))
            .stdout
            .trim()
            .to_string()
    }

    async fn init_repo(git: &Git, dir: &Path) {
        git_ok(git, dir, &["init", "--quiet", "-b", "main"]).await;
        git_ok(git, dir, &["config", "user.email", "dev@example.com"]).await;
        git_ok(git, dir, &["config", "user.name", "Dev"]).await;
        std::fs::write(dir.join("tracked.txt"), "original\n").unwrap();
        git_ok(git, dir, &["add", "."]).await;
        git_ok(git, dir, &["commit", "-q", "-m", "initial"]).await;
    }

    #[tokio::test]
    async fn clean_tree_writes_nothing() {
        let git = Git::default();
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(&git, dir.path()).await;

        let result = snapshot(&git, dir.path(), false).await.expect("snapshot");
        assert!(result.is_none());
        let tip = git
            .run_status(
                Some(dir.path()),
                &["rev-parse", "--verify", BACKUP_BRANCH],
                Duration::from_secs(10),
            )
            .await
            .expect("rev-parse runs");
        assert!(!tip.success(), "no backup ref should exist");
    }

    #[tokio::test]
    async fn dirty_tree_snapshots_without_touching_working_branch() {
        let git = Git::default();
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(&git, dir.path()).await;

        std::fs::write(dir.path().join("tracked.txt"), "edited\n").unwrap();
        std::fs::write(dir.path().join("untracked.txt"), "new\n").unwrap();

        let head_before = git_ok(&git, dir.path(), &["rev-parse", "HEAD"]).await;
        let status_before = git_ok(&git, dir.path(), &["status", "--porcelain"]).await;

        let commit = snapshot(&git, dir.path(), false)
            .await
            .expect("snapshot")
            .expect("dirty tree produces a commit");

        // The snapshot landed on the backup ref and captured the edits.
        let tip = git_ok(&git, dir.path(), &["rev-parse", BACKUP_BRANCH]).await;
        assert_eq!(tip, commit);
        let captured = git_ok(
            &git,
            dir.path(),
            &["show", &format!("{}:tracked.txt", BACKUP_BRANCH)],
        )
        .await;
        assert_eq!(captured, "edited");

        // The user's view is untouched: same HEAD, same uncommitted changes.
        let head_after = git_ok(&git, dir.path(), &["rev-parse", "HEAD"]).await;
        let status_after = git_ok(&git, dir.path(), &["status", "--porcelain"]).await;
        assert_eq!(head_before, head_after);
        assert_eq!(status_before, status_after);
        let branch = git_ok(&git, dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]).await;
        assert_eq!(branch, "main");
    }

    #[tokio::test]
    async fn successive_snapshots_chain_on_the_backup_branch() {
        let git = Git::default();
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(&git, dir.path()).await;

        std::fs::write(dir.path().join("tracked.txt"), "first edit\n").unwrap();
        let first = snapshot(&git, dir.path(), false)
            .await
            .expect("snapshot")
            .expect("commit");

        std::fs::write(dir.path().join("tracked.txt"), "second edit\n").unwrap();
        let second = snapshot(&git, dir.path(), false)
            .await
            .expect("snapshot")
            .expect("commit");

        let parent = git_ok(
            &git,
            dir.path(),
            &["rev-parse", &format!("{}~1", BACKUP_BRANCH)],
        )
        .await;
        assert_eq!(parent, first);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn failures_are_logged_not_raised() {
        let git = Git::default();
        let dir = tempfile::tempdir().expect("tempdir");
        // Not a git repository: the porcelain status call fails.
        backup_service(&git, dir.path(), false).await;
        let log = std::fs::read_to_string(dir.path().join(BACKUP_LOG)).expect("backup log");
        assert!(log.contains("backup error"));
    }
}
