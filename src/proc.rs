//! Service process ownership.
//!
//! The `ProcessTable` owns the OS process and the log file handle for every
//! live service, keyed by service name. Services are launched as new process
//! groups so the whole subtree (a dev server and the bundler it forks) can be
//! terminated as a unit, and stop is a lookup-and-remove so calling it twice,
//! or concurrently from a user action and a crash-monitor cleanup, is safe.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};

/// File in each working copy receiving the service's stdout and stderr.
pub const LOG_FILE: &str = "stagehand.log";

/// Result of a non-blocking liveness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// The process is still running.
    Running,
    /// The process has exited with this code (None: killed by signal).
    Exited(Option<i32>),
    /// No process is registered under that name.
    Unknown,
}

struct ServiceProcess {
    child: Child,
    // Held so the descriptor lives as long as the process entry; dropped
    // (closed) when the entry is removed, whatever the stop outcome.
    _log: std::fs::File,
}

/// Name-keyed table of live service processes.
pub struct ProcessTable {
    inner: Mutex<HashMap<String, ServiceProcess>>,
    grace: Duration,
}

impl ProcessTable {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            grace,
        }
    }

    /// Launches `start_command` in `dir` as a new process group, with stdout
    /// and stderr appended to the service log. Refuses to launch while a
    /// process is already registered under `name`.
    pub fn start(&self, name: &str, start_command: &str, dir: &Path) -> Result<()> {
        let mut argv = shell_words::split(start_command)
            .with_context(|| format!("failed to parse start command for {}", name))?;
        if argv.is_empty() {
            bail!("empty start command for {}", name);
        }
        let program = argv.remove(0);

        let log_path = dir.join(LOG_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open log file {}", log_path.display()))?;

        let mut command = Command::new(&program);
        command
            .args(&argv)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone().context("clone log handle")?))
            .stderr(Stdio::from(log.try_clone().context("clone log handle")?));

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        // Check-then-insert under one lock so two racing starts can never
        // both attach a process to the same name.
        let mut table = self.inner.lock().expect("process table lock");
        if table.contains_key(name) {
            bail!("{} already has a live process", name);
        }
        let child = command
            .spawn()
            .with_context(|| format!("failed to launch {} ({})", name, program))?;
        table.insert(name.to_string(), ServiceProcess { child, _log: log });
        Ok(())
    }

    /// Stops the named service: graceful signal to the process group, then a
    /// forced kill after the grace period. No-op when no process is
    /// registered, which also makes a second concurrent call harmless.
    pub async fn stop(&self, name: &str) {
        let entry = self.inner.lock().expect("process table lock").remove(name);
        let Some(mut entry) = entry else {
            return;
        };

        if matches!(entry.child.try_wait(), Ok(None)) {
            if let Some(pid) = entry.child.id() {
                signal_group(pid, GroupSignal::Terminate);
            }
            match tokio::time::timeout(self.grace, entry.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    if let Some(pid) = entry.child.id() {
                        signal_group(pid, GroupSignal::Kill);
                    }
                    let _ = entry.child.kill().await;
                }
            }
        }
        // Reap if anything is left; ignore errors, the entry is gone either way.
        let _ = entry.child.try_wait();
    }

    /// Non-blocking liveness check.
    pub fn poll(&self, name: &str) -> PollStatus {
        let mut table = self.inner.lock().expect("process table lock");
        match table.get_mut(name) {
            None => PollStatus::Unknown,
            Some(entry) => match entry.child.try_wait() {
                Ok(None) => PollStatus::Running,
                Ok(Some(status)) => PollStatus::Exited(status.code()),
                Err(_) => PollStatus::Exited(None),
            },
        }
    }

    /// True once a process has been registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("process table lock")
            .contains_key(name)
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) {
    let sig = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    unsafe {
        let pid = pid as i32;
        // Group first so forked children go down with the leader.
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: GroupSignal) {
    // Windows has no SIGTERM; CTRL_BREAK is the closest group-wide signal,
    // and the forced path falls back to Child::kill in stop().
    if matches!(signal, GroupSignal::Terminate) {
        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Console::{
                GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT,
            };
            let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
        }
    }
    let _ = pid;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn table() -> ProcessTable {
        ProcessTable::new(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = table();
        table.start("svc", "sleep 30", dir.path()).expect("start");
        assert_eq!(table.poll("svc"), PollStatus::Running);

        table.stop("svc").await;
        assert_eq!(table.poll("svc"), PollStatus::Unknown);
        // Second stop finds nothing and must not error or hang.
        table.stop("svc").await;
        table.stop("never-started").await;
    }

    #[tokio::test]
    async fn refuses_second_process_for_same_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = table();
        table.start("svc", "sleep 30", dir.path()).expect("start");
        let err = table.start("svc", "sleep 30", dir.path()).unwrap_err();
        assert!(err.to_string().contains("already has a live process"));
        table.stop("svc").await;
    }

    #[tokio::test]
    async fn poll_reports_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = table();
        table
            .start("svc", "sh -c 'exit 3'", dir.path())
            .expect("start");
        let mut status = table.poll("svc");
        for _ in 0..50 {
            if status != PollStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            status = table.poll("svc");
        }
        assert_eq!(status, PollStatus::Exited(Some(3)));
        table.stop("svc").await;
    }

    #[tokio::test]
    async fn service_output_lands_in_log_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = table();
        table
            .start("svc", "sh -c 'echo hello from svc'", dir.path())
            .expect("start");
        for _ in 0..50 {
            if table.poll("svc") != PollStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        table.stop("svc").await;
        let log = std::fs::read_to_string(dir.path().join(LOG_FILE)).expect("log file");
        assert!(log.contains("hello from svc"));
    }

    #[tokio::test]
    async fn launch_failure_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = table();
        assert!(table.start("svc", "", dir.path()).is_err());
        assert!(table
            .start("svc", "/definitely/missing/binary", dir.path())
            .is_err());
        assert_eq!(table.poll("svc"), PollStatus::Unknown);
    }
}
