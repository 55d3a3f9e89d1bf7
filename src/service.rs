//! Data structures for tracking service state.
//!
//! This module defines the specification for a managed service (`ServiceSpec`),
//! its lifecycle state (`ServiceState`), the per-service runtime record
//! (`ServiceRuntime`) owned by the supervisor, and the `Cycle` handle that ties
//! every worker spawned for one start attempt to a shared cancellation token.

use tokio_util::sync::CancellationToken;

/// Identifier for one start attempt. Worker messages carry the cycle id they
/// were spawned under; the supervisor discards messages from a stale cycle.
pub type CycleId = u64;

/// Specification for a managed service, loaded from configuration.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique service name; also the working-copy directory name.
    pub name: String,
    /// Git repository: a full URL or a GitHub `owner/repo` shorthand.
    pub repo: String,
    /// Branch to pin the working copy to.
    pub branch: String,
    /// Shell-tokenized command that starts the service.
    pub start_command: String,
    /// URL to probe for HTTP health, if any.
    pub url: Option<String>,
    /// Whether the backup agent snapshots this service's working tree.
    pub backup: bool,
}

impl ServiceSpec {
    /// Resolves the repository locator to a cloneable URL.
    ///
    /// Full URLs (`https://`, `http://`, `git@`) and filesystem paths pass
    /// through unchanged; anything else is treated as a GitHub
    /// `owner/repo` shorthand.
    pub fn clone_url(&self) -> String {
        let repo = self.repo.trim();
        if repo.starts_with("https://")
            || repo.starts_with("http://")
            || repo.starts_with("git@")
            || repo.starts_with('/')
            || repo.starts_with('.')
        {
            repo.to_string()
        } else {
            format!("https://github.com/{}.git", repo)
        }
    }
}

/// The lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not running and not asked to run.
    Off,
    /// Start requested; syncing, launching, or inside the probation window.
    Starting,
    /// Survived probation and is believed to be running.
    Running,
    /// Failed to start, or died after running.
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ServiceState::Off => "off",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Error => "error",
        };
        f.write_str(text)
    }
}

/// One start attempt: a cycle id plus the cancellation token shared by every
/// worker spawned for that attempt.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub id: CycleId,
    token: CancellationToken,
}

impl Cycle {
    pub fn new(id: CycleId) -> Self {
        Self {
            id,
            token: CancellationToken::new(),
        }
    }

    /// Signals every worker holding this cycle's token to exit at its next
    /// check point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the cycle is cancelled; workers race this against every
    /// blocking wait.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Per-service runtime record. Created when the service is configured,
/// destroyed on removal, and mutated only by the supervisor's consumer loop.
#[derive(Debug)]
pub struct ServiceRuntime {
    pub spec: ServiceSpec,
    pub state: ServiceState,
    /// Last human-readable diagnosis; cleared on entry to Running and Off.
    pub advisory: String,
    /// Live only while a start cycle is in flight (Starting or Running).
    pub cycle: Option<Cycle>,
}

impl ServiceRuntime {
    pub fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            state: ServiceState::Off,
            advisory: String::new(),
            cycle: None,
        }
    }

    /// True when `cycle` does not belong to the runtime's current start
    /// attempt. Messages from stale cycles are discarded by the supervisor.
    pub fn is_stale(&self, cycle: CycleId) -> bool {
        self.cycle.as_ref().map(|c| c.id) != Some(cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(repo: &str) -> ServiceSpec {
        ServiceSpec {
            name: "web".to_string(),
            repo: repo.to_string(),
            branch: "main".to_string(),
            start_command: "npm run dev".to_string(),
            url: None,
            backup: true,
        }
    }

    #[test]
    fn shorthand_expands_to_github_url() {
        assert_eq!(
            spec("acme/web").clone_url(),
            "https://github.com/acme/web.git"
        );
    }

    #[test]
    fn full_urls_and_paths_pass_through() {
        assert_eq!(
            spec("https://example.com/web.git").clone_url(),
            "https://example.com/web.git"
        );
        assert_eq!(
            spec("git@github.com:acme/web.git").clone_url(),
            "git@github.com:acme/web.git"
        );
        assert_eq!(spec("/srv/repos/web.git").clone_url(), "/srv/repos/web.git");
    }

    #[test]
    fn staleness_tracks_current_cycle() {
        let mut runtime = ServiceRuntime::new(spec("acme/web"));
        assert!(runtime.is_stale(1));
        runtime.cycle = Some(Cycle::new(2));
        assert!(runtime.is_stale(1));
        assert!(!runtime.is_stale(2));
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let cycle = Cycle::new(1);
        let shared = cycle.clone();
        assert!(!shared.is_cancelled());
        cycle.cancel();
        assert!(shared.is_cancelled());
    }
}
