//! Service lifecycle supervision.
//!
//! One `ServiceRuntime` per configured service, mutated only here: the
//! supervisor drains a single ordered event channel and is the sole writer of
//! service state, so a crash-monitor event and a user-initiated stop can never
//! race on shared state. Each start request opens a new cycle; the start
//! worker, crash monitor, and health loop spawned for that cycle share one
//! cancellation token and tag every message with the cycle id, and the
//! supervisor discards messages from any cycle that is no longer current.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::advisory;
use crate::events::{Event, HealthSignal, Notification};
use crate::git::Git;
use crate::health;
use crate::logtail;
use crate::proc::{PollStatus, ProcessTable, LOG_FILE};
use crate::service::{Cycle, ServiceRuntime, ServiceSpec, ServiceState};
use crate::sync;

const EARLY_EXIT_ADVISORY: &str = "Service stopped immediately after starting.";
const SERVER_ERROR_ADVISORY: &str =
    "The service is responding with errors. Check the log for details.";

/// Intervals and budgets for supervision. Defaults match production
/// behavior; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Window after launch during which an exit is a startup failure.
    pub probation: Duration,
    /// Liveness poll interval inside the probation window.
    pub probation_poll: Duration,
    /// Crash-monitor poll interval once the service is attached.
    pub monitor_poll: Duration,
    /// Poll interval while the crash monitor waits for the process to appear.
    pub monitor_attach_poll: Duration,
    /// Interval between health probes.
    pub health_interval: Duration,
    /// Budget for a single health probe request.
    pub health_timeout: Duration,
    /// Grace period between the graceful and forced stop signals.
    pub stop_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            probation: Duration::from_millis(1500),
            probation_poll: Duration::from_millis(100),
            monitor_poll: Duration::from_secs(2),
            monitor_attach_poll: Duration::from_millis(200),
            health_interval: Duration::from_secs(5),
            health_timeout: Duration::from_secs(4),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// The single consumer of the event channel and sole owner of service state.
pub struct Supervisor {
    services: HashMap<String, ServiceRuntime>,
    table: Arc<ProcessTable>,
    git: Git,
    services_dir: PathBuf,
    timing: Timing,
    event_tx: mpsc::Sender<Event>,
    notify_tx: mpsc::Sender<Notification>,
    backup_tx: watch::Sender<Vec<ServiceSpec>>,
    next_cycle: u64,
}

impl Supervisor {
    pub fn new(
        specs: Vec<ServiceSpec>,
        services_dir: PathBuf,
        timing: Timing,
        event_tx: mpsc::Sender<Event>,
        notify_tx: mpsc::Sender<Notification>,
    ) -> Self {
        let services = specs
            .iter()
            .map(|spec| (spec.name.clone(), ServiceRuntime::new(spec.clone())))
            .collect();
        let (backup_tx, _) = watch::channel(specs);
        Self {
            services,
            table: Arc::new(ProcessTable::new(timing.stop_grace)),
            git: Git::default(),
            services_dir,
            timing,
            event_tx,
            notify_tx,
            backup_tx,
            next_cycle: 0,
        }
    }

    /// Current service list for the backup agent; updated on removal.
    pub fn backup_feed(&self) -> watch::Receiver<Vec<ServiceSpec>> {
        self.backup_tx.subscribe()
    }

    /// Drains the event channel until `Shutdown` arrives or every sender is
    /// gone. At most one state transition per message, in arrival order.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            let shutdown = matches!(event, Event::Shutdown);
            self.handle(event).await;
            if shutdown {
                break;
            }
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::StartRequested { name } => self.on_start_requested(&name).await,
            Event::StopRequested { name } => self.on_stop_requested(&name).await,
            Event::RemoveRequested { name } => self.on_remove_requested(&name).await,
            Event::Survived { name, cycle } => self.on_survived(&name, cycle).await,
            Event::StartFailed {
                name,
                cycle,
                advisory,
            } => self.on_start_failed(&name, cycle, advisory).await,
            Event::Exited {
                name,
                cycle,
                log_tail,
            } => self.on_exited(&name, cycle, log_tail).await,
            Event::Health {
                name,
                cycle,
                signal,
            } => self.on_health(&name, cycle, signal).await,
            Event::Shutdown => self.on_shutdown().await,
        }
    }

    async fn on_start_requested(&mut self, name: &str) {
        let Some(runtime) = self.services.get_mut(name) else {
            warn!(service = name, "start requested for unknown service");
            return;
        };
        if !matches!(runtime.state, ServiceState::Off | ServiceState::Error) {
            debug!(service = name, state = %runtime.state, "start request ignored");
            return;
        }
        self.next_cycle += 1;
        let cycle = Cycle::new(self.next_cycle);
        runtime.state = ServiceState::Starting;
        runtime.advisory.clear();
        runtime.cycle = Some(cycle.clone());
        let spec = runtime.spec.clone();
        info!(service = name, cycle = cycle.id, "starting");
        self.notify_state(name).await;

        spawn_start_worker(
            spec.clone(),
            self.services_dir.clone(),
            Arc::clone(&self.table),
            self.git.clone(),
            cycle.clone(),
            self.event_tx.clone(),
            self.timing,
        );
        spawn_crash_monitor(
            spec.name,
            self.services_dir.clone(),
            Arc::clone(&self.table),
            cycle,
            self.event_tx.clone(),
            self.timing,
        );
    }

    async fn on_stop_requested(&mut self, name: &str) {
        let Some(runtime) = self.services.get_mut(name) else {
            return;
        };
        match runtime.state {
            ServiceState::Starting | ServiceState::Running => {
                if let Some(cycle) = runtime.cycle.take() {
                    cycle.cancel();
                }
                runtime.state = ServiceState::Off;
                runtime.advisory.clear();
                info!(service = name, "stopping");
                self.spawn_stop(name);
                self.notify_state(name).await;
            }
            ServiceState::Error => {
                // No transition, but make sure nothing is left behind.
                if let Some(cycle) = runtime.cycle.take() {
                    cycle.cancel();
                }
                self.spawn_stop(name);
            }
            ServiceState::Off => {}
        }
    }

    async fn on_remove_requested(&mut self, name: &str) {
        let Some(mut runtime) = self.services.remove(name) else {
            return;
        };
        if let Some(cycle) = runtime.cycle.take() {
            cycle.cancel();
        }
        info!(service = name, "removing service");
        self.spawn_stop(name);
        self.publish_backup_list();
        let _ = self
            .notify_tx
            .send(Notification::Removed {
                name: name.to_string(),
            })
            .await;
    }

    async fn on_survived(&mut self, name: &str, cycle: u64) {
        let Some(runtime) = self.services.get_mut(name) else {
            return;
        };
        if runtime.is_stale(cycle) {
            debug!(service = name, cycle, "discarding stale survival message");
            return;
        }
        if runtime.state != ServiceState::Starting {
            return;
        }
        runtime.state = ServiceState::Running;
        runtime.advisory.clear();
        info!(service = name, "running");
        let spec = runtime.spec.clone();
        let cycle_handle = runtime.cycle.clone();
        self.notify_state(name).await;

        if let (Some(url), Some(cycle_handle)) = (spec.url, cycle_handle) {
            health::spawn_health_loop(
                spec.name,
                url,
                cycle_handle,
                self.event_tx.clone(),
                self.timing.health_interval,
                self.timing.health_timeout,
            );
        }
    }

    async fn on_start_failed(&mut self, name: &str, cycle: u64, advisory: String) {
        let Some(runtime) = self.services.get_mut(name) else {
            return;
        };
        if runtime.is_stale(cycle) {
            debug!(service = name, cycle, "discarding stale start failure");
            return;
        }
        if runtime.state != ServiceState::Starting {
            return;
        }
        if let Some(cycle) = runtime.cycle.take() {
            cycle.cancel();
        }
        runtime.state = ServiceState::Error;
        runtime.advisory = advisory;
        warn!(service = name, advisory = %runtime.advisory, "start failed");
        self.spawn_stop(name);
        self.notify_state(name).await;
    }

    async fn on_exited(&mut self, name: &str, cycle: u64, log_tail: String) {
        let Some(runtime) = self.services.get_mut(name) else {
            return;
        };
        if runtime.is_stale(cycle) {
            debug!(service = name, cycle, "discarding stale exit message");
            return;
        }
        if runtime.state != ServiceState::Running {
            return;
        }
        if let Some(cycle) = runtime.cycle.take() {
            cycle.cancel();
        }
        let diagnosed = advisory::diagnose(&log_tail);
        runtime.state = ServiceState::Error;
        runtime.advisory = if diagnosed.is_empty() {
            log_tail
        } else {
            diagnosed.to_string()
        };
        warn!(service = name, "service exited unexpectedly");
        self.spawn_stop(name);
        self.notify_state(name).await;
    }

    async fn on_health(&mut self, name: &str, cycle: u64, signal: HealthSignal) {
        let Some(runtime) = self.services.get_mut(name) else {
            return;
        };
        if runtime.is_stale(cycle) || runtime.state != ServiceState::Running {
            return;
        }
        let log_path = self.services_dir.join(name).join(LOG_FILE);
        let overlay = match signal {
            HealthSignal::Healthy => {
                let tail = logtail::read_log_tail(&log_path, name, logtail::TAIL_LINES);
                if advisory::port_conflict(&tail) {
                    // The URL answered, but this process never bound the
                    // port; whatever did answer is a different program.
                    if let Some(cycle) = runtime.cycle.take() {
                        cycle.cancel();
                    }
                    runtime.state = ServiceState::Error;
                    runtime.advisory = advisory::diagnose(&tail).to_string();
                    warn!(service = name, "port conflict behind a healthy probe");
                    self.spawn_stop(name);
                    self.notify_state(name).await;
                    return;
                }
                String::new()
            }
            HealthSignal::NotListening => {
                let tail = logtail::read_log_tail(&log_path, name, logtail::TAIL_LINES);
                runtime
                    .spec
                    .url
                    .as_deref()
                    .and_then(|url| advisory::port_mismatch(url, &tail))
                    .unwrap_or_default()
            }
            HealthSignal::ServerError { .. } => {
                let tail = logtail::read_log_tail(&log_path, name, logtail::TAIL_LINES);
                let diagnosed = advisory::diagnose(&tail);
                if diagnosed.is_empty() {
                    SERVER_ERROR_ADVISORY.to_string()
                } else {
                    diagnosed.to_string()
                }
            }
        };
        let _ = self
            .notify_tx
            .send(Notification::Health {
                name: name.to_string(),
                signal,
                advisory: overlay,
            })
            .await;
    }

    async fn on_shutdown(&mut self) {
        info!("stopping all services");
        let mut stops = Vec::new();
        for (name, runtime) in self.services.iter_mut() {
            if let Some(cycle) = runtime.cycle.take() {
                cycle.cancel();
            }
            runtime.state = ServiceState::Off;
            runtime.advisory.clear();
            let table = Arc::clone(&self.table);
            let name = name.clone();
            stops.push(tokio::spawn(async move { table.stop(&name).await }));
        }
        for stop in stops {
            let _ = stop.await;
        }
    }

    fn spawn_stop(&self, name: &str) -> JoinHandle<()> {
        // Decoupled from the consumer so a slow graceful exit never stalls
        // event processing; the table's lookup-and-remove makes overlapping
        // stops for the same service a no-op.
        let table = Arc::clone(&self.table);
        let name = name.to_string();
        tokio::spawn(async move { table.stop(&name).await })
    }

    fn publish_backup_list(&self) {
        let specs: Vec<ServiceSpec> = self
            .services
            .values()
            .map(|runtime| runtime.spec.clone())
            .collect();
        self.backup_tx.send_replace(specs);
    }

    async fn notify_state(&self, name: &str) {
        let Some(runtime) = self.services.get(name) else {
            return;
        };
        let _ = self
            .notify_tx
            .send(Notification::State {
                name: name.to_string(),
                state: runtime.state,
                advisory: runtime.advisory.clone(),
            })
            .await;
    }

    #[cfg(test)]
    fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.services.get(name).map(|runtime| runtime.state)
    }

    #[cfg(test)]
    fn advisory_of(&self, name: &str) -> Option<String> {
        self.services
            .get(name)
            .map(|runtime| runtime.advisory.clone())
    }

    #[cfg(test)]
    fn current_cycle(&self, name: &str) -> Option<u64> {
        self.services
            .get(name)
            .and_then(|runtime| runtime.cycle.as_ref().map(|cycle| cycle.id))
    }
}

/// Start worker: sync the repository, install dependencies, launch the
/// process, then hold it in probation. An exit inside the window is a
/// configuration error, not a crash; the worker reports it directly and the
/// service never reaches RUNNING.
fn spawn_start_worker(
    spec: ServiceSpec,
    services_dir: PathBuf,
    table: Arc<ProcessTable>,
    git: Git,
    cycle: Cycle,
    tx: mpsc::Sender<Event>,
    timing: Timing,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let launched = tokio::select! {
            _ = cycle.cancelled() => {
                // A stop can land while the sync is in flight; make sure a
                // process launched just before the cancel is torn down.
                table.stop(&spec.name).await;
                return;
            }
            result = prepare_and_launch(&git, &spec, &services_dir, &table) => result,
        };
        if cycle.is_cancelled() {
            table.stop(&spec.name).await;
            return;
        }
        if let Err(err) = launched {
            let event = Event::StartFailed {
                name: spec.name.clone(),
                cycle: cycle.id,
                advisory: format!("{:#}", err),
            };
            let _ = tx.send(event).await;
            return;
        }

        let dir = services_dir.join(&spec.name);
        let deadline = tokio::time::Instant::now() + timing.probation;
        while tokio::time::Instant::now() < deadline {
            tokio::select! {
                _ = cycle.cancelled() => return,
                _ = tokio::time::sleep(timing.probation_poll) => {}
            }
            if let PollStatus::Exited(_) = table.poll(&spec.name) {
                let log_text = logtail::read_log(&dir.join(LOG_FILE));
                let diagnosed = advisory::diagnose(&log_text);
                let advisory = if diagnosed.is_empty() {
                    EARLY_EXIT_ADVISORY.to_string()
                } else {
                    diagnosed.to_string()
                };
                let event = Event::StartFailed {
                    name: spec.name.clone(),
                    cycle: cycle.id,
                    advisory,
                };
                let _ = tx.send(event).await;
                return;
            }
        }
        let event = Event::Survived {
            name: spec.name.clone(),
            cycle: cycle.id,
        };
        let _ = tx.send(event).await;
    })
}

async fn prepare_and_launch(
    git: &Git,
    spec: &ServiceSpec,
    services_dir: &std::path::Path,
    table: &ProcessTable,
) -> anyhow::Result<()> {
    let dir = sync::ensure_repo(git, spec, services_dir).await?;
    sync::install_dependencies(&dir).await?;
    table.start(&spec.name, &spec.start_command, &dir)?;
    Ok(())
}

/// Crash monitor: waits for the process to appear, then polls liveness until
/// the cycle is cancelled or the process exits unexpectedly. Exits silently
/// on cancellation; the supervisor discards anything that races past it.
fn spawn_crash_monitor(
    name: String,
    services_dir: PathBuf,
    table: Arc<ProcessTable>,
    cycle: Cycle,
    tx: mpsc::Sender<Event>,
    timing: Timing,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !table.contains(&name) {
            tokio::select! {
                _ = cycle.cancelled() => return,
                _ = tokio::time::sleep(timing.monitor_attach_poll) => {}
            }
        }
        loop {
            tokio::select! {
                _ = cycle.cancelled() => return,
                _ = tokio::time::sleep(timing.monitor_poll) => {}
            }
            match table.poll(&name) {
                PollStatus::Running => {}
                PollStatus::Unknown => return,
                PollStatus::Exited(_) => {
                    if cycle.is_cancelled() {
                        return;
                    }
                    let log_path = services_dir.join(&name).join(LOG_FILE);
                    let log_tail = logtail::read_log_tail(&log_path, &name, logtail::TAIL_LINES);
                    let event = Event::Exited {
                        name: name.clone(),
                        cycle: cycle.id,
                        log_tail,
                    };
                    let _ = tx.send(event).await;
                    return;
                }
            }
        }
    })
}
