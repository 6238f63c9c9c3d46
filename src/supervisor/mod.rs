pub mod control;
mod liveness;

use crate::collectors::{collect_usage, UsageCollector, UsageTask};
use crate::config::{Config, Settings, WorkloadKind, MAX_INTERVAL};
use crate::platform::gpu::GpuCache;
use crate::platform::network::NetworkMonitor;
use crate::platform::{prefer_shipping_pid, Platform, ProcessProbe};
use crate::snapshot::{self, format_countdown, uptime_since, NetworkView, Snapshot};
use crate::state::{Status, StatusRow, WorkloadRuntime};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant, SystemTime};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use control::ControlError;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("check interval must be positive and at most a year, got {0:?}")]
    InvalidCheckInterval(Duration),
    #[error("restart interval must be positive and at most a year, got {0:?}")]
    InvalidRestartInterval(Duration),
}

struct Inner {
    config: Config,
    runtime: HashMap<String, WorkloadRuntime>,
    /// `disabled` as loaded from config; a manual stop restores it.
    default_disabled: HashMap<String, bool>,
    start_times: HashMap<u32, SystemTime>,
}

impl Inner {
    fn new(config: Config) -> Self {
        let default_disabled = config
            .workloads
            .iter()
            .map(|(name, spec)| (name.clone(), spec.disabled))
            .collect();
        Self {
            config,
            runtime: HashMap::new(),
            default_disabled,
            start_times: HashMap::new(),
        }
    }
}

/// Owns the workload roster and every piece of per-workload runtime state.
/// Evaluation rounds and control calls serialize on one lock.
pub struct Supervisor {
    inner: Mutex<Inner>,
    platform: Platform,
    network: Arc<NetworkMonitor>,
    usage: Arc<UsageCollector>,
    version: String,
}

impl Supervisor {
    pub fn new(config: Config, platform: Platform, version: impl Into<String>) -> Self {
        let network = Arc::new(NetworkMonitor::new(platform.network.clone()));
        apply_network_settings(&network, &config.settings);
        let usage = Arc::new(UsageCollector::new(
            platform.probe.clone(),
            platform.counters.clone(),
            network.clone(),
            GpuCache::new(platform.gpu.clone()),
        ));
        Self {
            inner: Mutex::new(Inner::new(config)),
            platform,
            network,
            usage,
            version: version.into(),
        }
    }

    /// Evaluates every workload once. Launches are only attempted when
    /// `force_restart` is set and a workload's restart time has arrived.
    pub async fn evaluate(&self, force_restart: bool, now: SystemTime) -> Vec<StatusRow> {
        let mut inner = self.inner.lock().await;
        self.round(&mut inner, force_restart, now).await
    }

    /// One round at the current wall-clock time, packaged as a snapshot.
    pub async fn tick(&self, force_restart: bool) -> Snapshot {
        let now = SystemTime::now();
        let mut inner = self.inner.lock().await;
        let rows = self.round(&mut inner, force_restart, now).await;
        let settings = &inner.config.settings;
        let network = NetworkView::from_monitor(&self.network, &settings.net_unit, settings.net_debug);
        snapshot::build(&self.version, &rows, now, network)
    }

    /// Drives the fast check ticker and the slow restart ticker until
    /// `shutdown` flips. Publishes one snapshot per round through
    /// `on_update`, starting with an immediate restart-eligible round.
    pub async fn run<F>(&self, mut shutdown: watch::Receiver<bool>, mut on_update: F) -> Result<(), RunError>
    where
        F: FnMut(Snapshot) + Send,
    {
        let mut periods = self.intervals().await;
        validate_intervals(periods)?;

        on_update(self.tick(true).await);

        let (mut check, mut restart) = tickers(periods);
        info!(
            check_every = ?periods.0,
            restart_every = ?periods.1,
            "supervisor loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested, supervisor loop exiting");
                    break;
                }
                _ = check.tick() => on_update(self.tick(false).await),
                _ = restart.tick() => on_update(self.tick(true).await),
            }

            let current = self.intervals().await;
            if current != periods && validate_intervals(current).is_ok() {
                info!(check_every = ?current.0, restart_every = ?current.1, "intervals changed");
                periods = current;
                (check, restart) = tickers(periods);
            }
        }
        Ok(())
    }

    async fn intervals(&self) -> (Duration, Duration) {
        let inner = self.inner.lock().await;
        let settings = &inner.config.settings;
        (settings.check_interval, settings.restart_interval)
    }

    async fn round(&self, inner: &mut Inner, force_restart: bool, now: SystemTime) -> Vec<StatusRow> {
        if inner.config.settings.auto_close_error_dialogs {
            self.close_error_dialogs(&inner.config);
        }
        let workers = inner.config.settings.metrics_workers;
        let (mut rows, tasks) = self.evaluate_rows(inner, force_restart, now);
        debug!(rows = rows.len(), measured = tasks.len(), force_restart, "round evaluated");
        collect_usage(self.usage.clone(), tasks, &mut rows, workers).await;
        self.usage.prune(StdInstant::now());
        rows
    }

    fn evaluate_rows(&self, inner: &mut Inner, force_restart: bool, now: SystemTime) -> (Vec<StatusRow>, Vec<UsageTask>) {
        let probe = self.platform.probe.as_ref();
        let windows = self.platform.windows.as_ref();
        let Inner {
            config,
            runtime,
            start_times,
            ..
        } = inner;
        let restart_interval = config.settings.restart_interval;
        let new_console = config.settings.launch_in_new_console;

        let mut rows = Vec::with_capacity(config.workloads.len());
        let mut tasks = Vec::new();

        for (name, spec) in config.workloads.iter_mut() {
            let state = runtime.entry(name.clone()).or_default();
            let mut row = StatusRow::new(name, spec);
            row.target = spec.target();

            if spec.disabled {
                row.status = Status::Disabled;
                state.restart_at = None;
                state.hung_since = None;
                rows.push(row);
                continue;
            }

            if let WorkloadKind::Unknown(raw) = &spec.kind {
                row.status = Status::Stopped;
                row.error = format!("unknown type: {raw}");
                rows.push(row);
                continue;
            }

            if let Some(err) = spec.path_error() {
                row.error = err;
            }
            let seen = liveness::check(probe, spec);
            if let Some(err) = &seen.probe_error {
                row.error = err.to_string();
            }
            let mut alive = seen.alive;
            if let Some(pid) = seen.pid {
                spec.pid = Some(pid);
            }

            if alive && !state.manual_stop && spec.hang_monitoring_active() {
                row.hung = liveness::any_hung(probe, windows, &seen.names);
                if !row.hung {
                    state.hung_since = None;
                } else {
                    let since = *state.hung_since.get_or_insert(now);
                    if now.duration_since(since).unwrap_or_default() >= spec.hang_timeout {
                        warn!(workload = %name, timeout = ?spec.hang_timeout, "workload not responding, terminating");
                        if let Err(err) = probe.kill_by_names(&seen.names) {
                            warn!(workload = %name, error = %err, "failed to terminate hung workload");
                        }
                        alive = false;
                        row.error = "Not responding".to_string();
                        row.hang_killed = true;
                        state.restart_at = Some(now);
                        state.hung_since = None;
                        spec.pid = None;
                    }
                }
            }

            if alive {
                if state.manual_stop {
                    info!(workload = %name, "stopping manually stopped workload found running");
                    if let Err(err) = control::stop_workload(probe, spec) {
                        warn!(workload = %name, error = %err, "failed to stop workload");
                    }
                    row.status = Status::Stopped;
                    row.uptime = "-".to_string();
                    state.last_status = Some(Status::Stopped);
                    state.restart_at = None;
                    rows.push(row);
                    continue;
                }

                row.status = match state.last_status {
                    Some(Status::Started) => Status::Started,
                    _ => Status::Running,
                };
                state.last_status = Some(Status::Running);
                state.restart_at = None;
                row.pid = spec.pid;
                fill_times(&mut row, start_times, probe, now);

                if let Some(pid) = spec.pid {
                    let executable = spec.kind == WorkloadKind::Executable;
                    let metrics_pid = if executable {
                        prefer_shipping_pid(probe, &seen.names, pid)
                    } else {
                        pid
                    };
                    tasks.push(UsageTask {
                        index: rows.len(),
                        pid: metrics_pid,
                        aggregate_by_names: executable && seen.names.len() > 1,
                        names: seen.names,
                    });
                }
                rows.push(row);
                continue;
            }

            row.status = Status::Stopped;
            state.last_status = Some(Status::Stopped);

            if state.manual_stop {
                row.uptime = "-".to_string();
                state.restart_at = None;
                rows.push(row);
                continue;
            }

            let due = *state
                .restart_at
                .get_or_insert_with(|| now + restart_interval.min(MAX_INTERVAL));
            if force_restart && due <= now {
                match self.platform.runner.launch(spec, new_console) {
                    Ok(pid) => {
                        info!(workload = %name, pid, "workload launched");
                        spec.pid = Some(pid);
                        row.pid = Some(pid);
                        row.status = Status::Started;
                        row.launched = true;
                        state.last_status = Some(Status::Started);
                        state.restart_at = None;
                        start_times.insert(pid, now);
                        fill_times(&mut row, start_times, probe, now);
                    }
                    Err(err) => {
                        warn!(workload = %name, error = %err, "failed to launch workload");
                        row.error = err.to_string();
                        row.launch_failed = true;
                    }
                }
            }
            if row.uptime.is_empty() {
                row.uptime = format_countdown(due, now);
            }
            rows.push(row);
        }

        let tracked: HashSet<u32> = config.workloads.values().filter_map(|s| s.pid).collect();
        start_times.retain(|pid, _| tracked.contains(pid));

        (rows, tasks)
    }

    fn close_error_dialogs(&self, config: &Config) {
        let needles = error_dialog_needles(config);
        if needles.is_empty() {
            return;
        }
        let windows = self.platform.windows.as_ref();
        for window in windows.visible_windows() {
            let title = window.title.to_lowercase();
            if !title.is_empty() && needles.iter().any(|n| title.contains(n.as_str())) {
                info!(title = %window.title, pid = window.owner_pid, "closing error dialog");
                windows.close(window.handle);
            }
        }
    }
}

fn validate_intervals((check, restart): (Duration, Duration)) -> Result<(), RunError> {
    if check.is_zero() || check > MAX_INTERVAL {
        return Err(RunError::InvalidCheckInterval(check));
    }
    if restart.is_zero() || restart > MAX_INTERVAL {
        return Err(RunError::InvalidRestartInterval(restart));
    }
    Ok(())
}

fn tickers((check, restart): (Duration, Duration)) -> (Interval, Interval) {
    let start = Instant::now();
    let mut check = interval_at(start + check, check);
    check.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut restart = interval_at(start + restart, restart);
    restart.set_missed_tick_behavior(MissedTickBehavior::Skip);
    (check, restart)
}

pub(crate) fn apply_network_settings(network: &NetworkMonitor, settings: &Settings) {
    network.set_scale(settings.net_scale);
    // A failed start is already logged and surfaces in the snapshot.
    let _ = network.configure(settings.trace_network);
}

fn fill_times(row: &mut StatusRow, start_times: &mut HashMap<u32, SystemTime>, probe: &dyn ProcessProbe, now: SystemTime) {
    let Some(pid) = row.pid else {
        row.uptime = "-".to_string();
        return;
    };
    let start = match start_times.get(&pid) {
        Some(start) => Some(*start),
        None => {
            let start = probe.start_time(pid);
            if let Some(start) = start {
                start_times.insert(pid, start);
            }
            start
        }
    };
    match start {
        Some(start) => {
            row.started_at = Some(start);
            row.uptime = uptime_since(start, now);
        }
        None => row.uptime = "-".to_string(),
    }
}

/// Lowercased title fragments: the configured ones plus the crash dialog
/// title packaged game servers show, derived from each executable's name.
fn error_dialog_needles(config: &Config) -> Vec<String> {
    let mut needles: Vec<String> = config
        .settings
        .error_window_titles
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for spec in config.workloads.values() {
        if spec.kind != WorkloadKind::Executable {
            continue;
        }
        let stem = process_stem(&spec.process);
        if !stem.is_empty() {
            needles.push(format!("the ue-{} game has crashed and will close", stem.to_lowercase()));
        }
    }
    needles
}

fn process_stem(process: &str) -> &str {
    let name = process.trim();
    if name.len() >= 4 && name[name.len() - 4..].eq_ignore_ascii_case(".exe") {
        &name[..name.len() - 4]
    } else {
        name
    }
}
