use super::{apply_network_settings, liveness, Inner, Supervisor};
use crate::config::{Config, WorkloadKind, WorkloadSpec};
use crate::platform::{LaunchError, ProbeError, ProcessProbe};
use crate::state::Status;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("workload {0:?} not found")]
    NotFound(String),
    #[error("workload {0:?} is already running")]
    AlreadyRunning(String),
    #[error("workload {0:?} has empty path")]
    EmptyPath(String),
    #[error("unknown type {0:?}")]
    UnknownKind(String),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl Supervisor {
    /// Launches a stopped workload and puts it back under regular
    /// monitoring. A workload found alive is resynced and reported as
    /// already running.
    pub async fn start(&self, name: &str) -> Result<(), ControlError> {
        let mut guard = self.inner.lock().await;
        let Inner {
            config,
            runtime,
            start_times,
            ..
        } = &mut *guard;
        let new_console = config.settings.launch_in_new_console;
        let spec = workload(&mut config.workloads, name)?;
        if let WorkloadKind::Unknown(kind) = &spec.kind {
            return Err(ControlError::UnknownKind(kind.clone()));
        }

        let seen = liveness::check_any(self.platform.probe.as_ref(), spec);
        if !seen.alive {
            if let Some(err) = seen.probe_error {
                return Err(err.into());
            }
        }
        let state = runtime.entry(name.to_string()).or_default();
        spec.disabled = false;
        state.manual_stop = false;
        state.restart_at = None;
        state.hung_since = None;

        if seen.alive {
            if let Some(pid) = seen.pid {
                spec.pid = Some(pid);
            }
            state.last_status = Some(Status::Running);
            return Err(ControlError::AlreadyRunning(name.to_string()));
        }

        let pid = self.platform.runner.launch(spec, new_console)?;
        info!(workload = %name, pid, "workload started manually");
        spec.pid = Some(pid);
        state.last_status = Some(Status::Started);
        start_times.insert(pid, SystemTime::now());
        Ok(())
    }

    /// Stops a workload and keeps it stopped until started again. A
    /// workload that is disabled in the config file goes back to disabled.
    pub async fn stop(&self, name: &str) -> Result<(), ControlError> {
        let mut guard = self.inner.lock().await;
        let Inner {
            config,
            runtime,
            default_disabled,
            ..
        } = &mut *guard;
        let spec = workload(&mut config.workloads, name)?;
        if default_disabled.get(name).copied().unwrap_or(false) {
            spec.disabled = true;
        }
        let state = runtime.entry(name.to_string()).or_default();
        state.manual_stop = true;
        state.restart_at = None;
        state.hung_since = None;

        info!(workload = %name, "stopping workload manually");
        stop_workload(self.platform.probe.as_ref(), spec)
    }

    /// Stops then launches a workload, enabling it if needed. A failed
    /// relaunch leaves it stopped with the regular restart policy in charge.
    pub async fn restart(&self, name: &str) -> Result<(), ControlError> {
        let mut guard = self.inner.lock().await;
        let Inner {
            config,
            runtime,
            start_times,
            ..
        } = &mut *guard;
        let new_console = config.settings.launch_in_new_console;
        let spec = workload(&mut config.workloads, name)?;
        let state = runtime.entry(name.to_string()).or_default();
        state.manual_stop = false;
        state.restart_at = None;
        state.hung_since = None;
        spec.disabled = false;

        stop_workload(self.platform.probe.as_ref(), spec)?;
        match self.platform.runner.launch(spec, new_console) {
            Ok(pid) => {
                info!(workload = %name, pid, "workload restarted manually");
                spec.pid = Some(pid);
                state.last_status = Some(Status::Started);
                start_times.insert(pid, SystemTime::now());
                Ok(())
            }
            Err(err) => {
                state.last_status = Some(Status::Stopped);
                Err(err.into())
            }
        }
    }

    /// Stops every enabled workload, then launches each of them. Clears
    /// all manual stops. Keeps going past failures and returns the last one.
    pub async fn restart_all(&self) -> Result<(), ControlError> {
        let mut guard = self.inner.lock().await;
        let Inner {
            config,
            runtime,
            start_times,
            ..
        } = &mut *guard;
        let probe = self.platform.probe.as_ref();
        let new_console = config.settings.launch_in_new_console;
        for state in runtime.values_mut() {
            state.manual_stop = false;
        }

        let mut last_err = None;
        for (name, spec) in config.workloads.iter_mut().filter(|(_, s)| !s.disabled) {
            if let Err(err) = stop_workload(probe, spec) {
                warn!(workload = %name, error = %err, "failed to stop workload");
                last_err = Some(err);
            }
        }
        for (name, spec) in config.workloads.iter_mut().filter(|(_, s)| !s.disabled) {
            match self.platform.runner.launch(spec, new_console) {
                Ok(pid) => {
                    spec.pid = Some(pid);
                    let state = runtime.entry(name.clone()).or_default();
                    state.last_status = Some(Status::Started);
                    state.restart_at = None;
                    state.hung_since = None;
                    start_times.insert(pid, SystemTime::now());
                }
                Err(err) => {
                    warn!(workload = %name, error = %err, "failed to launch workload");
                    last_err = Some(err.into());
                }
            }
        }
        info!(workloads = config.workloads.len(), "restart-all finished");
        last_err.map_or(Ok(()), Err)
    }

    /// Terminates every configured workload, disabled ones included.
    pub async fn stop_all(&self) -> Result<(), ControlError> {
        let mut guard = self.inner.lock().await;
        let probe = self.platform.probe.as_ref();
        let mut last_err = None;
        for (name, spec) in guard.config.workloads.iter_mut() {
            if let Err(err) = stop_workload(probe, spec) {
                warn!(workload = %name, error = %err, "failed to stop workload");
                last_err = Some(err);
            }
        }
        info!("all workloads stopped");
        last_err.map_or(Ok(()), Err)
    }

    pub async fn configured_path(&self, name: &str) -> Result<String, ControlError> {
        let guard = self.inner.lock().await;
        let spec = guard
            .config
            .workloads
            .get(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        let path = spec.path.trim();
        if path.is_empty() {
            return Err(ControlError::EmptyPath(name.to_string()));
        }
        Ok(path.to_string())
    }

    /// Swaps in a new configuration. All runtime state belongs to the old
    /// roster and is dropped with it.
    pub async fn update_config(&self, config: Config) {
        let mut guard = self.inner.lock().await;
        apply_network_settings(&self.network, &config.settings);
        info!(workloads = config.workloads.len(), "configuration replaced");
        *guard = Inner::new(config);
    }
}

fn workload<'a>(
    workloads: &'a mut std::collections::BTreeMap<String, WorkloadSpec>,
    name: &str,
) -> Result<&'a mut WorkloadSpec, ControlError> {
    workloads
        .get_mut(name)
        .ok_or_else(|| ControlError::NotFound(name.to_string()))
}

/// Terminates whatever the workload's matching rules point at and forgets
/// its tracked pid.
pub(crate) fn stop_workload(probe: &dyn ProcessProbe, spec: &mut WorkloadSpec) -> Result<(), ControlError> {
    match &spec.kind {
        WorkloadKind::Executable => {
            let mut last_err = None;
            if let Some(pid) = spec.pid {
                if let Err(err) = probe.kill(pid) {
                    last_err = Some(err);
                }
            }
            if let Err(err) = probe.kill_by_names(&spec.candidate_names()) {
                last_err = Some(err);
            }
            spec.pid = None;
            last_err.map_or(Ok(()), |err| Err(err.into()))
        }
        WorkloadKind::ShellCommand | WorkloadKind::ScriptFile => {
            let tokens = spec.cmdline_tokens();
            if !tokens.is_empty() {
                let name = spec.check_process.first().map(String::as_str).unwrap_or("");
                probe.kill_by_cmdline(name, &tokens)?;
            } else if !spec.check_process.is_empty() {
                probe.kill_by_names(&spec.check_process)?;
            } else if let Some(pid) = spec.pid {
                probe.kill(pid)?;
            }
            spec.pid = None;
            Ok(())
        }
        WorkloadKind::Unknown(kind) => Err(ControlError::UnknownKind(kind.clone())),
    }
}
