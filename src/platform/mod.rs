//! OS-facing capabilities. The supervisor only ever talks to these traits so
//! tests can swap in scripted fakes.

pub mod gpu;
pub mod network;
pub mod runner;
pub mod sysinfo_probe;
pub mod window;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

pub use gpu::{GpuQuery, GpuSample, GpuSource};
pub use network::NetworkCounterSource;
pub use runner::{LaunchError, Runner};
pub use window::{WindowInfo, WindowManager};

#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("process enumeration failed: {0}")]
    Enumerate(String),
    #[error("failed to terminate pid {pid}")]
    Kill { pid: u32 },
}

pub trait ProcessProbe: Send + Sync {
    /// First live process whose name matches.
    fn by_name(&self, name: &str) -> Result<Option<u32>, ProbeError>;

    fn pids_by_name(&self, name: &str) -> Result<Vec<u32>, ProbeError>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Live processes whose argument vector contains `tokens` as a
    /// contiguous run, newest first. An empty `name` matches any executable.
    fn pids_by_cmdline(&self, name: &str, tokens: &[String]) -> Result<Vec<u32>, ProbeError>;

    /// Newest process matching [`ProcessProbe::pids_by_cmdline`].
    fn exact_cmdline_match(&self, name: &str, tokens: &[String]) -> Result<Option<u32>, ProbeError> {
        Ok(self.pids_by_cmdline(name, tokens)?.first().copied())
    }

    fn children(&self, pid: u32) -> Vec<u32>;

    fn parent(&self, pid: u32) -> Option<u32>;

    fn name_of(&self, pid: u32) -> Option<String>;

    fn start_time(&self, pid: u32) -> Option<SystemTime>;

    fn kill(&self, pid: u32) -> Result<(), ProbeError>;

    /// Kills every process matching any of `names`. Keeps going after a
    /// failure and reports the last one.
    fn kill_by_names(&self, names: &[String]) -> Result<(), ProbeError> {
        let mut last_err = None;
        for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            match self.pids_by_name(name) {
                Ok(pids) => {
                    for pid in pids {
                        if let Err(err) = self.kill(pid) {
                            last_err = Some(err);
                        }
                    }
                }
                Err(err) => last_err = Some(err),
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    /// Kills every process matching the command line once. A killed
    /// process may linger in the table for a moment, so the match list is
    /// taken up front rather than re-queried.
    fn kill_by_cmdline(&self, name: &str, tokens: &[String]) -> Result<(), ProbeError> {
        let mut last_err = None;
        for pid in self.pids_by_cmdline(name, tokens)? {
            if let Err(err) = self.kill(pid) {
                last_err = Some(err);
            }
        }
        last_err.map_or(Ok(()), Err)
    }
}

/// Cumulative per-process counters. `None` means the platform cannot tell.
pub trait CounterSource: Send + Sync {
    fn cpu_time(&self, pid: u32) -> Option<Duration>;

    fn memory_bytes(&self, pid: u32) -> Option<u64>;

    /// Read plus written bytes since the process started.
    fn io_bytes(&self, pid: u32) -> Option<u64>;

    fn logical_cores(&self) -> usize;
}

/// Everything the supervisor needs from the host.
#[derive(Clone)]
pub struct Platform {
    pub probe: Arc<dyn ProcessProbe>,
    pub counters: Arc<dyn CounterSource>,
    pub gpu: Arc<dyn GpuSource>,
    pub network: Arc<dyn NetworkCounterSource>,
    pub windows: Arc<dyn WindowManager>,
    pub runner: Arc<dyn Runner>,
}

impl Platform {
    pub fn host() -> Self {
        let system = Arc::new(sysinfo_probe::SysinfoProbe::new());
        Self {
            probe: system.clone(),
            counters: system,
            gpu: Arc::new(gpu::NvidiaSmi::default()),
            network: Arc::new(network::UnsupportedNetwork),
            windows: Arc::new(window::HeadlessWindows),
            runner: Arc::new(runner::CommandRunner),
        }
    }
}

/// Picks a process named like `*-Shipping*` among `names`; packaged game
/// servers often run the real work in such a child of a thin launcher.
pub fn prefer_shipping_pid(probe: &dyn ProcessProbe, names: &[String], fallback: u32) -> u32 {
    names
        .iter()
        .filter(|name| name.to_ascii_lowercase().contains("-shipping"))
        .find_map(|name| probe.by_name(name).ok().flatten())
        .unwrap_or(fallback)
}

/// Groups live pids by process name, used by name-based lookups over
/// counter snapshots.
pub fn names_by_pid(probe: &dyn ProcessProbe, pids: impl IntoIterator<Item = u32>) -> HashMap<u32, String> {
    pids.into_iter()
        .filter_map(|pid| probe.name_of(pid).map(|name| (pid, name)))
        .collect()
}

pub fn same_process_name(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}
