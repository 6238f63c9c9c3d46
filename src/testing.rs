//! In-memory stand-ins for every platform contract.

use crate::config::{split_command_line, WorkloadKind, WorkloadSpec};
use crate::platform::sysinfo_probe::argv_contains;
use crate::platform::{
    same_process_name, CounterSource, GpuQuery, GpuSample, GpuSource, LaunchError, NetworkCounterSource,
    Platform, ProbeError, ProcessProbe, Runner, WindowInfo, WindowManager,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub name: String,
    pub cmd: Vec<String>,
    pub parent: Option<u32>,
    pub hidden_from_names: bool,
}

#[derive(Default)]
struct ProcessTable {
    last_pid: u32,
    processes: BTreeMap<u32, FakeProcess>,
    killed: Vec<u32>,
    /// Killed processes stay listed, like a SIGKILL not yet reaped.
    linger: bool,
}

/// Process table where pids grow monotonically and a higher pid always
/// means a later start.
#[derive(Default)]
pub struct FakeProbe {
    table: Mutex<ProcessTable>,
}

impl FakeProbe {
    pub fn spawn(&self, name: &str, cmd: &[String]) -> u32 {
        self.insert(name, cmd.to_vec(), None)
    }

    pub fn spawn_child(&self, parent: u32, name: &str) -> u32 {
        self.insert(name, Vec::new(), Some(parent))
    }

    fn insert(&self, name: &str, cmd: Vec<String>, parent: Option<u32>) -> u32 {
        let mut table = lock(&self.table);
        table.last_pid = table.last_pid.max(99) + 1;
        let pid = table.last_pid;
        table.processes.insert(
            pid,
            FakeProcess {
                name: name.to_string(),
                cmd,
                parent,
                hidden_from_names: false,
            },
        );
        pid
    }

    pub fn exit(&self, pid: u32) {
        lock(&self.table).processes.remove(&pid);
    }

    pub fn reparent(&self, pid: u32, parent: u32) {
        if let Some(p) = lock(&self.table).processes.get_mut(&pid) {
            p.parent = Some(parent);
        }
    }

    pub fn hide_from_name_lookup(&self, pid: u32) {
        if let Some(p) = lock(&self.table).processes.get_mut(&pid) {
            p.hidden_from_names = true;
        }
    }

    pub fn linger_after_kill(&self, linger: bool) {
        lock(&self.table).linger = linger;
    }

    pub fn killed(&self) -> Vec<u32> {
        lock(&self.table).killed.clone()
    }

    pub fn running(&self, name: &str) -> Vec<u32> {
        self.pids_by_name(name).unwrap_or_default()
    }
}

impl ProcessProbe for FakeProbe {
    fn by_name(&self, name: &str) -> Result<Option<u32>, ProbeError> {
        Ok(self.pids_by_name(name)?.first().copied())
    }

    fn pids_by_name(&self, name: &str) -> Result<Vec<u32>, ProbeError> {
        let table = lock(&self.table);
        Ok(table
            .processes
            .iter()
            .filter(|(_, p)| !p.hidden_from_names && same_process_name(&p.name, name.trim()))
            .map(|(pid, _)| *pid)
            .collect())
    }

    fn is_alive(&self, pid: u32) -> bool {
        lock(&self.table).processes.contains_key(&pid)
    }

    fn pids_by_cmdline(&self, name: &str, tokens: &[String]) -> Result<Vec<u32>, ProbeError> {
        let table = lock(&self.table);
        Ok(table
            .processes
            .iter()
            .rev()
            .filter(|(_, p)| {
                (name.is_empty() || same_process_name(&p.name, name)) && argv_contains(&p.cmd, tokens)
            })
            .map(|(pid, _)| *pid)
            .collect())
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        let table = lock(&self.table);
        table
            .processes
            .iter()
            .filter(|(_, p)| p.parent == Some(pid))
            .map(|(child, _)| *child)
            .collect()
    }

    fn parent(&self, pid: u32) -> Option<u32> {
        lock(&self.table).processes.get(&pid).and_then(|p| p.parent)
    }

    fn name_of(&self, pid: u32) -> Option<String> {
        lock(&self.table).processes.get(&pid).map(|p| p.name.clone())
    }

    fn start_time(&self, pid: u32) -> Option<SystemTime> {
        self.is_alive(pid)
            .then(|| UNIX_EPOCH + Duration::from_secs(u64::from(pid)))
    }

    fn kill(&self, pid: u32) -> Result<(), ProbeError> {
        let mut table = lock(&self.table);
        let present = if table.linger {
            table.processes.contains_key(&pid)
        } else {
            table.processes.remove(&pid).is_some()
        };
        if present {
            table.killed.push(pid);
        }
        Ok(())
    }
}

/// Launches fake processes into a [`FakeProbe`].
pub struct FakeRunner {
    probe: Arc<FakeProbe>,
    failure: Mutex<Option<String>>,
    launches: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new(probe: Arc<FakeProbe>) -> Self {
        Self {
            probe,
            failure: Mutex::new(None),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_with(&self, message: Option<&str>) {
        *lock(&self.failure) = message.map(str::to_string);
    }

    /// Targets of every successful launch, in order.
    pub fn launches(&self) -> Vec<String> {
        lock(&self.launches).clone()
    }
}

impl Runner for FakeRunner {
    fn launch(&self, spec: &WorkloadSpec, _new_console: bool) -> Result<u32, LaunchError> {
        if let Some(message) = lock(&self.failure).clone() {
            return Err(LaunchError::Spawn {
                program: spec.target(),
                source: io::Error::new(io::ErrorKind::Other, message),
            });
        }
        let pid = match &spec.kind {
            WorkloadKind::Executable => {
                let name = spec.candidate_names().into_iter().next().unwrap_or_default();
                self.probe.spawn(&name, &[])
            }
            WorkloadKind::ShellCommand => {
                let mut argv = vec!["sh".to_string(), "-c".to_string()];
                argv.extend(split_command_line(&spec.command));
                self.probe.spawn("sh", &argv)
            }
            WorkloadKind::ScriptFile => {
                let argv = vec!["sh".to_string(), spec.process.clone()];
                self.probe.spawn("sh", &argv)
            }
            WorkloadKind::Unknown(raw) => return Err(LaunchError::UnknownKind(raw.clone())),
        };
        lock(&self.launches).push(spec.target());
        Ok(pid)
    }
}

#[derive(Default)]
pub struct FakeWindows {
    hung: Mutex<HashSet<u32>>,
    windows: Mutex<Vec<WindowInfo>>,
    closed: Mutex<Vec<u64>>,
}

impl FakeWindows {
    pub fn set_hung(&self, pid: u32, hung: bool) {
        let mut set = lock(&self.hung);
        if hung {
            set.insert(pid);
        } else {
            set.remove(&pid);
        }
    }

    pub fn open(&self, handle: u64, owner_pid: u32, title: &str) {
        lock(&self.windows).push(WindowInfo {
            handle,
            owner_pid,
            title: title.to_string(),
        });
    }

    pub fn closed(&self) -> Vec<u64> {
        lock(&self.closed).clone()
    }
}

impl WindowManager for FakeWindows {
    fn visible_windows(&self) -> Vec<WindowInfo> {
        lock(&self.windows).clone()
    }

    fn is_hung(&self, pid: u32) -> bool {
        lock(&self.hung).contains(&pid)
    }

    fn close(&self, handle: u64) {
        lock(&self.windows).retain(|w| w.handle != handle);
        lock(&self.closed).push(handle);
    }
}

/// Scripted counters. `memory_bytes` also tracks how many calls overlap.
#[derive(Default)]
pub struct FakeCounters {
    cpu: Mutex<HashMap<u32, Duration>>,
    memory: Mutex<HashMap<u32, u64>>,
    io: Mutex<HashMap<u32, u64>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeCounters {
    pub fn set_cpu(&self, pid: u32, cpu: Duration) {
        lock(&self.cpu).insert(pid, cpu);
    }

    pub fn set_memory(&self, pid: u32, bytes: u64) {
        lock(&self.memory).insert(pid, bytes);
    }

    pub fn set_io(&self, pid: u32, bytes: u64) {
        lock(&self.io).insert(pid, bytes);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl CounterSource for FakeCounters {
    fn cpu_time(&self, pid: u32) -> Option<Duration> {
        lock(&self.cpu).get(&pid).copied()
    }

    fn memory_bytes(&self, pid: u32) -> Option<u64> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let value = lock(&self.memory).get(&pid).copied();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        value
    }

    fn io_bytes(&self, pid: u32) -> Option<u64> {
        lock(&self.io).get(&pid).copied()
    }

    fn logical_cores(&self) -> usize {
        4
    }
}

#[derive(Default)]
pub struct FakeGpu {
    stats: Mutex<HashMap<u32, GpuSample>>,
}

impl FakeGpu {
    pub fn set(&self, pid: u32, util_percent: f64, memory_mb: u64) {
        lock(&self.stats).insert(
            pid,
            GpuSample {
                util_percent,
                memory_mb,
            },
        );
    }
}

impl GpuSource for FakeGpu {
    fn query(&self) -> GpuQuery<'_> {
        Box::pin(std::future::ready(lock(&self.stats).clone()))
    }
}

/// Network source that always starts and reports scripted totals.
#[derive(Default)]
pub struct FakeNetwork {
    totals: Mutex<HashMap<u32, u64>>,
}

impl FakeNetwork {
    pub fn set(&self, pid: u32, bytes: u64) {
        lock(&self.totals).insert(pid, bytes);
    }
}

impl NetworkCounterSource for FakeNetwork {
    fn start(&self) -> Result<(), String> {
        Ok(())
    }

    fn total_bytes(&self, pid: u32) -> Option<u64> {
        lock(&self.totals).get(&pid).copied()
    }

    fn snapshot_totals(&self) -> Option<HashMap<u32, u64>> {
        Some(lock(&self.totals).clone())
    }
}

pub struct Fakes {
    pub probe: Arc<FakeProbe>,
    pub runner: Arc<FakeRunner>,
    pub windows: Arc<FakeWindows>,
    pub counters: Arc<FakeCounters>,
    pub gpu: Arc<FakeGpu>,
    pub network: Arc<FakeNetwork>,
}

impl Fakes {
    pub fn new() -> Self {
        let probe = Arc::new(FakeProbe::default());
        Self {
            runner: Arc::new(FakeRunner::new(probe.clone())),
            probe,
            windows: Arc::new(FakeWindows::default()),
            counters: Arc::new(FakeCounters::default()),
            gpu: Arc::new(FakeGpu::default()),
            network: Arc::new(FakeNetwork::default()),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            probe: self.probe.clone(),
            counters: self.counters.clone(),
            gpu: self.gpu.clone(),
            network: self.network.clone(),
            windows: self.windows.clone(),
            runner: self.runner.clone(),
        }
    }
}
