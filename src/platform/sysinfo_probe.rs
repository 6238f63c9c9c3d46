use super::{same_process_name, CounterSource, ProbeError, ProcessProbe};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, PidExt, Process, ProcessExt, ProcessRefreshKind, ProcessStatus, System, SystemExt};
use tracing::debug;

/// A whole-table refresh is reused by every lookup inside this window, so
/// one supervisor round costs a single process scan.
const REFRESH_WINDOW: Duration = Duration::from_millis(200);

struct Table {
    system: System,
    refreshed_at: Option<Instant>,
}

/// Process probe and counter source backed by `sysinfo`.
pub struct SysinfoProbe {
    table: Mutex<Table>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                system: System::new(),
                refreshed_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fresh(&self) -> MutexGuard<'_, Table> {
        let mut table = self.lock();
        let stale = table
            .refreshed_at
            .map_or(true, |at| at.elapsed() >= REFRESH_WINDOW);
        if stale {
            table
                .system
                .refresh_processes_specifics(ProcessRefreshKind::new().with_disk_usage());
            table.refreshed_at = Some(Instant::now());
            debug!(processes = table.system.processes().len(), "process table refreshed");
        }
        table
    }

    fn live_pids_matching(&self, name: &str) -> Vec<u32> {
        let name = name.trim();
        if name.is_empty() {
            return Vec::new();
        }
        let table = self.fresh();
        let mut pids: Vec<u32> = table
            .system
            .processes()
            .values()
            .filter(|p| is_live(p) && matches_name(p, name))
            .map(|p| p.pid().as_u32())
            .collect();
        pids.sort_unstable();
        pids
    }
}

fn is_live(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Linux truncates `name()` to 15 bytes, so the executable file name is
/// checked as well.
fn matches_name(process: &Process, name: &str) -> bool {
    if same_process_name(process.name(), name) {
        return true;
    }
    process
        .exe()
        .file_name()
        .and_then(|f| f.to_str())
        .is_some_and(|file| same_process_name(file, name))
}

fn token_matches(arg: &str, token: &str) -> bool {
    if same_process_name(arg, token) {
        return true;
    }
    let bare = !token.contains('/') && !token.contains('\\');
    bare && Path::new(arg)
        .file_name()
        .and_then(|f| f.to_str())
        .is_some_and(|file| same_process_name(file, token))
}

pub(crate) fn argv_contains(argv: &[String], tokens: &[String]) -> bool {
    if tokens.is_empty() || tokens.len() > argv.len() {
        return false;
    }
    argv.windows(tokens.len()).any(|window| {
        window
            .iter()
            .zip(tokens)
            .all(|(arg, token)| token_matches(arg, token))
    })
}

impl ProcessProbe for SysinfoProbe {
    fn by_name(&self, name: &str) -> Result<Option<u32>, ProbeError> {
        Ok(self.live_pids_matching(name).first().copied())
    }

    fn pids_by_name(&self, name: &str) -> Result<Vec<u32>, ProbeError> {
        Ok(self.live_pids_matching(name))
    }

    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let mut table = self.lock();
        let pid = Pid::from_u32(pid);
        table.system.refresh_process(pid) && table.system.process(pid).is_some_and(is_live)
    }

    fn pids_by_cmdline(&self, name: &str, tokens: &[String]) -> Result<Vec<u32>, ProbeError> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let name = name.trim();
        let table = self.fresh();
        let mut matches: Vec<(u64, u32)> = table
            .system
            .processes()
            .values()
            .filter(|p| is_live(p))
            .filter(|p| name.is_empty() || matches_name(p, name))
            .filter(|p| argv_contains(p.cmd(), tokens))
            .map(|p| (p.start_time(), p.pid().as_u32()))
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        Ok(matches.into_iter().map(|(_, pid)| pid).collect())
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        let parent = Pid::from_u32(pid);
        let table = self.fresh();
        let mut out: Vec<u32> = table
            .system
            .processes()
            .values()
            .filter(|p| p.parent() == Some(parent))
            .map(|p| p.pid().as_u32())
            .collect();
        out.sort_unstable();
        out
    }

    fn parent(&self, pid: u32) -> Option<u32> {
        let table = self.fresh();
        table
            .system
            .process(Pid::from_u32(pid))
            .and_then(|p| p.parent())
            .map(|p| p.as_u32())
    }

    fn name_of(&self, pid: u32) -> Option<String> {
        let table = self.fresh();
        table
            .system
            .process(Pid::from_u32(pid))
            .map(|p| p.name().to_string())
    }

    fn start_time(&self, pid: u32) -> Option<SystemTime> {
        let table = self.fresh();
        let secs = table.system.process(Pid::from_u32(pid))?.start_time();
        Some(UNIX_EPOCH + Duration::from_secs(secs))
    }

    fn kill(&self, pid: u32) -> Result<(), ProbeError> {
        let mut table = self.lock();
        let target = Pid::from_u32(pid);
        if !table.system.refresh_process(target) {
            return Ok(());
        }
        let delivered = table.system.process(target).map(|p| p.kill());
        if delivered == Some(false) {
            return Err(ProbeError::Kill { pid });
        }
        table.refreshed_at = None;
        Ok(())
    }
}

impl CounterSource for SysinfoProbe {
    fn cpu_time(&self, pid: u32) -> Option<Duration> {
        proc_cpu_time(pid)
    }

    fn memory_bytes(&self, pid: u32) -> Option<u64> {
        let table = self.fresh();
        table.system.process(Pid::from_u32(pid)).map(|p| p.memory())
    }

    fn io_bytes(&self, pid: u32) -> Option<u64> {
        let table = self.fresh();
        table.system.process(Pid::from_u32(pid)).map(|p| {
            let usage = p.disk_usage();
            usage
                .total_read_bytes
                .saturating_add(usage.total_written_bytes)
        })
    }

    fn logical_cores(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    use std::sync::OnceLock;
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 {
            100
        } else {
            v as u64
        }
    })
}

/// utime + stime from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn proc_cpu_time(pid: u32) -> Option<Duration> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    let ticks = utime.saturating_add(stime);
    Some(Duration::from_secs_f64(ticks as f64 / ticks_per_sec() as f64))
}

#[cfg(not(target_os = "linux"))]
fn proc_cpu_time(_pid: u32) -> Option<Duration> {
    None
}
