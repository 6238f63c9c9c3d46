use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const CACHE_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpuSample {
    pub util_percent: f64,
    pub memory_mb: u64,
}

pub type GpuQuery<'a> = Pin<Box<dyn Future<Output = HashMap<u32, GpuSample>> + Send + 'a>>;

pub trait GpuSource: Send + Sync {
    /// Per-process GPU usage. Empty when no vendor tool is available.
    fn query(&self) -> GpuQuery<'_>;
}

/// NVIDIA only: asks `nvidia-smi` for compute apps, then falls back to
/// `pmon` when that returns nothing.
#[derive(Debug, Default)]
pub struct NvidiaSmi;

impl GpuSource for NvidiaSmi {
    fn query(&self) -> GpuQuery<'_> {
        Box::pin(async {
            let apps = run_nvidia_smi(&[
                "--query-compute-apps=pid,utilization.gpu,used_memory",
                "--format=csv,noheader,nounits",
            ])
            .await
            .map(|text| parse_compute_apps(&text))
            .unwrap_or_default();
            if !apps.is_empty() {
                return apps;
            }
            run_nvidia_smi(&["pmon", "-c", "1"])
                .await
                .map(|text| parse_pmon(&text))
                .unwrap_or_default()
        })
    }
}

async fn run_nvidia_smi(args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("nvidia-smi");
    cmd.args(args);
    output_within(cmd, QUERY_TIMEOUT).await
}

/// Stdout of `cmd`, or `None` if it cannot start or outlives `timeout`.
/// The child is killed when the timeout drops its future.
async fn output_within(mut cmd: Command, timeout: Duration) -> Option<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Err(err)) => {
            debug!(error = %err, "gpu query could not run");
            None
        }
        Err(_) => {
            debug!(?timeout, "gpu query timed out");
            None
        }
    }
}

fn parse_f64_loose(input: &str) -> f64 {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return 0.0;
    }
    trimmed
        .parse::<f64>()
        .or_else(|_| trimmed.replace(',', ".").parse::<f64>())
        .unwrap_or(0.0)
}

fn parse_u64_loose(input: &str) -> u64 {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return 0;
    }
    trimmed.parse::<u64>().unwrap_or(0)
}

/// Several rows for one pid (one per GPU) fold into max utilization and
/// summed memory.
fn fold(stats: &mut HashMap<u32, GpuSample>, pid: u32, util: f64, memory_mb: u64) {
    let entry = stats.entry(pid).or_default();
    entry.util_percent = entry.util_percent.max(util);
    entry.memory_mb = entry.memory_mb.saturating_add(memory_mb);
}

pub(crate) fn parse_compute_apps(text: &str) -> HashMap<u32, GpuSample> {
    let mut stats = HashMap::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split(',').map(|v| v.trim()).collect();
        if parts.len() < 3 {
            continue;
        }
        let Ok(pid) = parts[0].parse::<u32>() else {
            continue;
        };
        if pid == 0 {
            continue;
        }
        fold(&mut stats, pid, parse_f64_loose(parts[1]), parse_u64_loose(parts[2]));
    }
    stats
}

pub(crate) fn parse_pmon(text: &str) -> HashMap<u32, GpuSample> {
    let mut stats = HashMap::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let Ok(pid) = fields[1].parse::<u32>() else {
            continue;
        };
        if pid == 0 {
            continue;
        }
        fold(&mut stats, pid, parse_f64_loose(fields[3]), parse_u64_loose(fields[4]));
    }
    stats
}

/// Rate-limits a [`GpuSource`] to one query per second.
pub struct GpuCache {
    source: Arc<dyn GpuSource>,
    last: Mutex<Option<(Instant, HashMap<u32, GpuSample>)>>,
}

impl GpuCache {
    pub fn new(source: Arc<dyn GpuSource>) -> Self {
        Self {
            source,
            last: Mutex::new(None),
        }
    }

    pub async fn stats(&self) -> HashMap<u32, GpuSample> {
        {
            let last = self.last.lock().unwrap_or_else(|p| p.into_inner());
            if let Some((at, stats)) = last.as_ref() {
                if at.elapsed() < CACHE_TTL {
                    return stats.clone();
                }
            }
        }

        let stats = self.source.query().await;
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        *last = Some((Instant::now(), stats.clone()));
        stats
    }
}
