use super::usage::UsageCollector;
use crate::platform::gpu::GpuSample;
use crate::state::{StatusRow, Usage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Usage measurement for one alive row.
#[derive(Debug, Clone)]
pub struct UsageTask {
    /// Position of the row this task fills in.
    pub index: usize,
    pub pid: u32,
    pub names: Vec<String>,
    /// Also aggregate network and I/O over every process matching `names`
    /// and report whichever rate is larger.
    pub aggregate_by_names: bool,
}

/// Measures every task with at most `workers` OS queries in flight, waits for
/// all of them, then writes each result into `rows[task.index]`.
pub async fn collect_usage(
    collector: Arc<UsageCollector>,
    tasks: Vec<UsageTask>,
    rows: &mut [StatusRow],
    workers: usize,
) {
    if tasks.is_empty() {
        return;
    }

    let gpu = Arc::new(collector.gpu_stats().await);
    let now = Instant::now();
    let permits = Arc::new(Semaphore::new(workers.max(1)));

    let mut js: JoinSet<(usize, Usage)> = JoinSet::new();
    for task in tasks {
        let collector = collector.clone();
        let gpu = gpu.clone();
        let permits = permits.clone();
        js.spawn(async move {
            let index = task.index;
            let Ok(_permit) = permits.acquire_owned().await else {
                return (index, Usage::default());
            };
            let usage = tokio::task::spawn_blocking(move || measure(&collector, &task, &gpu, now))
                .await
                .unwrap_or_default();
            (index, usage)
        });
    }

    let mut slots: Vec<Option<Usage>> = vec![None; rows.len()];
    while let Some(joined) = js.join_next().await {
        match joined {
            Ok((index, usage)) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(usage);
                }
            }
            Err(err) => warn!(error = %err, "usage task failed"),
        }
    }

    for (row, slot) in rows.iter_mut().zip(slots) {
        if let Some(usage) = slot {
            row.usage = usage;
        }
    }
}

fn measure(
    collector: &UsageCollector,
    task: &UsageTask,
    gpu: &HashMap<u32, GpuSample>,
    now: Instant,
) -> Usage {
    let pid = task.pid;
    let (mut net_kbs, mut io_kbs) = (collector.net_kbs(pid, now), collector.io_kbs(pid, now));
    if task.aggregate_by_names && !task.names.is_empty() {
        net_kbs = net_kbs.max(collector.net_kbs_by_names(&task.names, now));
        io_kbs = io_kbs.max(collector.io_kbs_by_names(&task.names, now));
    }
    let gpu = gpu.get(&pid).copied().unwrap_or_default();

    Usage {
        cpu_percent: collector.cpu_percent(pid, now),
        memory_mb: collector.memory_mb(pid),
        net_kbs,
        io_kbs,
        gpu_percent: gpu.util_percent,
        gpu_memory_mb: gpu.memory_mb,
    }
}
