use super::sampler::{bytes_to_kb, SampleKey, Samplers};
use super::topology::{family, family_of_names};
use crate::platform::gpu::{GpuCache, GpuSample};
use crate::platform::network::NetworkMonitor;
use crate::platform::{names_by_pid, same_process_name, CounterSource, ProcessProbe};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Per-process resource queries. Rates come from the shared [`Samplers`],
/// so repeated calls for the same pid need at least the sampler window
/// between them to move.
pub struct UsageCollector {
    probe: Arc<dyn ProcessProbe>,
    counters: Arc<dyn CounterSource>,
    network: Arc<NetworkMonitor>,
    gpu: GpuCache,
    samplers: Samplers,
}

impl UsageCollector {
    pub fn new(
        probe: Arc<dyn ProcessProbe>,
        counters: Arc<dyn CounterSource>,
        network: Arc<NetworkMonitor>,
        gpu: GpuCache,
    ) -> Self {
        Self {
            probe,
            counters,
            network,
            gpu,
            samplers: Samplers::default(),
        }
    }

    pub fn probe(&self) -> &dyn ProcessProbe {
        self.probe.as_ref()
    }

    pub fn cpu_percent(&self, pid: u32, now: Instant) -> f64 {
        if pid == 0 {
            return 0.0;
        }
        match self.counters.cpu_time(pid) {
            Some(cpu) => {
                self.samplers
                    .cpu_percent(pid, now, cpu, self.counters.logical_cores())
            }
            None => 0.0,
        }
    }

    pub fn memory_mb(&self, pid: u32) -> u64 {
        if pid == 0 {
            return 0;
        }
        self.counters.memory_bytes(pid).unwrap_or(0) / BYTES_PER_MB
    }

    /// Network KB/s for `pid` and its descendants.
    pub fn net_kbs(&self, pid: u32, now: Instant) -> f64 {
        if pid == 0 || !self.network.is_active() {
            return 0.0;
        }
        let totals: Vec<u64> = family(self.probe(), pid)
            .into_iter()
            .filter_map(|p| self.network.total_bytes(p))
            .collect();
        if totals.is_empty() {
            return 0.0;
        }
        let total = totals.into_iter().fold(0u64, u64::saturating_add);
        let rate = self.samplers.net.sample(SampleKey::Family(pid), now, total as f64);
        self.network.apply_scale(bytes_to_kb(rate))
    }

    /// Network KB/s summed over every process matching `names`.
    pub fn net_kbs_by_names(&self, names: &[String], now: Instant) -> f64 {
        if !self.network.is_active() {
            return 0.0;
        }
        let pids = family_of_names(self.probe(), names);
        if pids.is_empty() {
            return 0.0;
        }
        let mut rate = 0.0;
        for pid in pids {
            let total = self.network.total_bytes(pid).unwrap_or(0);
            rate += self.samplers.net.sample(SampleKey::Process(pid), now, total as f64);
        }
        if rate <= 0.0 {
            rate = self.net_rate_by_process_name(names, now);
        }
        self.network.apply_scale(bytes_to_kb(rate))
    }

    /// Approximate: matches the raw source's pids by their current name, for
    /// when name-to-pid resolution lags behind freshly spawned children.
    fn net_rate_by_process_name(&self, names: &[String], now: Instant) -> f64 {
        let totals = self.network.snapshot_totals();
        if totals.is_empty() {
            return 0.0;
        }
        let wanted: Vec<&str> = names
            .iter()
            .map(|n| n.trim().trim_matches(|c| c == '"' || c == '\''))
            .filter(|n| !n.is_empty())
            .collect();
        let current = names_by_pid(self.probe(), totals.keys().copied());
        totals
            .iter()
            .filter(|(pid, _)| {
                current
                    .get(pid)
                    .is_some_and(|name| wanted.iter().any(|w| same_process_name(name, w)))
            })
            .map(|(pid, total)| {
                self.samplers
                    .net
                    .sample(SampleKey::Process(*pid), now, *total as f64)
            })
            .sum()
    }

    /// Disk I/O KB/s for `pid` and its descendants.
    pub fn io_kbs(&self, pid: u32, now: Instant) -> f64 {
        if pid == 0 {
            return 0.0;
        }
        let total = family(self.probe(), pid)
            .into_iter()
            .filter_map(|p| self.counters.io_bytes(p))
            .fold(0u64, u64::saturating_add);
        let rate = self.samplers.io.sample(SampleKey::Family(pid), now, total as f64);
        self.network.apply_scale(bytes_to_kb(rate))
    }

    pub fn io_kbs_by_names(&self, names: &[String], now: Instant) -> f64 {
        let rate: f64 = family_of_names(self.probe(), names)
            .into_iter()
            .filter_map(|pid| {
                let total = self.counters.io_bytes(pid)?;
                Some(self.samplers.io.sample(SampleKey::Process(pid), now, total as f64))
            })
            .sum();
        self.network.apply_scale(bytes_to_kb(rate))
    }

    pub async fn gpu_stats(&self) -> HashMap<u32, GpuSample> {
        self.gpu.stats().await
    }

    pub fn prune(&self, now: Instant) {
        self.samplers.prune(now);
    }
}
