use crate::snapshot::Snapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub workload_up: GaugeVec,
    pub workload_hung: GaugeVec,
    pub workload_cpu_percent: GaugeVec,
    pub workload_memory_mb: GaugeVec,
    pub workload_net_kbs: GaugeVec,
    pub workload_io_kbs: GaugeVec,
    pub workload_gpu_percent: GaugeVec,
    pub workload_gpu_memory_mb: GaugeVec,
    pub workloads_total: Gauge,
    pub workloads_up: Gauge,
    pub auto_launches_total: CounterVec,
    pub hang_kills_total: CounterVec,
    pub launch_errors_total: CounterVec,
    pub uptime_seconds: Gauge,
    pub scrape_count_total: Counter,
    pub last_tick_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();
        let labels = &["workload", "type"];

        let workload_up = GaugeVec::new(
            opts!("procwarden_workload_up", "1 if the workload is running"),
            labels,
        )?;
        let workload_hung = GaugeVec::new(
            opts!(
                "procwarden_workload_hung",
                "1 if the workload owns a non-responsive window"
            ),
            labels,
        )?;
        let workload_cpu_percent = GaugeVec::new(
            opts!(
                "procwarden_workload_cpu_percent",
                "Workload CPU usage in percent of all logical cores (0..100)"
            ),
            labels,
        )?;
        let workload_memory_mb = GaugeVec::new(
            opts!("procwarden_workload_memory_mb", "Workload resident memory in MB"),
            labels,
        )?;
        let workload_net_kbs = GaugeVec::new(
            opts!(
                "procwarden_workload_net_kbs",
                "Workload network rate in KB/s after the configured scale"
            ),
            labels,
        )?;
        let workload_io_kbs = GaugeVec::new(
            opts!(
                "procwarden_workload_io_kbs",
                "Workload disk I/O rate in KB/s after the configured scale"
            ),
            labels,
        )?;
        let workload_gpu_percent = GaugeVec::new(
            opts!("procwarden_workload_gpu_percent", "Workload GPU utilization in percent"),
            labels,
        )?;
        let workload_gpu_memory_mb = GaugeVec::new(
            opts!("procwarden_workload_gpu_memory_mb", "Workload GPU memory in MB"),
            labels,
        )?;
        let workloads_total = Gauge::with_opts(opts!(
            "procwarden_workloads_total",
            "Number of configured workloads"
        ))?;
        let workloads_up = Gauge::with_opts(opts!(
            "procwarden_workloads_up",
            "Number of running workloads"
        ))?;
        let auto_launches_total = CounterVec::new(
            opts!(
                "procwarden_auto_launches_total",
                "Automatic launches performed by the supervisor"
            ),
            &["workload"],
        )?;
        let hang_kills_total = CounterVec::new(
            opts!(
                "procwarden_hang_kills_total",
                "Workloads terminated after staying hung past their timeout"
            ),
            &["workload"],
        )?;
        let launch_errors_total = CounterVec::new(
            opts!("procwarden_launch_errors_total", "Failed automatic launches"),
            &["workload"],
        )?;
        let uptime_seconds = Gauge::with_opts(opts!(
            "procwarden_uptime_seconds",
            "Supervisor uptime in seconds"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "procwarden_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "procwarden_last_tick_timestamp_seconds",
            "Unix time of the last published snapshot"
        ))?;

        register(&registry, &workload_up)?;
        register(&registry, &workload_hung)?;
        register(&registry, &workload_cpu_percent)?;
        register(&registry, &workload_memory_mb)?;
        register(&registry, &workload_net_kbs)?;
        register(&registry, &workload_io_kbs)?;
        register(&registry, &workload_gpu_percent)?;
        register(&registry, &workload_gpu_memory_mb)?;
        register(&registry, &workloads_total)?;
        register(&registry, &workloads_up)?;
        register(&registry, &auto_launches_total)?;
        register(&registry, &hang_kills_total)?;
        register(&registry, &launch_errors_total)?;
        register(&registry, &uptime_seconds)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &last_tick_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            workload_up,
            workload_hung,
            workload_cpu_percent,
            workload_memory_mb,
            workload_net_kbs,
            workload_io_kbs,
            workload_gpu_percent,
            workload_gpu_memory_mb,
            workloads_total,
            workloads_up,
            auto_launches_total,
            hang_kills_total,
            launch_errors_total,
            uptime_seconds,
            scrape_count_total,
            last_tick_timestamp_seconds,
        }))
    }

    /// Mirrors one published snapshot. Per-workload gauges are rebuilt so
    /// workloads dropped by a config reload disappear from the output.
    pub fn update_from_snapshot(&self, snapshot: &Snapshot) {
        for vec in [
            &self.workload_up,
            &self.workload_hung,
            &self.workload_cpu_percent,
            &self.workload_memory_mb,
            &self.workload_net_kbs,
            &self.workload_io_kbs,
            &self.workload_gpu_percent,
            &self.workload_gpu_memory_mb,
        ] {
            vec.reset();
        }

        let mut up_count = 0.0;
        for row in &snapshot.items {
            let labels = [row.name.as_str(), row.kind.as_str()];
            let up = matches!(row.status.as_str(), "running" | "started");
            if up {
                up_count += 1.0;
            }
            self.workload_up
                .with_label_values(&labels)
                .set(if up { 1.0 } else { 0.0 });
            self.workload_hung
                .with_label_values(&labels)
                .set(if row.hung { 1.0 } else { 0.0 });
            self.workload_cpu_percent
                .with_label_values(&labels)
                .set(row.cpu_percent);
            self.workload_memory_mb
                .with_label_values(&labels)
                .set(row.memory_mb as f64);
            self.workload_net_kbs
                .with_label_values(&labels)
                .set(row.net_kbs);
            self.workload_io_kbs
                .with_label_values(&labels)
                .set(row.io_kbs);
            self.workload_gpu_percent
                .with_label_values(&labels)
                .set(row.gpu_percent);
            self.workload_gpu_memory_mb
                .with_label_values(&labels)
                .set(row.gpu_memory_mb as f64);

            if row.launched {
                self.auto_launches_total.with_label_values(&[&row.name]).inc();
            }
            if row.launch_failed {
                self.launch_errors_total.with_label_values(&[&row.name]).inc();
            }
            if row.hang_killed {
                self.hang_kills_total.with_label_values(&[&row.name]).inc();
            }
        }

        self.workloads_total.set(snapshot.items.len() as f64);
        self.workloads_up.set(up_count);
        self.last_tick_timestamp_seconds
            .set(snapshot.updated_unix as f64);
        self.refresh_uptime();
    }

    pub fn refresh_uptime(&self) {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotRow;

    fn row(name: &str, status: &str) -> SnapshotRow {
        SnapshotRow {
            name: name.to_string(),
            kind: "exe".to_string(),
            status: status.to_string(),
            ..SnapshotRow::default()
        }
    }

    #[test]
    fn snapshot_rows_become_labelled_series() {
        let metrics = Metrics::new().expect("metrics");
        let mut game = row("game", "running");
        game.memory_mb = 512;
        game.launched = true;
        let snapshot = Snapshot {
            updated_unix: 1_700_000_000,
            items: vec![game, row("relay", "stopped")],
            ..Snapshot::default()
        };
        metrics.update_from_snapshot(&snapshot);

        let text = String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8");
        assert!(text.contains(r#"procwarden_workload_up{type="exe",workload="game"} 1"#));
        assert!(text.contains(r#"procwarden_workload_up{type="exe",workload="relay"} 0"#));
        assert!(text.contains(r#"procwarden_workload_memory_mb{type="exe",workload="game"} 512"#));
        assert!(text.contains(r#"procwarden_auto_launches_total{workload="game"} 1"#));
        assert!(!text.contains("procwarden_launches_total"));
        assert!(text.contains("procwarden_workloads_up 1"));
        assert!(text.contains("procwarden_last_tick_timestamp_seconds 1700000000"));
    }

    #[test]
    fn removed_workloads_drop_out() {
        let metrics = Metrics::new().expect("metrics");
        metrics.update_from_snapshot(&Snapshot {
            items: vec![row("old", "running")],
            ..Snapshot::default()
        });
        metrics.update_from_snapshot(&Snapshot {
            items: vec![row("new", "running")],
            ..Snapshot::default()
        });

        let text = String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8");
        assert!(!text.contains(r#"workload_up{type="exe",workload="old"}"#));
        assert!(text.contains(r#"workload_up{type="exe",workload="new"}"#));
    }
}
