use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Raw per-process network byte accounting. Implementations are expected to
/// be best-effort; extraction heuristics stay behind this trait.
pub trait NetworkCounterSource: Send + Sync {
    fn start(&self) -> Result<(), String>;

    /// Cumulative bytes sent plus received by `pid`, if the source saw it.
    fn total_bytes(&self, pid: u32) -> Option<u64>;

    /// Every pid the source currently has a total for. `None` when idle.
    fn snapshot_totals(&self) -> Option<HashMap<u32, u64>>;
}

/// Source for hosts without per-process network accounting.
#[derive(Debug, Default)]
pub struct UnsupportedNetwork;

impl NetworkCounterSource for UnsupportedNetwork {
    fn start(&self) -> Result<(), String> {
        Err("per-process network accounting is not supported on this platform".to_string())
    }

    fn total_bytes(&self, _pid: u32) -> Option<u64> {
        None
    }

    fn snapshot_totals(&self) -> Option<HashMap<u32, u64>> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetMode {
    Trace,
    Unavailable,
    Disabled,
}

impl NetMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NetMode::Trace => "trace",
            NetMode::Unavailable => "unavailable",
            NetMode::Disabled => "disabled",
        }
    }
}

/// Network-collection toggles shared by the supervisor and the usage
/// collector.
pub struct NetworkMonitor {
    source: Arc<dyn NetworkCounterSource>,
    requested: AtomicBool,
    active: AtomicBool,
    scale_bits: AtomicU64,
    last_error: Mutex<String>,
}

impl NetworkMonitor {
    pub fn new(source: Arc<dyn NetworkCounterSource>) -> Self {
        Self {
            source,
            requested: AtomicBool::new(false),
            active: AtomicBool::new(false),
            scale_bits: AtomicU64::new(1.0f64.to_bits()),
            last_error: Mutex::new(String::new()),
        }
    }

    /// Turns collection on or off. A failed start is remembered and
    /// reported through [`NetworkMonitor::last_error`].
    pub fn configure(&self, enable: bool) -> Result<(), String> {
        self.requested.store(enable, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.set_error(String::new());
        if !enable {
            return Ok(());
        }
        match self.source.start() {
            Ok(()) => {
                self.active.store(true, Ordering::SeqCst);
                info!("per-process network collection started");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "per-process network collection unavailable");
                self.set_error(err.clone());
                Err(err)
            }
        }
    }

    /// Divisor applied to network and I/O rates. Anything below 1 (or not a
    /// number) counts as 1.
    pub fn set_scale(&self, scale: f64) {
        let scale = if scale.is_finite() && scale >= 1.0 { scale } else { 1.0 };
        self.scale_bits.store(scale.to_bits(), Ordering::SeqCst);
    }

    pub fn scale(&self) -> f64 {
        f64::from_bits(self.scale_bits.load(Ordering::SeqCst))
    }

    pub fn apply_scale(&self, rate: f64) -> f64 {
        rate / self.scale()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> NetMode {
        match (self.requested.load(Ordering::SeqCst), self.is_active()) {
            (true, true) => NetMode::Trace,
            (true, false) => NetMode::Unavailable,
            (false, _) => NetMode::Disabled,
        }
    }

    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn total_bytes(&self, pid: u32) -> Option<u64> {
        if !self.is_active() {
            return None;
        }
        self.source.total_bytes(pid)
    }

    pub fn snapshot_totals(&self) -> HashMap<u32, u64> {
        if !self.is_active() {
            return HashMap::new();
        }
        self.source.snapshot_totals().unwrap_or_default()
    }

    /// One-line summary: pid count, byte total and the `limit` busiest pids.
    pub fn debug_summary(&self, limit: usize) -> String {
        if self.requested.load(Ordering::SeqCst) && !self.is_active() {
            return "net:inactive".to_string();
        }
        match self.source.snapshot_totals() {
            Some(totals) if self.is_active() => summarize(&totals, limit),
            _ => "net:off".to_string(),
        }
    }

    fn set_error(&self, err: String) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = err;
    }
}

fn summarize(totals: &HashMap<u32, u64>, limit: usize) -> String {
    if totals.is_empty() {
        return "net:pids=0 bytes=0".to_string();
    }
    let mut busiest: Vec<(u32, u64)> = totals.iter().map(|(pid, b)| (*pid, *b)).collect();
    busiest.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let total: u64 = busiest.iter().map(|(_, b)| *b).fold(0, u64::saturating_add);
    let top: Vec<String> = busiest
        .iter()
        .take(limit.max(1))
        .map(|(pid, b)| format!("{pid}:{b}"))
        .collect();
    format!(
        "net:pids={} bytes={} top={}",
        busiest.len(),
        total,
        top.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNetwork;

    #[test]
    fn unsupported_source_reports_unavailable() {
        let monitor = NetworkMonitor::new(Arc::new(UnsupportedNetwork));
        assert_eq!(monitor.mode(), NetMode::Disabled);

        assert!(monitor.configure(true).is_err());
        assert_eq!(monitor.mode(), NetMode::Unavailable);
        assert!(!monitor.last_error().is_empty());
        assert_eq!(monitor.debug_summary(3), "net:inactive");
        assert_eq!(monitor.total_bytes(1), None);

        monitor.configure(false).expect("disable");
        assert_eq!(monitor.mode(), NetMode::Disabled);
        assert!(monitor.last_error().is_empty());
    }

    #[test]
    fn scale_below_one_is_ignored() {
        let monitor = NetworkMonitor::new(Arc::new(UnsupportedNetwork));
        monitor.set_scale(0.0);
        assert_eq!(monitor.scale(), 1.0);
        monitor.set_scale(-5.0);
        assert_eq!(monitor.scale(), 1.0);
        monitor.set_scale(1000.0);
        assert_eq!(monitor.apply_scale(2000.0), 2.0);
    }

    #[test]
    fn summary_lists_busiest_pids_first() {
        let source = Arc::new(FakeNetwork::default());
        source.set(10, 100);
        source.set(20, 900);
        source.set(30, 50);
        let monitor = NetworkMonitor::new(source);
        monitor.configure(true).expect("start");

        assert_eq!(monitor.mode(), NetMode::Trace);
        assert_eq!(
            monitor.debug_summary(2),
            "net:pids=3 bytes=1050 top=20:900,10:100"
        );
    }
}
