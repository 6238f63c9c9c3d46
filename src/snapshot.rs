use crate::platform::network::NetworkMonitor;
use crate::state::StatusRow;
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Latest published snapshot. Readers always see a whole snapshot.
pub type SnapshotStore = watch::Receiver<Snapshot>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkView {
    pub mode: String,
    pub error: String,
    pub debug: String,
    pub unit: String,
}

impl NetworkView {
    pub fn from_monitor(monitor: &NetworkMonitor, unit: &str, with_debug: bool) -> Self {
        Self {
            mode: monitor.mode().as_str().to_string(),
            error: monitor.last_error(),
            debug: if with_debug {
                monitor.debug_summary(3)
            } else {
                String::new()
            },
            unit: unit.to_string(),
        }
    }
}

/// Presentation-ready view of one workload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotRow {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub icon: String,
    pub pid: String,
    pub started_at: String,
    pub uptime: String,
    pub target: String,
    pub error: String,
    pub hung: bool,
    pub cpu: String,
    pub memory: String,
    pub network: String,
    pub io: String,
    pub gpu: String,
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub net_kbs: f64,
    pub io_kbs: f64,
    pub gpu_percent: f64,
    pub gpu_memory_mb: u64,
    pub launched: bool,
    pub launch_failed: bool,
    pub hang_killed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub updated: String,
    pub updated_unix: u64,
    pub version: String,
    pub network: NetworkView,
    pub items: Vec<SnapshotRow>,
}

impl Snapshot {
    pub fn empty(version: &str) -> Self {
        Self {
            version: version.to_string(),
            ..Self::default()
        }
    }
}

pub fn build(version: &str, rows: &[StatusRow], now: SystemTime, network: NetworkView) -> Snapshot {
    let unit = network.unit.clone();
    Snapshot {
        updated: format_timestamp(now),
        updated_unix: now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        version: version.to_string(),
        network,
        items: rows.iter().map(|row| build_row(row, &unit)).collect(),
    }
}

fn build_row(row: &StatusRow, unit: &str) -> SnapshotRow {
    let alive = row.status.is_alive() && row.pid.is_some();
    let usage = row.usage;
    let cpu_percent = usage.cpu_percent.clamp(0.0, 100.0);
    let shown = |text: String| if alive { text } else { "-".to_string() };

    SnapshotRow {
        name: row.name.clone(),
        kind: row.kind.clone(),
        status: row.status.as_str().to_string(),
        icon: row.status.icon().to_string(),
        pid: row.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string()),
        started_at: row
            .started_at
            .map_or_else(|| "-".to_string(), format_timestamp),
        uptime: dash_if_empty(&row.uptime),
        target: row.target.clone(),
        error: row.error.clone(),
        hung: row.hung,
        cpu: shown(format!("{cpu_percent:.1}%")),
        memory: shown(format!("{} MB", usage.memory_mb)),
        network: shown(format!("{:.1} {unit}", usage.net_kbs)),
        io: shown(format!("{:.1} {unit}", usage.io_kbs)),
        gpu: shown(format!("{:.0}% / {} MB", usage.gpu_percent, usage.gpu_memory_mb)),
        cpu_percent,
        memory_mb: usage.memory_mb,
        net_kbs: usage.net_kbs,
        io_kbs: usage.io_kbs,
        gpu_percent: usage.gpu_percent,
        gpu_memory_mb: usage.gpu_memory_mb,
        launched: row.launched,
        launch_failed: row.launch_failed,
        hang_killed: row.hang_killed,
    }
}

fn dash_if_empty(text: &str) -> String {
    if text.is_empty() {
        "-".to_string()
    } else {
        text.to_string()
    }
}

pub fn format_timestamp(at: SystemTime) -> String {
    humantime::format_rfc3339_seconds(at).to_string()
}

/// `MM:SS`, or `HH:MM:SS` once an hour has passed.
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

/// Uptime from `start` to `now`; `-` when the start lies in the future.
pub fn uptime_since(start: SystemTime, now: SystemTime) -> String {
    match now.duration_since(start) {
        Ok(elapsed) => format_uptime(elapsed),
        Err(_) => "-".to_string(),
    }
}

/// Countdown until `due`; `restart now` once it has passed.
pub fn format_countdown(due: SystemTime, now: SystemTime) -> String {
    let Ok(left) = due.duration_since(now) else {
        return "restart now".to_string();
    };
    let secs = left.as_secs();
    let (m, s) = (secs / 60, secs % 60);
    if m > 99 {
        format!("{m}m")
    } else {
        format!("restart in {m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Status, Usage};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn uptime_switches_to_hours() {
        assert_eq!(format_uptime(Duration::from_secs(59)), "00:59");
        assert_eq!(format_uptime(Duration::from_millis(125_900)), "02:05");
        assert_eq!(format_uptime(Duration::from_secs(3 * 3600 + 61)), "03:01:01");
        assert_eq!(uptime_since(at(10), at(5)), "-");
    }

    #[test]
    fn countdown_formats() {
        assert_eq!(format_countdown(at(1030), at(1002)), "restart in 00:28");
        assert_eq!(format_countdown(at(1000), at(1000)), "restart in 00:00");
        assert_eq!(format_countdown(at(1000), at(1001)), "restart now");
        assert_eq!(format_countdown(at(200 * 60), at(0)), "200m");
    }

    #[test]
    fn dead_rows_hide_usage_and_alive_rows_clamp_cpu() {
        let mut alive = StatusRow {
            name: "game".to_string(),
            kind: "exe".to_string(),
            status: Status::Running,
            pid: Some(42),
            started_at: Some(at(0)),
            uptime: "01:00".to_string(),
            ..StatusRow::default()
        };
        alive.usage = Usage {
            cpu_percent: 340.0,
            memory_mb: 512,
            ..Usage::default()
        };
        let dead = StatusRow {
            name: "relay".to_string(),
            kind: "cmd".to_string(),
            status: Status::Disabled,
            ..StatusRow::default()
        };

        let network = NetworkView {
            unit: "KB/s".to_string(),
            ..NetworkView::default()
        };
        let snapshot = build("1.2.3", &[alive, dead], at(3600), network);

        assert_eq!(snapshot.updated, "1970-01-01T01:00:00Z");
        assert_eq!(snapshot.updated_unix, 3600);
        let row = &snapshot.items[0];
        assert_eq!(row.pid, "42");
        assert_eq!(row.cpu, "100.0%");
        assert_eq!(row.cpu_percent, 100.0);
        assert_eq!(row.memory, "512 MB");
        assert_eq!(row.network, "0.0 KB/s");
        assert_eq!(row.icon, "★ WORK");

        let row = &snapshot.items[1];
        assert_eq!(row.status, "disabled");
        assert_eq!(row.pid, "-");
        assert_eq!(row.started_at, "-");
        assert_eq!(row.uptime, "-");
        assert_eq!(row.cpu, "-");
    }

    #[test]
    fn snapshot_serializes_type_field() {
        let snapshot = build("v", &[StatusRow::default()], at(0), NetworkView::default());
        let json = serde_json::to_value(&snapshot).expect("json");
        assert!(json["items"][0].get("type").is_some());
        assert_eq!(json["version"], "v");
    }
}
