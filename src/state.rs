use crate::config::WorkloadSpec;
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;

/// Runtime state we report for a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Unknown,
    Running,
    Started,
    Stopped,
    Disabled,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Running => "running",
            Status::Started => "started",
            Status::Stopped => "stopped",
            Status::Disabled => "disabled",
        }
    }

    /// Console marker for the status column.
    pub fn icon(self) -> &'static str {
        match self {
            Status::Running => "★ WORK",
            Status::Started => "☆ RUN",
            Status::Stopped => "✗ NRUN",
            Status::Disabled => "⛔ DISABLED",
            Status::Unknown => "☠ UNKNOWN",
        }
    }

    pub fn is_alive(self) -> bool {
        matches!(self, Status::Running | Status::Started)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor bookkeeping for one workload. Lives until the next config swap.
#[derive(Debug, Clone, Default)]
pub struct WorkloadRuntime {
    pub last_status: Option<Status>,
    pub restart_at: Option<SystemTime>,
    pub hung_since: Option<SystemTime>,
    pub manual_stop: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Usage {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub net_kbs: f64,
    pub io_kbs: f64,
    pub gpu_percent: f64,
    pub gpu_memory_mb: u64,
}

/// One evaluated workload for a single tick.
#[derive(Debug, Clone, Default)]
pub struct StatusRow {
    pub name: String,
    pub kind: String,
    pub status: Status,
    pub target: String,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    /// Uptime, or the countdown to the next restart when stopped.
    pub uptime: String,
    pub hung: bool,
    pub usage: Usage,
    pub error: String,
    pub launched: bool,
    pub launch_failed: bool,
    pub hang_killed: bool,
}

impl StatusRow {
    pub fn new(name: &str, spec: &WorkloadSpec) -> Self {
        Self {
            name: name.to_string(),
            kind: spec.kind.as_str().to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkloadKind;

    #[test]
    fn only_running_and_started_count_as_alive() {
        assert!(Status::Running.is_alive());
        assert!(Status::Started.is_alive());
        assert!(!Status::Stopped.is_alive());
        assert!(!Status::Disabled.is_alive());
        assert!(!Status::Unknown.is_alive());
    }

    #[test]
    fn new_row_carries_type_label() {
        let spec = WorkloadSpec::new(WorkloadKind::ScriptFile);
        let row = StatusRow::new("backup", &spec);
        assert_eq!(row.kind, "bat");
        assert_eq!(row.status, Status::Unknown);
        assert!(row.pid.is_none());
    }
}
