use crate::config::{WorkloadKind, WorkloadSpec};
use crate::platform::{ProbeError, ProcessProbe, WindowManager};

/// Outcome of matching one workload against the process table.
#[derive(Debug, Default)]
pub(crate) struct Liveness {
    pub alive: bool,
    pub pid: Option<u32>,
    /// Names checked, reused for hang detection and name-aggregated usage.
    pub names: Vec<String>,
    pub probe_error: Option<ProbeError>,
}

impl Liveness {
    fn found(pid: u32) -> Self {
        Self {
            alive: true,
            pid: Some(pid),
            ..Self::default()
        }
    }

    fn from_lookup(result: Result<Option<u32>, ProbeError>) -> Self {
        match result {
            Ok(Some(pid)) => Self::found(pid),
            Ok(None) => Self::default(),
            Err(err) => Self {
                probe_error: Some(err),
                ..Self::default()
            },
        }
    }
}

/// Executables match by name. Commands and scripts prefer an exact
/// command-line match, then check-process names, then the tracked pid.
/// Whichever rule is configured decides; a configured rule that finds
/// nothing does not fall through to the next one.
pub(crate) fn check(probe: &dyn ProcessProbe, spec: &WorkloadSpec) -> Liveness {
    match &spec.kind {
        WorkloadKind::Executable => {
            let names = spec.candidate_names();
            let mut out = first_by_name(probe, &names);
            out.names = names;
            out
        }
        WorkloadKind::ShellCommand | WorkloadKind::ScriptFile => {
            let tokens = spec.cmdline_tokens();
            let mut out = if !tokens.is_empty() {
                let name = spec.check_process.first().map(String::as_str).unwrap_or("");
                Liveness::from_lookup(probe.exact_cmdline_match(name, &tokens))
            } else if !spec.check_process.is_empty() {
                first_by_name(probe, &spec.check_process)
            } else if spec.kind == WorkloadKind::ScriptFile && !spec.process.trim().is_empty() {
                let script = vec![spec.process.trim().to_string()];
                Liveness::from_lookup(probe.exact_cmdline_match("", &script))
            } else {
                tracked_pid(probe, spec)
            };
            out.names = spec.check_process.clone();
            out
        }
        WorkloadKind::Unknown(_) => Liveness::default(),
    }
}

/// Like [`check`], but commands and scripts try every configured rule in
/// turn (command line, names, script name, tracked pid) until one finds a
/// live process. Used before a manual launch so a workload whose pid is
/// still alive is not launched twice.
pub(crate) fn check_any(probe: &dyn ProcessProbe, spec: &WorkloadSpec) -> Liveness {
    if !matches!(spec.kind, WorkloadKind::ShellCommand | WorkloadKind::ScriptFile) {
        return check(probe, spec);
    }

    let mut probe_error = None;
    let mut settle = |out: Liveness| {
        if out.alive {
            return Some(out);
        }
        if out.probe_error.is_some() {
            probe_error = out.probe_error;
        }
        None
    };

    let tokens = spec.cmdline_tokens();
    let mut found = None;
    if !tokens.is_empty() {
        let name = spec.check_process.first().map(String::as_str).unwrap_or("");
        found = settle(Liveness::from_lookup(probe.exact_cmdline_match(name, &tokens)));
    }
    if found.is_none() && !spec.check_process.is_empty() {
        found = settle(first_by_name(probe, &spec.check_process));
    }
    if found.is_none() && spec.kind == WorkloadKind::ScriptFile && !spec.process.trim().is_empty() {
        let script = vec![spec.process.trim().to_string()];
        found = settle(Liveness::from_lookup(probe.exact_cmdline_match("", &script)));
    }
    if found.is_none() {
        found = settle(tracked_pid(probe, spec));
    }

    let mut out = found.unwrap_or_else(|| Liveness {
        probe_error,
        ..Liveness::default()
    });
    out.names = spec.check_process.clone();
    out
}

fn first_by_name(probe: &dyn ProcessProbe, names: &[String]) -> Liveness {
    let mut last_err = None;
    for name in names.iter().filter(|n| !n.trim().is_empty()) {
        match probe.by_name(name) {
            Ok(Some(pid)) => return Liveness::found(pid),
            Ok(None) => {}
            Err(err) => last_err = Some(err),
        }
    }
    Liveness {
        probe_error: last_err,
        ..Liveness::default()
    }
}

fn tracked_pid(probe: &dyn ProcessProbe, spec: &WorkloadSpec) -> Liveness {
    match spec.pid {
        Some(pid) if probe.is_alive(pid) => Liveness::found(pid),
        _ => Liveness::default(),
    }
}

/// True if any process named in `names` owns a non-responsive window.
pub(crate) fn any_hung(probe: &dyn ProcessProbe, windows: &dyn WindowManager, names: &[String]) -> bool {
    names
        .iter()
        .filter_map(|name| probe.pids_by_name(name).ok())
        .flatten()
        .any(|pid| windows.is_hung(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProbe, FakeWindows};

    fn tokens(line: &str) -> Vec<String> {
        crate::config::split_command_line(line)
    }

    #[test]
    fn executable_matches_any_candidate_name() {
        let probe = FakeProbe::default();
        let pid = probe.spawn("Game-Shipping", &[]);
        let mut spec = WorkloadSpec::new(WorkloadKind::Executable);
        spec.process = "Game".to_string();
        spec.check_process = vec!["Game".to_string(), "Game-Shipping".to_string()];

        let out = check(&probe, &spec);
        assert!(out.alive);
        assert_eq!(out.pid, Some(pid));
        assert_eq!(out.names.len(), 2);
    }

    #[test]
    fn command_prefers_exact_cmdline_and_does_not_fall_through() {
        let probe = FakeProbe::default();
        let other = probe.spawn("socat", &tokens("socat TCP-LISTEN:9999"));
        let mut spec = WorkloadSpec::new(WorkloadKind::ShellCommand);
        spec.command = "socat TCP-LISTEN:7777".to_string();
        spec.check_cmdline = "socat TCP-LISTEN:7777".to_string();
        spec.check_process = vec!["socat".to_string()];
        spec.pid = Some(other);

        assert!(!check(&probe, &spec).alive);

        let older = probe.spawn("socat", &tokens("socat TCP-LISTEN:7777"));
        let newer = probe.spawn("socat", &tokens("socat TCP-LISTEN:7777"));
        let out = check(&probe, &spec);
        assert!(out.alive);
        assert_eq!(out.pid, Some(newer));
        assert_ne!(out.pid, Some(older));
    }

    #[test]
    fn check_any_falls_back_to_tracked_pid_when_cmdline_misses() {
        let probe = FakeProbe::default();
        let pid = probe.spawn("sh", &tokens("sh -c relay --port 1"));
        let mut spec = WorkloadSpec::new(WorkloadKind::ShellCommand);
        spec.command = "relay --port 1".to_string();
        spec.check_cmdline = "relay --port 2".to_string();
        spec.pid = Some(pid);

        assert!(!check(&probe, &spec).alive);
        let out = check_any(&probe, &spec);
        assert!(out.alive);
        assert_eq!(out.pid, Some(pid));

        probe.exit(pid);
        assert!(!check_any(&probe, &spec).alive);
    }

    #[test]
    fn command_without_rules_uses_tracked_pid() {
        let probe = FakeProbe::default();
        let pid = probe.spawn("sh", &[]);
        let mut spec = WorkloadSpec::new(WorkloadKind::ShellCommand);
        spec.command = "run".to_string();
        assert!(!check(&probe, &spec).alive);

        spec.pid = Some(pid);
        assert!(check(&probe, &spec).alive);
        probe.exit(pid);
        assert!(!check(&probe, &spec).alive);
    }

    #[test]
    fn script_matches_on_script_name_in_argv() {
        let probe = FakeProbe::default();
        let pid = probe.spawn("sh", &tokens("sh /opt/scripts/backup.sh --full"));
        let mut spec = WorkloadSpec::new(WorkloadKind::ScriptFile);
        spec.process = "backup.sh".to_string();

        let out = check(&probe, &spec);
        assert_eq!(out.pid, Some(pid));
    }

    #[test]
    fn hang_is_detected_through_any_name() {
        let probe = FakeProbe::default();
        let windows = FakeWindows::default();
        let pid = probe.spawn("Game-Shipping", &[]);
        let names = vec!["Game".to_string(), "Game-Shipping".to_string()];

        assert!(!any_hung(&probe, &windows, &names));
        windows.set_hung(pid, true);
        assert!(any_hung(&probe, &windows, &names));
    }
}
