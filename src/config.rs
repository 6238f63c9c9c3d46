use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "default_check_interval", with = "duration_text")]
    pub check_interval: Duration,
    #[serde(default = "default_restart_interval", with = "duration_text")]
    pub restart_interval: Duration,
    #[serde(default)]
    pub launch_in_new_console: bool,
    #[serde(default)]
    pub auto_close_error_dialogs: bool,
    #[serde(default, deserialize_with = "name_list")]
    pub error_window_titles: Vec<String>,
    #[serde(default)]
    pub trace_network: bool,
    #[serde(default)]
    pub net_debug: bool,
    #[serde(default = "default_net_unit")]
    pub net_unit: String,
    #[serde(default = "default_net_scale")]
    pub net_scale: f64,
    #[serde(default = "default_metrics_workers")]
    pub metrics_workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            restart_interval: default_restart_interval(),
            launch_in_new_console: false,
            auto_close_error_dialogs: false,
            error_window_titles: Vec::new(),
            trace_network: false,
            net_debug: false,
            net_unit: default_net_unit(),
            net_scale: default_net_scale(),
            metrics_workers: default_metrics_workers(),
        }
    }
}

/// How a workload is launched and matched against running processes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum WorkloadKind {
    Executable,
    ShellCommand,
    ScriptFile,
    /// A type string we do not understand. Kept so a single bad entry does
    /// not reject the whole file; the supervisor reports it on its own row.
    Unknown(String),
}

impl WorkloadKind {
    pub fn as_str(&self) -> &str {
        match self {
            WorkloadKind::Executable => "exe",
            WorkloadKind::ShellCommand => "cmd",
            WorkloadKind::ScriptFile => "bat",
            WorkloadKind::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn supports_hang_monitoring(&self) -> bool {
        matches!(self, WorkloadKind::Executable)
    }
}

impl From<String> for WorkloadKind {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "exe" | "executable" => WorkloadKind::Executable,
            "cmd" | "command" | "shell" => WorkloadKind::ShellCommand,
            "bat" | "script" => WorkloadKind::ScriptFile,
            _ => WorkloadKind::Unknown(value),
        }
    }
}

impl From<WorkloadKind> for String {
    fn from(value: WorkloadKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkloadSpec {
    #[serde(rename = "type")]
    pub kind: WorkloadKind,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub process: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: String,
    #[serde(default, deserialize_with = "name_list")]
    pub check_process: Vec<String>,
    #[serde(default)]
    pub check_cmdline: String,
    #[serde(default)]
    pub monitor_hang: bool,
    #[serde(default, with = "duration_text")]
    pub hang_timeout: Duration,
    /// Last PID observed or launched for this workload.
    #[serde(skip)]
    pub pid: Option<u32>,
}

impl WorkloadSpec {
    pub fn new(kind: WorkloadKind) -> Self {
        Self {
            kind,
            disabled: false,
            path: String::new(),
            process: String::new(),
            command: String::new(),
            args: String::new(),
            check_process: Vec::new(),
            check_cmdline: String::new(),
            monitor_hang: false,
            hang_timeout: Duration::ZERO,
            pid: None,
        }
    }

    /// Process names used for liveness checks, falling back to the
    /// configured executable name when no explicit list is given.
    pub fn candidate_names(&self) -> Vec<String> {
        if self.check_process.is_empty() {
            vec![self.process.trim().to_string()]
        } else {
            self.check_process.clone()
        }
    }

    pub fn cmdline_tokens(&self) -> Vec<String> {
        split_command_line(&self.check_cmdline)
    }

    pub fn file_path(&self) -> PathBuf {
        Path::new(self.path.trim()).join(self.process.trim())
    }

    pub fn hang_monitoring_active(&self) -> bool {
        self.monitor_hang && !self.hang_timeout.is_zero() && self.kind.supports_hang_monitoring()
    }

    /// Missing files are reported as row text; they never decide liveness.
    pub fn path_error(&self) -> Option<String> {
        if self.path.trim().is_empty() || self.process.trim().is_empty() {
            return None;
        }
        match fs::metadata(self.file_path()) {
            Ok(_) => None,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Some("File not found".to_string()),
            Err(err) => Some(format!("path error: {err}")),
        }
    }

    /// What the console shows in the TARGET column.
    pub fn target(&self) -> String {
        match self.kind {
            WorkloadKind::Executable => {
                if self.process.trim().is_empty() {
                    self.candidate_names().join(", ")
                } else {
                    self.process.clone()
                }
            }
            WorkloadKind::ShellCommand => self.command.clone(),
            WorkloadKind::ScriptFile => self.process.clone(),
            WorkloadKind::Unknown(_) => String::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }

        validate_settings(&self.settings)?;
        validate_workloads(&self.workloads)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

/// Upper bound for every configured interval and timeout. Deadlines are
/// computed as `now + interval`, which must not overflow.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.check_interval.is_zero() {
        return Err(ConfigError::Validation(
            "settings.check_interval must be > 0".to_string(),
        ));
    }
    if settings.restart_interval.is_zero() {
        return Err(ConfigError::Validation(
            "settings.restart_interval must be > 0".to_string(),
        ));
    }
    for (key, value) in [
        ("check_interval", settings.check_interval),
        ("restart_interval", settings.restart_interval),
    ] {
        if value > MAX_INTERVAL {
            return Err(ConfigError::Validation(format!(
                "settings.{key} must be at most {}",
                humantime::format_duration(MAX_INTERVAL)
            )));
        }
    }
    if settings.metrics_workers < 1 {
        return Err(ConfigError::Validation(
            "settings.metrics_workers must be >= 1".to_string(),
        ));
    }
    if !settings.net_scale.is_finite() {
        return Err(ConfigError::Validation(
            "settings.net_scale must be a finite number".to_string(),
        ));
    }
    Ok(())
}

fn validate_workloads(workloads: &BTreeMap<String, WorkloadSpec>) -> Result<(), ConfigError> {
    for (name, spec) in workloads {
        if name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "workload names must not be empty".to_string(),
            ));
        }
        match spec.kind {
            WorkloadKind::Executable if spec.process.trim().is_empty() && spec.check_process.is_empty() => {
                return Err(ConfigError::Validation(format!(
                    "workload '{name}' needs process or check_process"
                )));
            }
            WorkloadKind::ShellCommand if spec.command.trim().is_empty() => {
                return Err(ConfigError::Validation(format!(
                    "workload '{name}' command must not be empty"
                )));
            }
            _ => {}
        }
        if spec.hang_timeout > MAX_INTERVAL {
            return Err(ConfigError::Validation(format!(
                "workload '{name}' hang_timeout must be at most {}",
                humantime::format_duration(MAX_INTERVAL)
            )));
        }
    }
    Ok(())
}

/// Splits a command line on whitespace, keeping double-quoted runs together.
pub fn split_command_line(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in raw.trim().chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    out.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        out.push(current);
    }
    out
}

/// Parses `100ms`, `2s`, `1m 30s` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let text = raw.trim();
    if text.is_empty() {
        return Ok(Duration::ZERO);
    }
    if let Ok(d) = humantime::parse_duration(text) {
        return Ok(d);
    }
    match text.parse::<f64>() {
        Ok(secs) => seconds(secs),
        Err(_) => Err(format!("invalid duration {text:?}")),
    }
}

/// Negative, NaN and out-of-range values are errors, never a panic.
fn seconds(secs: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(secs).map_err(|err| format!("invalid duration {secs}: {err}"))
}

mod duration_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => super::seconds(secs).map_err(serde::de::Error::custom),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

/// Accepts either a YAML list or a comma-separated string.
fn name_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Csv(String),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::List(items) => items,
        Raw::Csv(text) => text.split(',').map(str::to_string).collect(),
    };
    Ok(items
        .iter()
        .map(|s| s.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn default_listen() -> String {
    "127.0.0.1:9109".to_string()
}

const fn default_check_interval() -> Duration {
    Duration::from_secs(2)
}

const fn default_restart_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_net_unit() -> String {
    "KB/s".to_string()
}

const fn default_net_scale() -> f64 {
    1.0
}

const fn default_metrics_workers() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut game = WorkloadSpec::new(WorkloadKind::Executable);
        game.process = "game.bin".to_string();
        Config {
            listen: "127.0.0.1:9109".to_string(),
            settings: Settings::default(),
            workloads: BTreeMap::from([("game".to_string(), game)]),
        }
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example validates");
        assert!(!cfg.workloads.is_empty());
    }

    #[test]
    fn durations_accept_text_and_bare_seconds() {
        let yaml = r#"
settings:
  check_interval: 500ms
  restart_interval: 1.5
workloads: {}
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.settings.check_interval, Duration::from_millis(500));
        assert_eq!(cfg.settings.restart_interval, Duration::from_millis(1500));
        assert!(parse_duration("soon").is_err());
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
    }

    #[test]
    fn check_process_accepts_csv_and_list() {
        let yaml = r#"
workloads:
  a:
    type: exe
    check_process: "Game.exe, Game-Win64-Shipping.exe ,"
  b:
    type: exe
    check_process: [" x.bin ", "'y.bin'"]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(
            cfg.workloads["a"].check_process,
            vec!["Game.exe", "Game-Win64-Shipping.exe"]
        );
        assert_eq!(cfg.workloads["b"].check_process, vec!["x.bin", "y.bin"]);
    }

    #[test]
    fn unknown_type_is_kept_instead_of_rejected() {
        let yaml = r#"
workloads:
  odd:
    type: service
  tool:
    type: Script
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(
            cfg.workloads["odd"].kind,
            WorkloadKind::Unknown("service".to_string())
        );
        assert_eq!(cfg.workloads["tool"].kind, WorkloadKind::ScriptFile);
    }

    #[test]
    fn candidate_names_fall_back_to_process() {
        let cfg = valid_config();
        assert_eq!(cfg.workloads["game"].candidate_names(), vec!["game.bin"]);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut cfg = valid_config();
        cfg.settings.restart_interval = Duration::ZERO;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn huge_durations_are_errors_not_panics() {
        let err = serde_yaml::from_str::<Config>("settings:\n  restart_interval: 1e30\n");
        assert!(err.is_err());
        let err = serde_yaml::from_str::<Config>("settings:\n  check_interval: -1\n");
        assert!(err.is_err());
        assert!(parse_duration("1e30").is_err());
        assert!(parse_duration("NaN").is_err());
    }

    #[test]
    fn intervals_beyond_a_year_are_rejected() {
        let mut cfg = valid_config();
        cfg.settings.restart_interval = MAX_INTERVAL + Duration::from_secs(1);
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = valid_config();
        cfg.settings.check_interval = MAX_INTERVAL;
        cfg.validate().expect("a year is allowed");

        let mut cfg = valid_config();
        if let Some(game) = cfg.workloads.get_mut("game") {
            game.hang_timeout = Duration::from_secs(u64::MAX);
        }
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn bad_listen_is_rejected() {
        let mut cfg = valid_config();
        cfg.listen = "not-an-address".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn command_line_splitting_respects_quotes() {
        assert_eq!(
            split_command_line(r#"python  "my server.py" --port 80"#),
            vec!["python", "my server.py", "--port", "80"]
        );
        assert_eq!(split_command_line(r#"run """#), vec!["run", ""]);
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn missing_file_surfaces_as_text() {
        let mut spec = WorkloadSpec::new(WorkloadKind::Executable);
        spec.path = "/definitely/not/here".to_string();
        spec.process = "nope.bin".to_string();
        assert_eq!(spec.path_error().as_deref(), Some("File not found"));
    }
}
