use crate::config::{WorkloadKind, WorkloadSpec};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("file {0} does not exist")]
    Missing(String),
    #[error("cannot access {path}: {source}")]
    Access { path: String, source: io::Error },
    #[error("script process is empty")]
    EmptyScript,
    #[error("command is empty")]
    EmptyCommand,
    #[error("unknown process type {0:?}")]
    UnknownKind(String),
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },
}

pub trait Runner: Send + Sync {
    /// Starts the workload without waiting for it and returns the new pid.
    fn launch(&self, spec: &WorkloadSpec, new_console: bool) -> Result<u32, LaunchError>;
}

/// Launches workloads with `std::process::Command`.
#[derive(Debug, Default)]
pub struct CommandRunner;

impl Runner for CommandRunner {
    fn launch(&self, spec: &WorkloadSpec, new_console: bool) -> Result<u32, LaunchError> {
        let mut cmd = match &spec.kind {
            WorkloadKind::Executable => {
                let path = existing_file(spec)?;
                let mut cmd = Command::new(&path);
                cmd.args(spec.args.split_whitespace());
                if let Some(dir) = path.parent() {
                    cmd.current_dir(dir);
                }
                hide_window(&mut cmd);
                cmd
            }
            WorkloadKind::ShellCommand => {
                if spec.command.trim().is_empty() {
                    return Err(LaunchError::EmptyCommand);
                }
                let mut cmd = shell_command(&spec.command, new_console);
                let dir = spec.path.trim();
                if !dir.is_empty() {
                    cmd.current_dir(dir);
                }
                cmd
            }
            WorkloadKind::ScriptFile => {
                if spec.process.trim().is_empty() {
                    return Err(LaunchError::EmptyScript);
                }
                let path = existing_file(spec)?;
                let mut cmd = script_command(&path, &spec.args, new_console);
                if let Some(dir) = path.parent() {
                    cmd.current_dir(dir);
                }
                cmd
            }
            WorkloadKind::Unknown(raw) => return Err(LaunchError::UnknownKind(raw.clone())),
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let program = format!("{:?}", cmd.get_program());
        let child = cmd
            .spawn()
            .map_err(|source| LaunchError::Spawn { program, source })?;
        let pid = child.id();
        reap(child);
        Ok(pid)
    }
}

fn existing_file(spec: &WorkloadSpec) -> Result<PathBuf, LaunchError> {
    let path = spec.file_path();
    match std::fs::metadata(&path) {
        Ok(_) => Ok(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(LaunchError::Missing(path.display().to_string()))
        }
        Err(source) => Err(LaunchError::Access {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Waits on the child in the background so it never lingers as a zombie.
fn reap(mut child: Child) {
    let pid = child.id();
    let spawned = thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || {
            let status = child.wait();
            debug!(pid, ?status, "launched process exited");
        });
    if let Err(err) = spawned {
        debug!(pid, error = %err, "could not spawn reaper thread");
    }
}

#[cfg(windows)]
fn shell_command(line: &str, new_console: bool) -> Command {
    let mut cmd = Command::new("cmd.exe");
    if new_console {
        cmd.args(["/C", "start", "", "cmd.exe", "/C", line]);
    } else {
        cmd.args(["/C", line]);
        hide_window(&mut cmd);
    }
    cmd
}

#[cfg(not(windows))]
fn shell_command(line: &str, _new_console: bool) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn script_command(path: &Path, args: &str, new_console: bool) -> Command {
    let mut cmd = Command::new("cmd.exe");
    if new_console {
        cmd.args(["/C", "start", "", "cmd.exe", "/C", "call"]);
    } else {
        cmd.args(["/C", "call"]);
        hide_window(&mut cmd);
    }
    cmd.arg(path).args(args.split_whitespace());
    cmd
}

#[cfg(not(windows))]
fn script_command(path: &Path, args: &str, _new_console: bool) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg(path).args(args.split_whitespace());
    cmd
}

#[cfg(windows)]
fn hide_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_window(_cmd: &mut Command) {}
