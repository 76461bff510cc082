//! Host command seam.
//!
//! Every applier that shells out goes through [`CommandRunner`], so the
//! same code drives the real host and the scripted host used in tests.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use crate::error::ApplyError;

/// Exit code and captured output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when the process was killed by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn exit(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            code,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Stderr if there is any, stdout otherwise.
    pub fn message(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion. Only a spawn failure is an `Err`;
    /// non-zero exits are reported through [`CommandOutput::code`].
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ApplyError>;

    /// Whether `name` resolves on PATH.
    fn has_program(&self, name: &str) -> bool;
}

/// Run a command and turn a non-zero exit into [`ApplyError::CommandFailed`].
pub async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> Result<CommandOutput, ApplyError> {
    let out = runner.run(program, args).await?;
    if out.success() {
        Ok(out)
    } else {
        Err(ApplyError::CommandFailed {
            command: display_command(program, args),
            code: out.code,
            output: out.message(),
        })
    }
}

pub fn display_command(program: &str, args: &[&str]) -> String {
    let mut s = program.to_string();
    for arg in args {
        s.push(' ');
        s.push_str(arg);
    }
    s
}

/// Runs commands on the local host via `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ApplyError> {
        trace!("exec {}", display_command(program, args));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| ApplyError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn has_program(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }
}

/// Static facts about the host, reported on `/status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub uptime_secs: u64,
}

impl HostInfo {
    pub fn gather() -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::fs::read_to_string("/etc/os-release")
                .ok()
                .and_then(|s| os_pretty_name(&s))
                .unwrap_or_else(|| std::env::consts::OS.to_string()),
            kernel: read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default(),
            uptime_secs: read_trimmed("/proc/uptime")
                .and_then(|s| parse_uptime(&s))
                .unwrap_or(0),
        }
    }
}

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn os_pretty_name(os_release: &str) -> Option<String> {
    os_release.lines().find_map(|line| {
        line.strip_prefix("PRETTY_NAME=")
            .map(|v| v.trim_matches('"').to_string())
    })
}

fn parse_uptime(raw: &str) -> Option<u64> {
    let secs: f64 = raw.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}
