//! OS packages via the first package manager found on PATH.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pedge_state::{PackageConfig, PackageState};

use super::{Applier, ApplyResult};
use crate::error::ApplyError;
use crate::host::{CommandRunner, display_command, run_checked};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
}

impl PackageManager {
    /// Detection order.
    const ALL: [PackageManager; 3] = [PackageManager::Apt, PackageManager::Dnf, PackageManager::Yum];

    /// Binary whose presence selects this manager.
    fn probe(self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
        }
    }

    /// Binary used for mutations.
    fn program(self) -> &'static str {
        match self {
            PackageManager::Apt => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
        }
    }

    fn pinned(self, name: &str, version: Option<&str>) -> String {
        match (self, version) {
            (_, None) => name.to_string(),
            (PackageManager::Apt, Some(v)) => format!("{name}={v}"),
            (_, Some(v)) => format!("{name}-{v}"),
        }
    }

    fn upgrade_args(self) -> &'static [&'static str] {
        match self {
            PackageManager::Apt => &["install", "--only-upgrade", "-y"],
            PackageManager::Dnf => &["upgrade", "-y"],
            PackageManager::Yum => &["update", "-y"],
        }
    }

    pub fn detect(runner: &dyn CommandRunner) -> Option<Self> {
        Self::ALL.into_iter().find(|m| runner.has_program(m.probe()))
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.probe())
    }
}

pub struct PackageApplier {
    runner: Arc<dyn CommandRunner>,
}

impl PackageApplier {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn manager(&self) -> Result<PackageManager, ApplyError> {
        PackageManager::detect(self.runner.as_ref()).ok_or(ApplyError::NoPackageManager)
    }

    async fn installed_version(
        &self,
        pm: PackageManager,
        name: &str,
    ) -> Result<Option<String>, ApplyError> {
        match pm {
            PackageManager::Apt => {
                let out = self
                    .runner
                    .run("dpkg-query", &["-W", "-f=${Status} ${Version}", name])
                    .await?;
                if !out.success() {
                    return Ok(None);
                }
                Ok(parse_dpkg_status(&out.stdout))
            }
            PackageManager::Dnf | PackageManager::Yum => {
                let out = self
                    .runner
                    .run("rpm", &["-q", "--qf", "%{VERSION}-%{RELEASE}", name])
                    .await?;
                if !out.success() {
                    return Ok(None);
                }
                Ok(Some(out.stdout.trim().to_string()).filter(|v| !v.is_empty()))
            }
        }
    }

    async fn upgrade_available(&self, pm: PackageManager, name: &str) -> Result<bool, ApplyError> {
        match pm {
            PackageManager::Apt => {
                let out = run_checked(self.runner.as_ref(), "apt-cache", &["policy", name]).await?;
                Ok(parse_apt_policy(&out.stdout)
                    .map(|(installed, candidate)| installed != candidate)
                    .unwrap_or(false))
            }
            PackageManager::Dnf | PackageManager::Yum => {
                let args = ["check-update", "-q", name];
                let out = self.runner.run(pm.program(), &args).await?;
                match out.code {
                    0 => Ok(false),
                    100 => Ok(true),
                    code => Err(ApplyError::CommandFailed {
                        command: display_command(pm.program(), &args),
                        code,
                        output: out.message(),
                    }),
                }
            }
        }
    }

    async fn execute(&self, pm: PackageManager, verb: &[&str], target: &str) -> Result<(), ApplyError> {
        let mut args = verb.to_vec();
        args.push(target);
        run_checked(self.runner.as_ref(), pm.program(), &args).await?;
        Ok(())
    }
}

/// `install ok installed 1.2.3-1` → `Some("1.2.3-1")`.
fn parse_dpkg_status(raw: &str) -> Option<String> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    match fields.as_slice() {
        [_, _, "installed", version, ..] => Some(version.to_string()),
        _ => None,
    }
}

/// Installed and candidate versions from `apt-cache policy`.
fn parse_apt_policy(raw: &str) -> Option<(String, String)> {
    let mut installed = None;
    let mut candidate = None;
    for line in raw.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("Installed:") {
            installed = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("Candidate:") {
            candidate = Some(v.trim().to_string());
        }
    }
    match (installed, candidate) {
        (Some(i), Some(c)) if i != "(none)" && c != "(none)" => Some((i, c)),
        _ => None,
    }
}

/// What has to happen to one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Install,
    Remove,
    Upgrade,
}

#[async_trait]
impl Applier for PackageApplier {
    type Spec = PackageConfig;
    type Key = str;
    /// Installed version, `None` when not installed.
    type Observed = Option<String>;

    async fn check(&self, name: &str) -> Result<Option<String>, ApplyError> {
        let pm = self.manager()?;
        self.installed_version(pm, name).await
    }

    async fn apply(&self, spec: &PackageConfig, dry_run: bool) -> ApplyResult {
        let pm = match self.manager() {
            Ok(pm) => pm,
            Err(e) => return ApplyResult::failed(e),
        };
        let installed = match self.installed_version(pm, &spec.name).await {
            Ok(v) => v,
            Err(e) => return ApplyResult::failed(e),
        };

        let step = match (spec.state, installed.as_deref()) {
            (PackageState::Present, None) => Some(Step::Install),
            (PackageState::Present, Some(current)) => spec
                .version
                .as_deref()
                .filter(|want| *want != current)
                .map(|_| Step::Install),
            (PackageState::Absent, Some(_)) => Some(Step::Remove),
            (PackageState::Absent, None) => None,
            (PackageState::Latest, None) => Some(Step::Install),
            (PackageState::Latest, Some(_)) => match self.upgrade_available(pm, &spec.name).await {
                Ok(true) => Some(Step::Upgrade),
                Ok(false) => None,
                Err(e) => return ApplyResult::failed(e),
            },
        };

        let mut result = ApplyResult::default();
        let Some(step) = step else {
            return result;
        };

        // `latest` never pins
        let version = match spec.state {
            PackageState::Latest => None,
            _ => spec.version.as_deref(),
        };
        let (verb, target): (&[&str], String) = match step {
            Step::Install => (&["install", "-y"][..], pm.pinned(&spec.name, version)),
            Step::Remove => (&["remove", "-y"][..], spec.name.clone()),
            Step::Upgrade => (pm.upgrade_args(), spec.name.clone()),
        };

        let mut shown = verb.to_vec();
        shown.push(&target);
        result.plan(display_command(pm.program(), &shown));
        if !dry_run {
            if let Err(e) = self.execute(pm, verb, &target).await {
                result.error = Some(e);
            }
        }
        result
    }
}
