//! systemd unit run-state and boot enablement.

use std::sync::Arc;

use async_trait::async_trait;
use pedge_state::{ServiceConfig, ServiceState};

use super::{Applier, ApplyResult};
use crate::error::ApplyError;
use crate::host::{CommandRunner, display_command, run_checked};

/// Live state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub active: bool,
    pub enabled: bool,
}

pub struct ServiceApplier {
    runner: Arc<dyn CommandRunner>,
}

impl ServiceApplier {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn is_active(&self, name: &str) -> Result<bool, ApplyError> {
        let out = self.runner.run("systemctl", &["is-active", name]).await?;
        match out.code {
            0 => Ok(out.stdout.trim() == "active"),
            // inactive, failed or unknown unit
            3 => Ok(false),
            code => Err(ApplyError::CommandFailed {
                command: display_command("systemctl", &["is-active", name]),
                code,
                output: out.message(),
            }),
        }
    }

    async fn is_enabled(&self, name: &str) -> Result<bool, ApplyError> {
        let out = self.runner.run("systemctl", &["is-enabled", name]).await?;
        match out.code {
            0 => Ok(out.stdout.trim() == "enabled"),
            1 => Ok(false),
            code => Err(ApplyError::CommandFailed {
                command: display_command("systemctl", &["is-enabled", name]),
                code,
                output: out.message(),
            }),
        }
    }
}

/// Verbs needed to move `current` to `desired`, run-state first.
fn plan(current: ServiceStatus, desired: &ServiceConfig) -> Vec<&'static str> {
    let mut verbs = Vec::with_capacity(2);
    match desired.state {
        ServiceState::Running if !current.active => verbs.push("start"),
        ServiceState::Stopped if current.active => verbs.push("stop"),
        _ => {}
    }
    if desired.enabled && !current.enabled {
        verbs.push("enable");
    } else if !desired.enabled && current.enabled {
        verbs.push("disable");
    }
    verbs
}

#[async_trait]
impl Applier for ServiceApplier {
    type Spec = ServiceConfig;
    type Key = str;
    type Observed = ServiceStatus;

    async fn check(&self, name: &str) -> Result<ServiceStatus, ApplyError> {
        Ok(ServiceStatus {
            active: self.is_active(name).await?,
            enabled: self.is_enabled(name).await?,
        })
    }

    async fn apply(&self, spec: &ServiceConfig, dry_run: bool) -> ApplyResult {
        let current = match self.check(&spec.name).await {
            Ok(status) => status,
            Err(e) => return ApplyResult::failed(e),
        };

        let mut result = ApplyResult::default();
        for verb in plan(current, spec) {
            result.plan(format!("systemctl {} {}", verb, spec.name));
            if dry_run {
                continue;
            }
            if let Err(e) = run_checked(self.runner.as_ref(), "systemctl", &[verb, &spec.name]).await
            {
                result.error = Some(e);
                break;
            }
        }
        result
    }
}
