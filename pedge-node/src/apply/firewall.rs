//! Host firewall via ufw.
//!
//! Rules are only ever added. A rule present on the host but absent from
//! the desired document is left alone.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use pedge_state::FirewallConfig;

use super::{Applier, ApplyResult};
use crate::error::ApplyError;
use crate::host::{CommandRunner, run_checked};

/// Live ufw state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallStatus {
    pub active: bool,
    /// User rules in `allow ...` form, as listed by `ufw show added`.
    pub rules: Vec<String>,
}

pub struct FirewallApplier {
    runner: Arc<dyn CommandRunner>,
}

impl FirewallApplier {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn ufw(&self, args: &[&str]) -> Result<String, ApplyError> {
        Ok(run_checked(self.runner.as_ref(), "ufw", args).await?.stdout)
    }
}

fn parse_active(status: &str) -> bool {
    status
        .lines()
        .any(|l| l.trim().eq_ignore_ascii_case("status: active"))
}

fn parse_added(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|l| l.trim().strip_prefix("ufw "))
        .map(|r| r.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

/// Rules the document wants, named services first, in `allow ...` form.
fn desired_rules(fw: &FirewallConfig) -> Vec<String> {
    fw.allowed_services
        .iter()
        .map(|svc| format!("allow {svc}"))
        .chain(fw.rules.iter().map(|r| r.ufw_form()))
        .collect()
}

#[async_trait]
impl Applier for FirewallApplier {
    type Spec = FirewallConfig;
    type Key = ();
    type Observed = FirewallStatus;

    async fn check(&self, _: &()) -> Result<FirewallStatus, ApplyError> {
        if !self.runner.has_program("ufw") {
            return Err(ApplyError::ToolMissing("ufw".into()));
        }
        let active = parse_active(&self.ufw(&["status"]).await?);
        let rules = parse_added(&self.ufw(&["show", "added"]).await?);
        Ok(FirewallStatus { active, rules })
    }

    async fn apply(&self, spec: &FirewallConfig, dry_run: bool) -> ApplyResult {
        let current = match self.check(&()).await {
            Ok(status) => status,
            Err(e) => return ApplyResult::failed(e),
        };

        let mut result = ApplyResult::default();
        let toggle: Option<&[&str]> = match (spec.enabled, current.active) {
            (true, false) => Some(&["--force", "enable"][..]),
            (false, true) => Some(&["disable"][..]),
            _ => None,
        };
        if let Some(args) = toggle {
            result.plan(format!("ufw {}", args.join(" ")));
            if !dry_run {
                if let Err(e) = self.ufw(args).await {
                    result.error = Some(e);
                    return result;
                }
            }
        }

        if !spec.enabled {
            return result;
        }

        let present: HashSet<&str> = current.rules.iter().map(String::as_str).collect();
        for rule in desired_rules(spec) {
            if present.contains(rule.as_str()) {
                continue;
            }
            result.plan(format!("ufw {rule}"));
            if dry_run {
                continue;
            }
            let args: Vec<&str> = rule.split_whitespace().collect();
            if let Err(e) = self.ufw(&args).await {
                result.error = Some(e);
                break;
            }
        }
        result
    }
}
