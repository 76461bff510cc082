//! Kernel parameters via `sysctl`.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Applier, ApplyResult};
use crate::error::ApplyError;
use crate::host::{CommandRunner, run_checked};

/// One desired `key = value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysctlParam {
    pub key: String,
    pub value: String,
}

impl SysctlParam {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

pub struct SysctlApplier {
    runner: Arc<dyn CommandRunner>,
}

impl SysctlApplier {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Alias for [`Applier::check`].
    pub async fn get(&self, key: &str) -> Result<String, ApplyError> {
        self.check(key).await
    }
}

/// sysctl prints multi-value parameters tab separated; desired values are
/// usually written with spaces.
pub(crate) fn normalize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Applier for SysctlApplier {
    type Spec = SysctlParam;
    type Key = str;
    type Observed = String;

    async fn check(&self, key: &str) -> Result<String, ApplyError> {
        let out = run_checked(self.runner.as_ref(), "sysctl", &["-n", key]).await?;
        Ok(out.stdout.trim().to_string())
    }

    async fn apply(&self, spec: &SysctlParam, dry_run: bool) -> ApplyResult {
        let current = match self.check(&spec.key).await {
            Ok(v) => v,
            Err(e) => return ApplyResult::failed(e),
        };

        let mut result = ApplyResult::default();
        if normalize(&current) == normalize(&spec.value) {
            return result;
        }

        let assignment = format!("{}={}", spec.key, spec.value);
        result.plan(format!("sysctl -w {assignment}"));
        if !dry_run {
            if let Err(e) = run_checked(self.runner.as_ref(), "sysctl", &["-w", &assignment]).await {
                result.error = Some(e);
            }
        }
        result
    }
}
