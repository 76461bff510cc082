//! Sysctl enforcer.

use std::sync::Arc;

use super::{ReconcileMode, ReconcileResult, outcome};
use crate::apply::{Applier, SysctlApplier, SysctlParam};
use crate::error::ApplyError;
use crate::host::CommandRunner;

pub struct SysctlEnforcer {
    applier: SysctlApplier,
}

impl SysctlEnforcer {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            applier: SysctlApplier::new(runner),
        }
    }

    pub async fn reconcile(&self, key: &str, value: &str, mode: ReconcileMode) -> ReconcileResult {
        let param = SysctlParam::new(key, value);
        let applied = self
            .applier
            .apply(&param, mode != ReconcileMode::Enforce)
            .await;
        outcome("sysctl", param.key, mode, applied, " + ")
    }

    pub async fn check(&self, key: &str) -> Result<String, ApplyError> {
        self.applier.check(key).await
    }
}
