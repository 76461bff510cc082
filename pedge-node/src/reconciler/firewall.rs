//! Firewall enforcer. There is a single firewall resource named `ufw`.

use std::sync::Arc;

use pedge_state::FirewallConfig;

use super::{ReconcileMode, ReconcileResult, outcome};
use crate::apply::{Applier, FirewallApplier, FirewallStatus};
use crate::error::ApplyError;
use crate::host::CommandRunner;

pub struct FirewallEnforcer {
    applier: FirewallApplier,
}

impl FirewallEnforcer {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            applier: FirewallApplier::new(runner),
        }
    }

    pub async fn reconcile(&self, fw: &FirewallConfig, mode: ReconcileMode) -> ReconcileResult {
        let applied = self
            .applier
            .apply(fw, mode != ReconcileMode::Enforce)
            .await;
        outcome("firewall", "ufw".to_string(), mode, applied, "; ")
    }

    pub async fn check(&self) -> Result<FirewallStatus, ApplyError> {
        self.applier.check(&()).await
    }
}
