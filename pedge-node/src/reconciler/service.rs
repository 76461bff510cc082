//! Service enforcer.

use std::sync::Arc;

use pedge_state::ServiceConfig;

use super::{ReconcileMode, ReconcileResult, outcome};
use crate::apply::{Applier, ServiceApplier, ServiceStatus};
use crate::error::ApplyError;
use crate::host::CommandRunner;

pub struct ServiceEnforcer {
    applier: ServiceApplier,
}

impl ServiceEnforcer {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            applier: ServiceApplier::new(runner),
        }
    }

    pub async fn reconcile(&self, svc: &ServiceConfig, mode: ReconcileMode) -> ReconcileResult {
        let applied = self
            .applier
            .apply(svc, mode != ReconcileMode::Enforce)
            .await;
        outcome("service", svc.name.clone(), mode, applied, " + ")
    }

    pub async fn check(&self, name: &str) -> Result<ServiceStatus, ApplyError> {
        self.applier.check(name).await
    }
}

#[cfg(test)]
mod tests {
    use pedge_state::ServiceState;

    use super::*;
    use crate::test_util::FakeHost;

    fn nginx() -> ServiceConfig {
        ServiceConfig {
            name: "nginx".into(),
            state: ServiceState::Running,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn dry_run_reports_start_and_enable() {
        let host = FakeHost::new().with_service("nginx", false, false);
        let enforcer = ServiceEnforcer::new(host.runner());

        let result = enforcer.reconcile(&nginx(), ReconcileMode::DryRun).await;
        assert_eq!(result.resource_type, "service");
        assert_eq!(result.resource_name, "nginx");
        assert!(!result.was_compliant);
        assert!(result.dry_run);
        assert!(result.action.contains("start"));
        assert!(result.action.contains("enable"));
        assert!(host.mutations().is_empty());
    }

    #[tokio::test]
    async fn enforce_converges_then_reports_compliant() {
        let host = FakeHost::new().with_service("nginx", false, false);
        let enforcer = ServiceEnforcer::new(host.runner());

        let first = enforcer.reconcile(&nginx(), ReconcileMode::Enforce).await;
        assert!(!first.was_compliant);
        assert!(!first.dry_run);
        assert_eq!(host.service("nginx"), Some((true, true)));

        let second = enforcer.reconcile(&nginx(), ReconcileMode::Enforce).await;
        assert!(second.was_compliant);
        assert_eq!(second.action, "compliant");
    }
}
