//! Package enforcer.

use std::sync::Arc;

use pedge_state::PackageConfig;

use super::{ReconcileMode, ReconcileResult, outcome};
use crate::apply::{Applier, PackageApplier};
use crate::error::ApplyError;
use crate::host::CommandRunner;

pub struct PackageEnforcer {
    applier: PackageApplier,
}

impl PackageEnforcer {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            applier: PackageApplier::new(runner),
        }
    }

    pub async fn reconcile(&self, pkg: &PackageConfig, mode: ReconcileMode) -> ReconcileResult {
        let applied = self
            .applier
            .apply(pkg, mode != ReconcileMode::Enforce)
            .await;
        outcome("package", pkg.name.clone(), mode, applied, " + ")
    }

    /// Installed version, if any.
    pub async fn check(&self, name: &str) -> Result<Option<String>, ApplyError> {
        self.applier.check(name).await
    }
}

#[cfg(test)]
mod tests {
    use pedge_state::PackageState;

    use super::*;
    use crate::test_util::FakeHost;

    #[tokio::test]
    async fn absent_package_already_missing_is_compliant() {
        let host = FakeHost::new().with_apt();
        let enforcer = PackageEnforcer::new(host.runner());
        let pkg = PackageConfig {
            name: "telnet".into(),
            state: PackageState::Absent,
            version: None,
        };

        let result = enforcer.reconcile(&pkg, ReconcileMode::Enforce).await;
        assert!(result.was_compliant);
        assert_eq!(enforcer.check("telnet").await.unwrap(), None);
    }
}
