//! Enforcers and the reconciler that drives them.
//!
//! An enforcer decides *whether* to mutate (from the current mode) and turns
//! the applier's outcome into a [`ReconcileResult`]. The [`Reconciler`] walks
//! a whole state snapshot through the enforcers in a fixed kind order.

mod file;
mod firewall;
mod mode;
mod package;
mod service;
mod sysctl;

pub use file::FileEnforcer;
pub use firewall::FirewallEnforcer;
pub use mode::{ModeCell, ReconcileMode};
pub use package::PackageEnforcer;
pub use service::ServiceEnforcer;
pub use sysctl::SysctlEnforcer;

use std::collections::HashMap;
use std::sync::Arc;

use pedge_state::{FileConfig, FirewallConfig, PackageConfig, ServiceConfig, State};
use tokio::sync::Mutex;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::apply::ApplyResult;
use crate::error::ApplyError;
use crate::host::CommandRunner;

/// Outcome of reconciling one resource.
#[derive(Debug)]
pub struct ReconcileResult {
    pub resource_type: &'static str,
    pub resource_name: String,
    pub was_compliant: bool,
    /// `compliant`, or the actions taken / planned.
    pub action: String,
    pub error: Option<ApplyError>,
    pub dry_run: bool,
}

impl ReconcileResult {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Fold an applier outcome into a result and log it.
pub(crate) fn outcome(
    resource_type: &'static str,
    resource_name: String,
    mode: ReconcileMode,
    applied: ApplyResult,
    separator: &str,
) -> ReconcileResult {
    let dry_run = mode != ReconcileMode::Enforce;
    let ApplyResult {
        changed,
        actions,
        error,
    } = applied;

    let action = if changed {
        actions.join(separator)
    } else if error.is_some() {
        "failed".to_string()
    } else {
        "compliant".to_string()
    };

    match &error {
        Some(e) => error!(
            resource_type,
            resource = %resource_name,
            "Reconcile failed: {}", e
        ),
        None if !changed => info!(resource_type, resource = %resource_name, "Compliant"),
        None if dry_run => info!(
            resource_type,
            resource = %resource_name,
            "[dry-run] would execute: {}", action
        ),
        None => info!(
            resource_type,
            resource = %resource_name,
            "Executed: {}", action
        ),
    }

    ReconcileResult {
        resource_type,
        resource_name,
        was_compliant: !changed && error.is_none(),
        action,
        error,
        dry_run,
    }
}

/// Counts logged at the end of a pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub compliant: usize,
    pub changed: usize,
    pub failed: usize,
}

impl PassSummary {
    pub fn of(results: &[ReconcileResult]) -> Self {
        results.iter().fold(Self::default(), |mut s, r| {
            if r.is_failed() {
                s.failed += 1;
            } else if r.was_compliant {
                s.compliant += 1;
            } else {
                s.changed += 1;
            }
            s
        })
    }
}

/// Drives every enforcer over a state snapshot.
pub struct Reconciler {
    mode: ModeCell,
    runner: Arc<dyn CommandRunner>,
    services: ServiceEnforcer,
    sysctl: SysctlEnforcer,
    firewall: FirewallEnforcer,
    packages: PackageEnforcer,
    files: FileEnforcer,
    /// Held for the duration of a pass when passes are serialized.
    pass_lock: Option<Mutex<()>>,
}

impl Reconciler {
    pub fn new(runner: Arc<dyn CommandRunner>, mode: ReconcileMode) -> Self {
        Self {
            mode: ModeCell::new(mode),
            services: ServiceEnforcer::new(runner.clone()),
            sysctl: SysctlEnforcer::new(runner.clone()),
            firewall: FirewallEnforcer::new(runner.clone()),
            packages: PackageEnforcer::new(runner.clone()),
            files: FileEnforcer::new(),
            runner,
            pass_lock: None,
        }
    }

    /// Never let two passes overlap.
    pub fn with_serialized_passes(mut self) -> Self {
        self.pass_lock = Some(Mutex::new(()));
        self
    }

    pub fn mode(&self) -> ReconcileMode {
        self.mode.get()
    }

    pub fn set_mode(&self, mode: ReconcileMode) {
        let previous = self.mode.set(mode);
        if previous != mode {
            info!("Reconcile mode changed: {} -> {}", previous, mode);
        }
    }

    /// Reconcile every resource in `state`.
    ///
    /// Returns nothing under [`ReconcileMode::Disabled`]. Otherwise returns
    /// one result per resource, failures included, in kind order services,
    /// sysctl, firewall, packages, files.
    pub async fn reconcile_all(&self, state: &State) -> Vec<ReconcileResult> {
        let mode = self.mode();
        if mode == ReconcileMode::Disabled {
            return Vec::new();
        }

        let _guard = match &self.pass_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let span = info_span!("reconcile", pass = %Uuid::new_v4());
        async {
            info!(
                mode = %mode,
                version = %state.version,
                resources = state.resource_count(),
                "Starting reconciliation pass"
            );

            let mut results = Vec::with_capacity(state.resource_count());
            results.extend(self.reconcile_services(&state.services).await);
            results.extend(self.reconcile_sysctl(&state.sysctl).await);
            if state.firewall.is_configured() {
                results.extend(self.reconcile_firewall(&state.firewall).await);
            }
            if !state.packages.is_empty() {
                results.extend(self.reconcile_packages(&state.packages).await);
            }
            if !state.files.is_empty() {
                results.extend(self.reconcile_files(&state.files).await);
            }

            let summary = PassSummary::of(&results);
            info!(
                compliant = summary.compliant,
                changed = summary.changed,
                failed = summary.failed,
                "Reconciliation pass complete"
            );
            results
        }
        .instrument(span)
        .await
    }

    pub async fn reconcile_services(&self, services: &[ServiceConfig]) -> Vec<ReconcileResult> {
        let mut results = Vec::with_capacity(services.len());
        for svc in services {
            results.push(self.services.reconcile(svc, self.mode()).await);
        }
        results
    }

    /// Key order is unspecified.
    pub async fn reconcile_sysctl(&self, params: &HashMap<String, String>) -> Vec<ReconcileResult> {
        let mut results = Vec::with_capacity(params.len());
        for (key, value) in params {
            results.push(self.sysctl.reconcile(key, value, self.mode()).await);
        }
        results
    }

    pub async fn reconcile_firewall(&self, firewall: &FirewallConfig) -> Option<ReconcileResult> {
        if !firewall.is_configured() {
            return None;
        }
        Some(self.firewall.reconcile(firewall, self.mode()).await)
    }

    pub async fn reconcile_packages(&self, packages: &[PackageConfig]) -> Vec<ReconcileResult> {
        let mut results = Vec::with_capacity(packages.len());
        for pkg in packages {
            results.push(self.packages.reconcile(pkg, self.mode()).await);
        }
        results
    }

    pub async fn reconcile_files(&self, files: &[FileConfig]) -> Vec<ReconcileResult> {
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            results.push(self.files.reconcile(file, self.mode()).await);
        }
        results
    }

    /// Event-triggered entry point. Always runs a full pass; the event only
    /// shows up in the log.
    pub async fn reconcile_event(
        &self,
        event_type: &str,
        resource: &str,
        state: &State,
    ) -> Vec<ReconcileResult> {
        info!(event_type, resource, "Event-triggered reconciliation");
        self.reconcile_all(state).await
    }

    /// Fail when the host lacks the tools every pass depends on.
    pub fn health_check(&self) -> Result<(), ApplyError> {
        for tool in ["systemctl", "sysctl"] {
            if !self.runner.has_program(tool) {
                return Err(ApplyError::ToolMissing(tool.to_string()));
            }
        }
        Ok(())
    }
}
