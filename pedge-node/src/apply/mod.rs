//! Appliers: the only code that knows how to read and mutate host state.
//!
//! One applier per resource kind. An applier has no notion of reconcile
//! mode or where desired state came from; it is told whether to dry-run
//! and reports what it found and did.

pub mod file;
pub mod firewall;
pub mod package;
pub mod service;
pub mod sysctl;

pub use file::{FileApplier, FileStatus};
pub use firewall::{FirewallApplier, FirewallStatus};
pub use package::{PackageApplier, PackageManager};
pub use service::{ServiceApplier, ServiceStatus};
pub use sysctl::{SysctlApplier, SysctlParam};

use async_trait::async_trait;

use crate::error::ApplyError;

/// Outcome of one [`Applier::apply`] call.
///
/// `changed` is true when drift was found, whether or not it was closed
/// (dry-run reports the actions it would have taken). When `error` is set
/// the host is in an unknown state; `actions` lists only the steps planned
/// up to the failure.
#[derive(Debug, Default)]
pub struct ApplyResult {
    pub changed: bool,
    pub actions: Vec<String>,
    pub error: Option<ApplyError>,
}

impl ApplyResult {
    pub fn failed(error: ApplyError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub(crate) fn plan(&mut self, action: impl Into<String>) {
        self.changed = true;
        self.actions.push(action.into());
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Read and converge one kind of resource.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Desired spec for one resource.
    type Spec: Sync;
    /// Identity used to look the resource up.
    type Key: ?Sized + Sync;
    /// Live state as read from the host.
    type Observed;

    /// Read live state. Never mutates.
    async fn check(&self, key: &Self::Key) -> Result<Self::Observed, ApplyError>;

    /// Diff live against desired and, unless `dry_run`, close the gap.
    /// Calling this twice in a row with the same spec must report
    /// `changed == false` the second time.
    async fn apply(&self, spec: &Self::Spec, dry_run: bool) -> ApplyResult;
}
