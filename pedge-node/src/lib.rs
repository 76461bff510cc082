//! pedge-node: power-edge node agent.
//!
//! Keeps a host converged on its desired-state document:
//! - Appliers read and mutate services, sysctl, firewall, packages and files
//! - Enforcers gate mutation on the reconcile mode
//! - The reconciler walks a state snapshot through every enforcer
//! - Event watchers and a periodic scheduler decide when to reconcile
//! - A local HTTP surface exposes metrics, health and live status

pub mod apply;
pub mod error;
pub mod host;
pub mod metrics;
pub mod reconciler;
pub mod rest;
pub mod scheduler;
pub mod shutdown;
pub mod source;
pub mod watcher;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use error::ApplyError;
pub use host::{CommandOutput, CommandRunner, SystemRunner};
pub use reconciler::{ReconcileMode, ReconcileResult, Reconciler};
pub use source::StateHandle;
