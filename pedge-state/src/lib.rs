//! pedge-state: desired-state documents for power-edge nodes.
//!
//! This crate owns everything a node agent reads before it touches the OS:
//! - The desired-state document (services, sysctl, firewall, packages, files)
//! - The watcher configuration document
//! - A typed client for the remote control plane that stores state documents

pub mod client;
pub mod error;
pub mod state;
pub mod watchers;

pub use client::{ControlPlaneClient, NodeList};
pub use error::{ControlPlaneError, StateError};
pub use state::{
    FileConfig, FirewallConfig, FirewallRule, Metadata, PackageConfig, PackageState, Protocol,
    ServiceConfig, ServiceState, State, parse_mode, sha256_hex,
};
pub use watchers::{AuditdConfig, DbusConfig, InotifyConfig, JournaldConfig, WatcherConfig, Watchers};
