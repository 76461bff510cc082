//! Compliance gauges, re-derived from live host state on every scheduler tick.
//!
//! The collector reads the host through the same appliers the reconciler
//! uses, but never mutates and never looks at reconciliation results. Both
//! paths can disagree for one interval after a mutation.

use std::sync::{Arc, Mutex, PoisonError};

use pedge_state::{ServiceState, State};
use prometheus::{
    Encoder, GaugeVec, Registry, TextEncoder, register_gauge_vec_with_registry,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::apply::sysctl::normalize;
use crate::apply::{Applier, ServiceApplier, SysctlApplier};
use crate::host::CommandRunner;

/// One row of the last compliance snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceEntry {
    pub kind: &'static str,
    pub name: String,
    pub expected: String,
    pub actual: String,
    pub compliant: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComplianceSummary {
    pub total: usize,
    pub compliant: usize,
    pub percentage: f64,
}

impl ComplianceSummary {
    pub fn of(entries: &[ComplianceEntry]) -> Self {
        let total = entries.len();
        let compliant = entries.iter().filter(|e| e.compliant).count();
        let percentage = if total == 0 {
            100.0
        } else {
            compliant as f64 * 100.0 / total as f64
        };
        Self {
            total,
            compliant,
            percentage,
        }
    }
}

pub struct Collector {
    services: ServiceApplier,
    sysctl: SysctlApplier,
    registry: Registry,
    service_compliance: GaugeVec,
    sysctl_compliance: GaugeVec,
    state_info: GaugeVec,
    last: Mutex<Vec<ComplianceEntry>>,
}

impl Collector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let service_compliance = register_gauge_vec_with_registry!(
            "pedge_service_compliance",
            "Service compliance (1 = compliant, 0 = non-compliant)",
            &["name", "expected", "actual"],
            registry
        )?;
        let sysctl_compliance = register_gauge_vec_with_registry!(
            "pedge_sysctl_compliance",
            "Sysctl parameter compliance (1 = compliant, 0 = non-compliant)",
            &["key", "expected", "actual"],
            registry
        )?;
        let state_info = register_gauge_vec_with_registry!(
            "pedge_state_info",
            "Desired state information",
            &["site", "environment"],
            registry
        )?;

        Ok(Self {
            services: ServiceApplier::new(runner.clone()),
            sysctl: SysctlApplier::new(runner),
            registry,
            service_compliance,
            sysctl_compliance,
            state_info,
            last: Mutex::new(Vec::new()),
        })
    }

    /// Re-check every service and sysctl parameter in `state` and replace
    /// all gauges. A failed check counts as non-compliant.
    pub async fn check_and_update(&self, state: &State) {
        let mut entries = Vec::with_capacity(state.services.len() + state.sysctl.len());

        for svc in &state.services {
            let (actual, compliant) = match self.services.check(&svc.name).await {
                Ok(status) => {
                    let running = if status.active {
                        ServiceState::Running
                    } else {
                        ServiceState::Stopped
                    };
                    (
                        running.as_str().to_string(),
                        running == svc.state && status.enabled == svc.enabled,
                    )
                }
                Err(e) => {
                    debug!(service = %svc.name, "Compliance check failed: {}", e);
                    ("unknown".to_string(), false)
                }
            };
            entries.push(ComplianceEntry {
                kind: "service",
                name: svc.name.clone(),
                expected: svc.state.as_str().to_string(),
                actual,
                compliant,
            });
        }

        for (key, expected) in &state.sysctl {
            let (actual, compliant) = match self.sysctl.check(key.as_str()).await {
                Ok(actual) => {
                    let compliant = normalize(&actual) == normalize(expected);
                    (actual, compliant)
                }
                Err(e) => {
                    debug!(key = %key, "Compliance check failed: {}", e);
                    (String::new(), false)
                }
            };
            entries.push(ComplianceEntry {
                kind: "sysctl",
                name: key.clone(),
                expected: expected.clone(),
                actual,
                compliant,
            });
        }

        self.publish(state, &entries);

        let summary = ComplianceSummary::of(&entries);
        info!(
            total = summary.total,
            compliant = summary.compliant,
            "Compliance check complete ({:.1}%)",
            summary.percentage
        );
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = entries;
    }

    fn publish(&self, state: &State, entries: &[ComplianceEntry]) {
        self.service_compliance.reset();
        self.sysctl_compliance.reset();
        self.state_info.reset();

        for e in entries {
            let gauge = match e.kind {
                "service" => &self.service_compliance,
                _ => &self.sysctl_compliance,
            };
            gauge
                .with_label_values(&[e.name.as_str(), e.expected.as_str(), e.actual.as_str()])
                .set(if e.compliant { 1.0 } else { 0.0 });
        }

        self.state_info
            .with_label_values(&[
                state.metadata.site.as_str(),
                state.metadata.environment.as_str(),
            ])
            .set(1.0);
    }

    /// Entries from the last completed check.
    pub fn snapshot(&self) -> Vec<ComplianceEntry> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn summary(&self) -> ComplianceSummary {
        ComplianceSummary::of(&self.snapshot())
    }

    /// Prometheus text exposition of every gauge.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeHost;

    const STATE: &str = r#"
version: v1
metadata:
  site: lab
  environment: staging
services:
  - {name: nginx, state: running, enabled: true}
  - {name: cups, state: stopped, enabled: false}
sysctl:
  vm.swappiness: "10"
"#;

    #[tokio::test]
    async fn gauges_follow_live_state() {
        let host = FakeHost::new()
            .with_service("nginx", true, true)
            .with_service("cups", true, false)
            .with_sysctl("vm.swappiness", "10");
        let collector = Collector::new(host.runner()).unwrap();
        let state = State::from_yaml(STATE).unwrap();

        collector.check_and_update(&state).await;

        let text = collector.render().unwrap();
        assert!(text.contains(
            r#"pedge_service_compliance{actual="running",expected="running",name="nginx"} 1"#
        ));
        assert!(text.contains(
            r#"pedge_service_compliance{actual="running",expected="stopped",name="cups"} 0"#
        ));
        assert!(text.contains(
            r#"pedge_sysctl_compliance{actual="10",expected="10",key="vm.swappiness"} 1"#
        ));
        assert!(text.contains(r#"pedge_state_info{environment="staging",site="lab"} 1"#));

        let summary = collector.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.compliant, 2);
    }

    #[tokio::test]
    async fn stale_labels_are_dropped() {
        let host = FakeHost::new()
            .with_service("nginx", false, true)
            .with_service("cups", false, false)
            .with_sysctl("vm.swappiness", "60");
        let collector = Collector::new(host.runner()).unwrap();
        let state = State::from_yaml(STATE).unwrap();

        collector.check_and_update(&state).await;
        assert!(collector.render().unwrap().contains(r#"actual="60""#));

        let _ = host.with_sysctl("vm.swappiness", "10");
        collector.check_and_update(&state).await;
        let text = collector.render().unwrap();
        assert!(!text.contains(r#"actual="60""#));
        assert!(text.contains(r#"actual="10""#));
    }

    #[tokio::test]
    async fn failed_checks_count_as_drift() {
        let host = FakeHost::new();
        host.remove_program("systemctl");
        let collector = Collector::new(host.runner()).unwrap();
        let state = State::from_yaml(
            "version: v1\nservices:\n  - {name: nginx, state: running}\n",
        )
        .unwrap();

        collector.check_and_update(&state).await;
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].compliant);
        assert_eq!(snapshot[0].actual, "unknown");
    }

    #[test]
    fn empty_snapshot_is_fully_compliant() {
        assert_eq!(ComplianceSummary::of(&[]).percentage, 100.0);
    }
}
