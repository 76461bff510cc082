//! End-to-end reconciliation against a scripted host.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use pedge_node::reconciler::{ReconcileMode, ReconcileResult, Reconciler};
use pedge_node::shutdown::{self, Shutdown};
use pedge_node::source::StateHandle;
use pedge_node::test_util::FakeHost;
use pedge_node::watcher::{Event, EventReconciler, EventSender, EventWatcher, Listener};
use pedge_state::{State, WatcherConfig};

fn state(yaml: &str) -> State {
    State::from_yaml(yaml).unwrap()
}

const MIXED: &str = r#"
version: v1
services:
  - {name: nginx, state: running, enabled: true}
  - {name: cups, state: stopped, enabled: false}
sysctl:
  vm.swappiness: "10"
  net.ipv4.ip_forward: "1"
firewall:
  enabled: true
  allowed_services: [ssh]
  rules:
    - {port: "443", protocol: tcp}
"#;

fn drifted_host() -> FakeHost {
    FakeHost::new()
        .with_service("nginx", false, false)
        .with_service("cups", true, true)
        .with_sysctl("vm.swappiness", "60")
        .with_sysctl("net.ipv4.ip_forward", "0")
        .with_ufw(false, &[])
}

#[tokio::test]
async fn enforce_converges_and_second_pass_is_compliant() {
    let host = drifted_host();
    let reconciler = Reconciler::new(host.runner(), ReconcileMode::Enforce);
    let desired = state(MIXED);

    let first = reconciler.reconcile_all(&desired).await;
    assert_eq!(first.len(), 5);
    assert!(first.iter().all(|r| !r.is_failed()));
    assert!(first.iter().all(|r| !r.was_compliant));

    host.clear_calls();
    let second = reconciler.reconcile_all(&desired).await;
    assert_eq!(second.len(), 5);
    assert!(
        second.iter().all(|r| r.was_compliant),
        "second pass not compliant: {second:?}"
    );
    assert!(host.mutations().is_empty());
}

#[tokio::test]
async fn dry_run_reports_drift_without_touching_the_host() {
    let host = drifted_host();
    let reconciler = Reconciler::new(host.runner(), ReconcileMode::DryRun);

    let results = reconciler.reconcile_all(&state(MIXED)).await;
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.dry_run && !r.was_compliant));
    assert!(host.mutations().is_empty());
    assert_eq!(host.service("nginx"), Some((false, false)));
    assert_eq!(host.sysctl("vm.swappiness").as_deref(), Some("60"));
}

#[tokio::test]
async fn disabled_mode_does_nothing() {
    let host = drifted_host();
    let reconciler = Reconciler::new(host.runner(), ReconcileMode::Disabled);

    let results = reconciler.reconcile_all(&state(MIXED)).await;
    assert!(results.is_empty());
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn one_failure_does_not_stop_the_pass() {
    let host = FakeHost::new()
        .with_service("nginx", false, true)
        .with_sysctl("vm.swappiness", "60");
    let reconciler = Reconciler::new(host.runner(), ReconcileMode::Enforce);
    let desired = state(
        r#"
version: v1
services:
  - {name: ghost, state: running, enabled: false}
  - {name: nginx, state: running, enabled: true}
sysctl:
  vm.swappiness: "10"
"#,
    );

    let results = reconciler.reconcile_all(&desired).await;
    assert_eq!(results.len(), desired.resource_count());
    assert!(results[0].is_failed());
    assert_eq!(results[0].resource_name, "ghost");
    assert!(!results[1].is_failed());
    assert_eq!(host.service("nginx"), Some((true, true)));
    assert_eq!(host.sysctl("vm.swappiness").as_deref(), Some("10"));
}

#[tokio::test]
async fn kinds_run_in_fixed_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motd");
    let host = drifted_host()
        .with_apt()
        .with_package("curl", "7.88.1-10", None);
    let reconciler = Reconciler::new(host.runner(), ReconcileMode::DryRun);
    let desired = state(&format!(
        "{MIXED}packages:\n  - {{name: curl, state: present}}\nfiles:\n  - {{path: {}, content: hi}}\n",
        path.display()
    ));

    let kinds: Vec<&str> = reconciler
        .reconcile_all(&desired)
        .await
        .iter()
        .map(|r| r.resource_type)
        .collect();
    assert_eq!(
        kinds,
        vec!["service", "service", "sysctl", "sysctl", "firewall", "package", "file"]
    );
}

#[tokio::test]
async fn stopped_service_is_started_and_enabled() {
    let host = FakeHost::new().with_service("nginx", false, false);
    let reconciler = Reconciler::new(host.runner(), ReconcileMode::Enforce);
    let desired = state("version: v1\nservices:\n  - {name: nginx, state: running, enabled: true}\n");

    let results = reconciler.reconcile_all(&desired).await;
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].action,
        "systemctl start nginx + systemctl enable nginx"
    );
    assert_eq!(host.service("nginx"), Some((true, true)));

    let again = reconciler.reconcile_all(&desired).await;
    assert!(again[0].was_compliant);
    assert_eq!(again[0].action, "compliant");
}

#[tokio::test]
async fn sysctl_value_is_written() {
    let host = FakeHost::new().with_sysctl("vm.swappiness", "60");
    let reconciler = Reconciler::new(host.runner(), ReconcileMode::Enforce);
    let desired = state("version: v1\nsysctl:\n  vm.swappiness: \"10\"\n");

    let results = reconciler.reconcile_all(&desired).await;
    assert_eq!(results[0].action, "sysctl -w vm.swappiness=10");
    assert_eq!(host.sysctl("vm.swappiness").as_deref(), Some("10"));
}

#[tokio::test]
async fn missing_file_is_created_with_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.txt");
    let reconciler = Reconciler::new(FakeHost::new().runner(), ReconcileMode::Enforce);
    let desired = state(&format!(
        "version: v1\nfiles:\n  - {{path: {}, content: hello, mode: \"0644\"}}\n",
        path.display()
    ));

    let results = reconciler.reconcile_all(&desired).await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_failed(), "{:?}", results[0].error);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o644);

    let again = reconciler.reconcile_all(&desired).await;
    assert!(again[0].was_compliant);
}

#[tokio::test]
async fn mode_change_lands_on_the_next_pass() {
    let host = FakeHost::new().with_service("nginx", false, true);
    let reconciler = Reconciler::new(host.runner(), ReconcileMode::DryRun);
    let desired = state("version: v1\nservices:\n  - {name: nginx, state: running, enabled: true}\n");

    reconciler.reconcile_all(&desired).await;
    assert!(host.mutations().is_empty());

    reconciler.set_mode(ReconcileMode::Enforce);
    reconciler.reconcile_all(&desired).await;
    assert_eq!(host.mutations(), vec!["systemctl start nginx"]);
}

#[tokio::test]
async fn event_pass_matches_a_full_pass() {
    let desired = state(MIXED);
    let by_event = drifted_host();
    let by_schedule = drifted_host();

    let from_event = Reconciler::new(by_event.runner(), ReconcileMode::Enforce)
        .reconcile_event("file_modified", "/etc/nginx/nginx.conf", &desired)
        .await;
    let from_pass = Reconciler::new(by_schedule.runner(), ReconcileMode::Enforce)
        .reconcile_all(&desired)
        .await;

    let summarize = |results: &[ReconcileResult]| {
        results
            .iter()
            .map(|r| {
                (
                    r.resource_type,
                    r.resource_name.clone(),
                    r.action.clone(),
                    r.was_compliant,
                    r.is_failed(),
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(from_event.len(), desired.resource_count());
    assert_eq!(summarize(&from_event), summarize(&from_pass));
    assert_eq!(by_event.mutations(), by_schedule.mutations());
    assert_eq!(by_event.service("nginx"), Some((true, true)));
    assert_eq!(by_event.sysctl("vm.swappiness").as_deref(), Some("10"));
}

#[derive(Default)]
struct Counting(AtomicUsize);

#[async_trait]
impl EventReconciler for Counting {
    async fn reconcile_event(&self, _: &str, _: &str, _: &State) -> Vec<ReconcileResult> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Vec::new()
    }
}

/// Emits a fixed list of events, then idles until shutdown.
struct Scripted(Vec<Event>);

#[async_trait]
impl Listener for Scripted {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(self: Box<Self>, mut events: EventSender, mut shutdown: Shutdown) -> Result<()> {
        for event in self.0 {
            if !events.send(event).await {
                return Ok(());
            }
        }
        shutdown.wait().await;
        Ok(())
    }
}

#[tokio::test]
async fn file_event_triggers_exactly_one_reconciliation() {
    let counter = Arc::new(Counting::default());
    let watcher = EventWatcher::new(
        WatcherConfig::from_yaml("watchers:\n  enabled: true\n").unwrap(),
        counter.clone(),
        StateHandle::new(state("version: v1\n")),
    );
    let (trigger, shutdown) = shutdown::channel();

    let handle = watcher.start_with(
        vec![Box::new(Scripted(vec![
            Event::service_log("journald", "nginx.service"),
            Event::command_executed("auditd", "vim"),
            Event::file_modified("inotify", Path::new("/etc/nginx/nginx.conf")),
        ]))],
        shutdown,
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while counter.0.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // let any stray dispatch land before counting
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);

    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(2), handle.join())
        .await
        .unwrap();
}
