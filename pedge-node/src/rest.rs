//! Local HTTP surface: metrics, health, version and a live status view.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::host::{CommandRunner, HostInfo};
use crate::metrics::{Collector, ComplianceSummary};
use crate::reconciler::{FirewallEnforcer, Reconciler, ServiceEnforcer, SysctlEnforcer};
use crate::source::StateHandle;

/// Shared handler state.
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub collector: Arc<Collector>,
    pub state: StateHandle,
    pub watchers_enabled: bool,
    services: ServiceEnforcer,
    sysctl: SysctlEnforcer,
    firewall: FirewallEnforcer,
}

impl AppState {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        reconciler: Arc<Reconciler>,
        collector: Arc<Collector>,
        state: StateHandle,
        watchers_enabled: bool,
    ) -> Self {
        Self {
            reconciler,
            collector,
            state,
            watchers_enabled,
            services: ServiceEnforcer::new(runner.clone()),
            sysctl: SysctlEnforcer::new(runner.clone()),
            firewall: FirewallEnforcer::new(runner),
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/health", get(get_health))
        .route("/version", get(get_version))
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    pub git_commit: &'static str,
    pub build_time: &'static str,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown"),
            build_time: option_env!("BUILD_TIME").unwrap_or("unknown"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub expected_state: &'static str,
    pub expected_enabled: bool,
    /// `None` when the unit could not be queried.
    pub active: Option<bool>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SysctlSnapshot {
    pub key: String,
    pub expected: String,
    pub actual: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FirewallSnapshot {
    pub configured: bool,
    pub expected_enabled: bool,
    pub active: Option<bool>,
    pub rules: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub state_version: String,
    pub reconcile_mode: String,
    pub watchers_enabled: bool,
    pub compliance: ComplianceSummary,
    pub services: Vec<ServiceSnapshot>,
    pub sysctl: Vec<SysctlSnapshot>,
    pub firewall: FirewallSnapshot,
    pub host: HostInfo,
}

async fn get_metrics(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    match app.collector.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn get_health() -> Json<Health> {
    Json(Health {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo::current())
}

async fn get_status(State(app): State<Arc<AppState>>) -> Json<Status> {
    let state = app.state.load();

    let mut services = Vec::with_capacity(state.services.len());
    for svc in &state.services {
        let live = app.services.check(&svc.name).await.ok();
        services.push(ServiceSnapshot {
            name: svc.name.clone(),
            expected_state: svc.state.as_str(),
            expected_enabled: svc.enabled,
            active: live.map(|s| s.active),
            enabled: live.map(|s| s.enabled),
        });
    }

    let mut keys: Vec<&String> = state.sysctl.keys().collect();
    keys.sort();
    let mut sysctl = Vec::with_capacity(keys.len());
    for key in keys {
        sysctl.push(SysctlSnapshot {
            key: key.clone(),
            expected: state.sysctl[key].clone(),
            actual: app.sysctl.check(key).await.ok(),
        });
    }

    let firewall = match app.firewall.check().await {
        Ok(live) => FirewallSnapshot {
            configured: state.firewall.is_configured(),
            expected_enabled: state.firewall.enabled,
            active: Some(live.active),
            rules: live.rules,
            error: None,
        },
        Err(e) => FirewallSnapshot {
            configured: state.firewall.is_configured(),
            expected_enabled: state.firewall.enabled,
            active: None,
            rules: Vec::new(),
            error: Some(e.to_string()),
        },
    };

    Json(Status {
        state_version: state.version.clone(),
        reconcile_mode: app.reconciler.mode().to_string(),
        watchers_enabled: app.watchers_enabled,
        compliance: app.collector.summary(),
        services,
        sysctl,
        firewall,
        host: HostInfo::gather(),
    })
}
