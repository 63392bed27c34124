//! Point-in-time status of every configured app

use crate::config::{AppConfig, AppKind, AppType};
use crate::deps::dependency_closure;
use crate::registry::{service_process_name, AppRegistry};
use crate::supervisor::{ProcessState, ProcessSupervisor};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Builds the URLs users open in a browser
#[derive(Debug, Clone)]
pub struct Urls {
    tld: String,
    port: u16,
}

impl Urls {
    pub fn new(tld: &str, advertised_port: u16) -> Self {
        Self {
            tld: tld.trim_matches('.').to_lowercase(),
            port: advertised_port,
        }
    }

    pub fn host(&self, label: &str) -> String {
        format!("{}.{}", label, self.tld)
    }

    pub fn for_label(&self, label: &str) -> String {
        if self.port == 80 {
            format!("http://{}", self.host(label))
        } else {
            format!("http://{}:{}", self.host(label), self.port)
        }
    }

    pub fn for_service(&self, app: &str, service: &str) -> String {
        self.for_label(&service_process_name(app, service))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub apps: Vec<AppStatus>,
}

impl StatusSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"apps":[]}"#.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: AppType,
    pub url: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Present for command apps
    #[serde(flatten)]
    pub process: Option<ProcessStatus>,
    /// Present for multi-service apps
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub url: String,
    pub default: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub process: ProcessStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub state: &'static str,
    pub running: bool,
    pub starting: bool,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ProcessStatus {
    fn idle() -> Self {
        Self::from_state(&ProcessState::Idle)
    }

    fn from_state(state: &ProcessState) -> Self {
        Self {
            state: state.as_str(),
            running: *state == ProcessState::Running,
            starting: *state == ProcessState::Starting,
            failed: state.failure().is_some(),
            error: state.failure().map(str::to_string),
            port: None,
            pid: None,
            started_at: None,
        }
    }

    /// Status of whatever the supervisor tracks under `name`
    pub fn of(supervisor: &ProcessSupervisor, name: &str) -> Self {
        match supervisor.get(name) {
            Some(process) => Self {
                port: Some(process.port()),
                pid: process.pid(),
                started_at: Some(process.started_at()),
                ..Self::from_state(&process.state())
            },
            None => Self::idle(),
        }
    }

    fn escalate_to_starting(&mut self) {
        self.state = ProcessState::Starting.as_str();
        self.running = false;
        self.starting = true;
    }

    fn escalate_to_failed(&mut self, error: String) {
        self.state = "failed";
        self.running = false;
        self.starting = false;
        self.failed = true;
        self.error = Some(error);
    }
}

/// Status of one app as the supervisor currently sees it
pub fn app_status(app: &AppConfig, supervisor: &ProcessSupervisor, urls: &Urls) -> AppStatus {
    let (process, services) = match &app.kind {
        AppKind::Command(_) => (Some(ProcessStatus::of(supervisor, &app.name)), Vec::new()),
        AppKind::Multi { services, .. } => {
            let services = services
                .values()
                .map(|service| ServiceStatus {
                    name: service.name.clone(),
                    url: urls.for_service(&app.name, &service.name),
                    default: service.default,
                    depends_on: service.depends_on.clone(),
                    process: ProcessStatus::of(
                        supervisor,
                        &service_process_name(&app.name, &service.name),
                    ),
                })
                .collect();
            (None, services)
        }
        AppKind::Port { .. } | AppKind::Static { .. } => (None, Vec::new()),
    };

    AppStatus {
        name: app.name.clone(),
        app_type: app.app_type(),
        url: urls.for_label(&app.name),
        aliases: app.aliases.clone(),
        description: app.description.clone(),
        process,
        services,
    }
}

/// Like [`app_status`], but a service only counts as running once everything
/// it depends on is running, and a failed dependency fails its dependents.
pub fn app_status_with_dependencies(
    app: &AppConfig,
    supervisor: &ProcessSupervisor,
    urls: &Urls,
) -> AppStatus {
    let mut status = app_status(app, supervisor, urls);
    let Some(services) = app.services() else {
        return status;
    };

    let raw: Vec<ServiceStatus> = status.services.clone();
    let state_of = |name: &str| raw.iter().find(|s| s.name == name).map(|s| &s.process);

    for service in status.services.iter_mut() {
        if !service.process.running && !service.process.starting {
            continue;
        }
        let deps = dependency_closure(services, &service.name);

        let failed_dep = deps
            .iter()
            .find_map(|dep| state_of(dep.as_str()).filter(|s| s.failed).map(|s| (dep, s)));
        if let Some((dep, dep_status)) = failed_dep {
            let reason = dep_status.error.as_deref().unwrap_or("unknown error");
            service
                .process
                .escalate_to_failed(format!("dependency '{}' failed: {}", dep, reason));
            continue;
        }

        let waiting = deps
            .iter()
            .any(|dep| state_of(dep.as_str()).is_some_and(|s| !s.running));
        if service.process.running && waiting {
            service.process.escalate_to_starting();
        }
    }

    status
}

/// Snapshot of every non-hidden app
pub fn build_snapshot(
    registry: &AppRegistry,
    supervisor: &ProcessSupervisor,
    urls: &Urls,
) -> StatusSnapshot {
    let apps = registry
        .all()
        .iter()
        .filter(|app| !app.hidden)
        .map(|app| app_status(app, supervisor, urls))
        .collect();
    StatusSnapshot { apps }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaunchSpec, ServiceConfig, SupervisorConfig};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Duration;

    fn supervisor(port_range_start: u16) -> Arc<ProcessSupervisor> {
        ProcessSupervisor::new(SupervisorConfig {
            port_range_start,
            port_range_end: port_range_start + 20,
            readiness_timeout_secs: 5,
            probe_interval_ms: 20,
            shutdown_grace_period_ms: 200,
            shell: Some("/bin/sh".to_string()),
            shell_args: vec!["-c".to_string()],
            ..Default::default()
        })
    }

    async fn wait_for_state(supervisor: &ProcessSupervisor, name: &str, state: &str) {
        for _ in 0..150 {
            if supervisor.state(name).as_str() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never reached {}", name, state);
    }

    #[test]
    fn test_urls() {
        let urls = Urls::new("test", 80);
        assert_eq!(urls.for_label("blog"), "http://blog.test");
        assert_eq!(urls.for_service("shop", "web"), "http://web-shop.test");

        let urls = Urls::new(".localhost", 8080);
        assert_eq!(urls.for_label("blog"), "http://blog.localhost:8080");
    }

    #[test]
    fn test_snapshot_skips_hidden_apps() {
        let mut hidden = AppConfig::port("secret", 3001);
        hidden.hidden = true;
        let registry = AppRegistry::with_apps(vec![
            AppConfig::port("api", 3000),
            AppConfig::command("blog", LaunchSpec::new("hugo")),
            hidden,
        ]);
        let supervisor = supervisor(44000);
        let snapshot = build_snapshot(&registry, &supervisor, &Urls::new("test", 80));

        assert_eq!(snapshot.apps.len(), 2);
        assert_eq!(snapshot.apps[0].name, "api");
        assert!(snapshot.apps[0].process.is_none());

        let blog = snapshot.apps[1].process.as_ref().unwrap();
        assert_eq!(blog.state, "idle");
        assert!(!blog.running && !blog.starting && !blog.failed);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let registry = AppRegistry::with_apps(vec![AppConfig::multi(
            "shop",
            vec![ServiceConfig::new("web", "run").as_default()],
        )]);
        let supervisor = supervisor(44030);
        let json = build_snapshot(&registry, &supervisor, &Urls::new("test", 80)).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        let shop = &value["apps"][0];
        assert_eq!(shop["type"], "multi");
        assert_eq!(shop["url"], "http://shop.test");
        assert_eq!(shop["services"][0]["name"], "web");
        assert_eq!(shop["services"][0]["default"], true);
        assert_eq!(shop["services"][0]["running"], false);
        assert_eq!(shop["services"][0]["url"], "http://web-shop.test");
        assert!(shop.get("running").is_none());
    }

    #[tokio::test]
    async fn test_failed_process_reports_error() {
        let registry = AppRegistry::with_apps(vec![AppConfig::command(
            "broken",
            LaunchSpec::new("exit 1"),
        )]);
        let supervisor = supervisor(44060);
        supervisor
            .start_async("broken", &LaunchSpec::new("exit 1"))
            .unwrap();
        wait_for_state(&supervisor, "broken", "failed").await;

        let status = app_status(&registry.all()[0], &supervisor, &Urls::new("test", 80));
        let process = status.process.unwrap();
        assert!(process.failed);
        assert!(process.error.unwrap().contains("exited before becoming ready"));
        assert!(process.port.is_some());
    }

    #[tokio::test]
    async fn test_running_service_waits_for_dependency() {
        let app = AppConfig::multi(
            "shop",
            vec![
                ServiceConfig::new("web", "sleep 60").depends_on(&["api"]),
                ServiceConfig::new("api", "sleep 60"),
            ],
        );
        let supervisor = supervisor(44090);
        let urls = Urls::new("test", 80);

        let web = supervisor
            .start_async("web-shop", &LaunchSpec::new("sleep 60"))
            .unwrap();
        supervisor
            .start_async("api-shop", &LaunchSpec::new("sleep 60"))
            .unwrap();
        let _web_listener = TcpListener::bind(("127.0.0.1", web.port())).unwrap();
        wait_for_state(&supervisor, "web-shop", "running").await;

        let plain = app_status(&app, &supervisor, &urls);
        let web_plain = plain.services.iter().find(|s| s.name == "web").unwrap();
        assert!(web_plain.process.running);

        let escalated = app_status_with_dependencies(&app, &supervisor, &urls);
        let web_status = escalated.services.iter().find(|s| s.name == "web").unwrap();
        assert!(!web_status.process.running);
        assert!(web_status.process.starting);
        assert_eq!(web_status.process.state, "starting");

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_failed_dependency_fails_dependent() {
        let app = AppConfig::multi(
            "shop",
            vec![
                ServiceConfig::new("web", "sleep 60").depends_on(&["api"]),
                ServiceConfig::new("api", "exit 1"),
            ],
        );
        let supervisor = supervisor(44120);
        supervisor
            .start_async("web-shop", &LaunchSpec::new("sleep 60"))
            .unwrap();
        supervisor
            .start_async("api-shop", &LaunchSpec::new("exit 1"))
            .unwrap();
        wait_for_state(&supervisor, "api-shop", "failed").await;

        let status = app_status_with_dependencies(&app, &supervisor, &Urls::new("test", 80));
        let web = status.services.iter().find(|s| s.name == "web").unwrap();
        assert!(web.process.failed);
        assert!(web.process.error.as_deref().unwrap().starts_with("dependency 'api' failed"));

        supervisor.stop_all().await;
    }
}
