//! Shared gateway state and app-level lifecycle operations
//!
//! The request path and the control API both work in terms of apps and
//! services rather than raw process names. This module turns a resolved
//! [`Target`] into supervisor calls: starting dependencies first, fanning a
//! stop or restart out over every service of a multi-service app, and merging
//! their logs.

use crate::broadcast::StatusBroadcaster;
use crate::config::ServerConfig;
use crate::deps::{dependency_closure, resolve_order};
use crate::error::SupervisorError;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::{service_process_name, AppRegistry, Target};
use crate::router::HostRouter;
use crate::status::{app_status_with_dependencies, build_snapshot, AppStatus, StatusSnapshot, Urls};
use crate::supervisor::{ManagedProcess, ProcessSupervisor};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct AppContext {
    settings: ServerConfig,
    registry: Arc<AppRegistry>,
    router: HostRouter,
    supervisor: Arc<ProcessSupervisor>,
    broadcaster: StatusBroadcaster,
    pool: ConnectionPool,
    urls: Urls,
}

impl AppContext {
    pub fn new(
        settings: ServerConfig,
        registry: Arc<AppRegistry>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Arc<Self> {
        let tld = settings.normalized_tld();
        let router = HostRouter::new(Arc::clone(&registry), &tld, &settings.dashboard_host);
        let urls = Urls::new(&tld, settings.advertised_port);
        let pool = ConnectionPool::new(PoolConfig::from(&settings));

        Arc::new(Self {
            settings,
            registry,
            router,
            supervisor,
            broadcaster: StatusBroadcaster::default(),
            pool,
            urls,
        })
    }

    pub fn settings(&self) -> &ServerConfig {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &HostRouter {
        &self.router
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.broadcaster
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn urls(&self) -> &Urls {
        &self.urls
    }

    /// URL of the control API endpoint that restarts `name`
    pub fn restart_url(&self, name: &str) -> String {
        format!(
            "{}/api/restart?name={}",
            self.urls.for_label(&self.settings.dashboard_host),
            urlencoding::encode(name)
        )
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        build_snapshot(&self.registry, &self.supervisor, &self.urls)
    }

    pub fn app_status(&self, target: &Target) -> AppStatus {
        app_status_with_dependencies(&target.app, &self.supervisor, &self.urls)
    }

    /// Push the current snapshot to every dashboard subscriber
    pub fn publish_status(&self) {
        if self.broadcaster.subscriber_count() == 0 {
            return;
        }
        self.broadcaster.publish(self.snapshot().to_json());
    }

    /// Relay supervisor state changes to dashboard subscribers until cancelled
    pub fn spawn_status_relay(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let ctx = Arc::clone(self);
        let mut changes = self.supervisor.subscribe_changes();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) => {
                            debug!(name = %change.name, state = change.state.as_str(), "Publishing state change");
                            ctx.publish_status();
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Status relay lagged, publishing latest snapshot");
                            ctx.publish_status();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Start a target without waiting for it.
    ///
    /// A service's dependencies are started first, in dependency order, and
    /// their failures are only logged. A bare multi-service app starts every
    /// service. Returns the target's own process when it has one.
    pub fn start_target(
        &self,
        target: &Target,
    ) -> Result<Option<Arc<ManagedProcess>>, SupervisorError> {
        if target.service.is_none() {
            if let Some(services) = target.app.services() {
                for name in resolve_order(services) {
                    self.start_service_quietly(target, &name);
                }
                return Ok(None);
            }
        }

        self.start_dependencies(target);
        match target.launch() {
            Some(launch) => self
                .supervisor
                .start_async(&target.process_name(), launch)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Make sure everything a service depends on is at least starting
    pub fn start_dependencies(&self, target: &Target) {
        let (Some(service), Some(services)) = (&target.service, target.app.services()) else {
            return;
        };
        for dep in dependency_closure(services, service) {
            self.start_service_quietly(target, &dep);
        }
    }

    fn start_service_quietly(&self, target: &Target, service: &str) {
        let Some(config) = target.app.service(service) else {
            return;
        };
        let name = service_process_name(&target.app.name, service);
        if let Err(e) = self.supervisor.start_async(&name, &config.launch) {
            warn!(name = %name, error = %e, "Failed to start service");
        }
    }

    /// Stop a target's process, or every service of a bare multi-service app.
    ///
    /// Returns how many processes were stopped. Stopping an app whose
    /// services are all idle is not an error.
    pub async fn stop_target(&self, target: &Target) -> Result<usize, SupervisorError> {
        if target.service.is_none() {
            if let Some(services) = target.app.services() {
                let mut stopped = 0;
                for service in services.keys() {
                    let name = service_process_name(&target.app.name, service);
                    match self.supervisor.stop(&name).await {
                        Ok(()) => stopped += 1,
                        Err(SupervisorError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                info!(app = %target.app.name, stopped, "Stopped app services");
                return Ok(stopped);
            }
        }

        self.supervisor.stop(&target.process_name()).await?;
        Ok(1)
    }

    /// Stop then start again with the launch settings currently configured.
    ///
    /// An idle target is simply started.
    pub async fn restart_target(
        &self,
        target: &Target,
    ) -> Result<Option<Arc<ManagedProcess>>, SupervisorError> {
        match self.stop_target(target).await {
            Ok(0) | Err(SupervisorError::NotFound(_)) => {}
            Ok(_) => tokio::time::sleep(self.supervisor.config().restart_delay()).await,
            Err(e) => return Err(e),
        }
        info!(name = %target.process_name(), "Restarting");
        self.start_target(target)
    }

    /// Buffered output of a target.
    ///
    /// For a bare multi-service app the lines of every tracked service are
    /// concatenated in start order, each prefixed with `[service]`. `None`
    /// means the target has no tracked process.
    pub fn logs(&self, target: &Target) -> Option<Vec<String>> {
        if target.service.is_none() {
            if let Some(services) = target.app.services() {
                let mut merged = Vec::new();
                for service in resolve_order(services) {
                    let name = service_process_name(&target.app.name, &service);
                    if let Some(lines) = self.supervisor.logs(&name) {
                        merged.extend(lines.into_iter().map(|l| format!("[{}] {}", service, l)));
                    }
                }
                return Some(merged);
            }
        }
        self.supervisor.logs(&target.process_name())
    }
}
