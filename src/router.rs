//! Hostname to app resolution for the request path

use crate::registry::{AppRegistry, Target};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a request should go, decided from its Host header
#[derive(Debug, Clone)]
pub enum Route {
    /// The dashboard and control API
    Dashboard,
    /// A configured app or one of its services
    Target(Target),
    /// Nothing matches; carries the normalized hostname
    Unknown(String),
}

pub struct HostRouter {
    registry: Arc<AppRegistry>,
    tld: String,
    dashboard_host: String,
}

impl HostRouter {
    pub fn new(registry: Arc<AppRegistry>, tld: &str, dashboard_host: &str) -> Self {
        Self {
            registry,
            tld: tld.trim_matches('.').to_lowercase(),
            dashboard_host: dashboard_host.to_lowercase(),
        }
    }

    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    /// Resolve a Host header value.
    ///
    /// On a miss the registry is reloaded once and the lookup retried, so a
    /// freshly added app file works without restarting.
    pub fn route(&self, host: &str) -> Route {
        let host = normalize_host(host);

        if host == "localhost" || host == "127.0.0.1" || host == "::1" {
            return Route::Dashboard;
        }

        let Some(name) = self.strip_tld(&host) else {
            debug!(host = %host, tld = %self.tld, "Host outside the configured TLD");
            return Route::Unknown(host);
        };

        if name == self.dashboard_host {
            return Route::Dashboard;
        }

        if let Some(target) = self.resolve(name) {
            return Route::Target(target);
        }

        debug!(host = %host, "No app matched, reloading registry");
        if let Err(e) = self.registry.reload() {
            warn!(error = %e, "Registry reload failed");
        }

        match self.resolve(name) {
            Some(target) => Route::Target(target),
            None => Route::Unknown(host),
        }
    }

    fn strip_tld<'a>(&self, host: &'a str) -> Option<&'a str> {
        let name = host.strip_suffix(self.tld.as_str())?.strip_suffix('.')?;
        (!name.is_empty()).then_some(name)
    }

    /// Try each candidate from the full name down to its last label:
    /// app name or alias first, then `service-app`.
    fn resolve(&self, name: &str) -> Option<Target> {
        let mut candidate = name;
        loop {
            if let Some(app) = self.registry.get(candidate) {
                return Some(Target::app(app));
            }

            if let Some((service, app)) = candidate.split_once('-') {
                if let Some(target) = self.registry.find_service(app, service) {
                    return Some(target);
                }
            }

            match candidate.split_once('.') {
                Some((_, parent)) => candidate = parent,
                None => return None,
            }
        }
    }
}

/// Lowercase, drop the port and any trailing dot
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_lowercase();

    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8080
        rest.split(']').next().unwrap_or(rest).to_string()
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
            _ => host.clone(),
        }
    };

    without_port.trim_end_matches('.').to_string()
}
