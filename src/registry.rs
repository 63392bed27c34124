//! Reloadable registry of configured apps
//!
//! The registry holds an immutable snapshot of every app plus an alias index.
//! `reload` builds a fresh snapshot from the [`AppSource`] and swaps it in, so
//! readers never observe a half-loaded set. A failed reload keeps the previous
//! snapshot.

use crate::config::{AppConfig, Config, LaunchSpec, RawApp};
use crate::error::LookupError;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where app definitions come from
pub trait AppSource: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<AppConfig>>;
}

/// Inline `[apps.*]` tables of the config file plus one file per app in the apps directory
pub struct ConfigSource {
    config_path: Option<PathBuf>,
    inline: BTreeMap<String, RawApp>,
    apps_dir: Option<PathBuf>,
}

impl ConfigSource {
    /// `config_path` is re-read on every load when set; otherwise the inline
    /// apps of `config` are used as they are.
    pub fn new(config_path: Option<PathBuf>, config: &Config) -> Self {
        Self {
            config_path,
            inline: config.apps.clone(),
            apps_dir: config.server.apps_dir_path(),
        }
    }

    fn load_apps_dir(dir: &Path) -> Vec<AppConfig> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Apps directory not readable");
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut apps = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| toml::from_str::<RawApp>(&content).map_err(|e| e.to_string()))
                .and_then(|raw| raw.into_app(stem));
            match parsed {
                Ok(app) => apps.push(app),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid app file"),
            }
        }
        apps
    }
}

impl AppSource for ConfigSource {
    fn load(&self) -> anyhow::Result<Vec<AppConfig>> {
        let inline = match &self.config_path {
            Some(path) if path.exists() => Config::load(path)?.apps,
            _ => self.inline.clone(),
        };

        let mut apps = Vec::with_capacity(inline.len());
        for (key, raw) in inline {
            apps.push(raw.into_app(&key).map_err(|e| anyhow::anyhow!(e))?);
        }
        if let Some(dir) = &self.apps_dir {
            apps.extend(Self::load_apps_dir(dir));
        }
        Ok(apps)
    }
}

/// Fixed set of apps, mostly useful in tests
pub struct StaticSource {
    apps: RwLock<Vec<AppConfig>>,
}

impl StaticSource {
    pub fn new(apps: Vec<AppConfig>) -> Self {
        Self {
            apps: RwLock::new(apps),
        }
    }

    /// Replace the apps returned by the next load
    pub fn set(&self, apps: Vec<AppConfig>) {
        *self.apps.write() = apps;
    }
}

impl AppSource for StaticSource {
    fn load(&self) -> anyhow::Result<Vec<AppConfig>> {
        Ok(self.apps.read().clone())
    }
}

impl<T: AppSource + ?Sized> AppSource for Arc<T> {
    fn load(&self) -> anyhow::Result<Vec<AppConfig>> {
        (**self).load()
    }
}

/// A resolved app, optionally narrowed to one of its services
#[derive(Debug, Clone)]
pub struct Target {
    pub app: Arc<AppConfig>,
    pub service: Option<String>,
}

impl Target {
    pub fn app(app: Arc<AppConfig>) -> Self {
        Self { app, service: None }
    }

    pub fn service(app: Arc<AppConfig>, service: impl Into<String>) -> Self {
        Self {
            app,
            service: Some(service.into()),
        }
    }

    /// Key under which the supervisor tracks this target's process
    pub fn process_name(&self) -> String {
        match &self.service {
            Some(service) => service_process_name(&self.app.name, service),
            None => self.app.name.clone(),
        }
    }

    /// Launch settings, for targets backed by a managed process
    pub fn launch(&self) -> Option<&LaunchSpec> {
        match &self.service {
            Some(service) => self.app.service(service).map(|s| &s.launch),
            None => match &self.app.kind {
                crate::config::AppKind::Command(launch) => Some(launch),
                _ => None,
            },
        }
    }
}

/// Canonical `service-app` process name
pub fn service_process_name(app: &str, service: &str) -> String {
    format!("{}-{}", service, app)
}

#[derive(Default)]
struct Snapshot {
    apps: BTreeMap<String, Arc<AppConfig>>,
    /// alias -> app name
    aliases: HashMap<String, String>,
}

impl Snapshot {
    fn build(apps: Vec<AppConfig>) -> Self {
        let mut snapshot = Snapshot::default();
        for app in apps {
            if snapshot.apps.contains_key(&app.name) {
                warn!(app = %app.name, "Duplicate app name, keeping the first definition");
                continue;
            }
            for alias in &app.aliases {
                if let Some(owner) = snapshot.aliases.get(alias) {
                    warn!(alias = %alias, app = %app.name, owner = %owner, "Alias already taken");
                    continue;
                }
                snapshot.aliases.insert(alias.clone(), app.name.clone());
            }
            snapshot.apps.insert(app.name.clone(), Arc::new(app));
        }
        snapshot
    }
}

/// In-memory app registry shared by the router and the control plane
pub struct AppRegistry {
    source: Box<dyn AppSource>,
    snapshot: RwLock<Snapshot>,
}

impl AppRegistry {
    /// Create a registry and perform the initial load
    pub fn new(source: impl AppSource + 'static) -> anyhow::Result<Self> {
        let registry = Self {
            source: Box::new(source),
            snapshot: RwLock::new(Snapshot::default()),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Registry over a fixed list of apps
    pub fn with_apps(apps: Vec<AppConfig>) -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::build(apps.clone())),
            source: Box::new(StaticSource::new(apps)),
        }
    }

    /// Re-read every app from the source. Returns the number of apps loaded.
    pub fn reload(&self) -> anyhow::Result<usize> {
        let apps = self.source.load()?;
        let snapshot = Snapshot::build(apps);
        let count = snapshot.apps.len();
        *self.snapshot.write() = snapshot;
        info!(apps = count, "App registry loaded");
        Ok(count)
    }

    /// Look up an app by name or alias
    pub fn get(&self, name: &str) -> Option<Arc<AppConfig>> {
        let name = name.to_lowercase();
        let snapshot = self.snapshot.read();
        if let Some(app) = snapshot.apps.get(&name) {
            return Some(Arc::clone(app));
        }
        snapshot
            .aliases
            .get(&name)
            .and_then(|owner| snapshot.apps.get(owner))
            .cloned()
    }

    /// Service `service` of multi-service app `app` (name or alias)
    pub fn find_service(&self, app: &str, service: &str) -> Option<Target> {
        let app = self.get(app)?;
        let service = service.to_lowercase();
        app.service(&service)?;
        Some(Target::service(app, service))
    }

    /// Every app, sorted by name
    pub fn all(&self) -> Vec<Arc<AppConfig>> {
        self.snapshot.read().apps.values().cloned().collect()
    }

    /// Resolve a user-supplied name to an app or service.
    ///
    /// Accepts an app name or alias, `app:service`, `service.app`,
    /// `service-app`, or a bare service name that only one app defines.
    pub fn resolve_name(&self, name: &str) -> Result<Target, LookupError> {
        let name = name.trim().to_lowercase();
        let not_found = || LookupError::NotFound(name.clone());

        if let Some((app, service)) = name.split_once(':') {
            return self.find_service(app, service).ok_or_else(not_found);
        }

        if let Some(app) = self.get(&name) {
            return Ok(Target::app(app));
        }

        // Service names never contain dots
        if let Some((service, app)) = name.split_once('.') {
            if let Some(target) = self.find_service(app, service) {
                return Ok(target);
            }
        }

        for (idx, _) in name.match_indices('-') {
            if let Some(target) = self.find_service(&name[idx + 1..], &name[..idx]) {
                return Ok(target);
            }
        }

        let mut matches: Vec<Target> = self
            .all()
            .into_iter()
            .filter(|app| app.service(&name).is_some())
            .map(|app| Target::service(app, name.clone()))
            .collect();
        match matches.len() {
            0 => Err(not_found()),
            1 => Ok(matches.remove(0)),
            _ => Err(LookupError::Ambiguous {
                candidates: matches.iter().map(Target::process_name).collect(),
                name,
            }),
        }
    }
}
