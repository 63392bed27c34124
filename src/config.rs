use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and hostname settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Process supervisor settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Apps declared inline, keyed by app name
    #[serde(default)]
    pub apps: BTreeMap<String, RawApp>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port the listener binds to (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port advertised in generated URLs (default: 80, which is omitted from URLs)
    #[serde(default = "default_listen_port")]
    pub advertised_port: u16,

    /// Top-level domain every app hostname is rooted under (default: test)
    #[serde(default = "default_tld")]
    pub tld: String,

    /// Hostname label of the dashboard and control API (default: devhost)
    #[serde(default = "default_dashboard_host")]
    pub dashboard_host: String,

    /// Directory holding one `*.toml` file per app
    pub apps_dir: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Maximum idle connections per backend port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Maximum time to wait for a proxied response in seconds (default: 120)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            advertised_port: default_listen_port(),
            tld: default_tld(),
            dashboard_host: default_dashboard_host(),
            apps_dir: None,
            pid_file: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    /// The TLD without leading dots, lowercased
    pub fn normalized_tld(&self) -> String {
        self.tld.trim_matches('.').to_lowercase()
    }

    /// Apps directory with `~` expanded, falling back to `~/.config/devhost/apps`
    pub fn apps_dir_path(&self) -> Option<PathBuf> {
        match &self.apps_dir {
            Some(dir) => Some(expand_tilde(dir)),
            None => dirs_next::home_dir().map(|home| home.join(".config/devhost/apps")),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// First port handed out to managed processes
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// End of the port range (exclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Time a launched process has to start accepting connections
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// Delay between readiness connect attempts
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_ms: u64,

    /// Pause between stop and start on restart
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Lines of output kept per process
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Shell used to launch commands (default: $SHELL, then /bin/sh)
    pub shell: Option<String>,

    /// Arguments passed to the shell before the command string
    #[serde(default = "default_shell_args")]
    pub shell_args: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            readiness_timeout_secs: default_readiness_timeout(),
            probe_interval_ms: default_probe_interval(),
            shutdown_grace_period_ms: default_shutdown_grace_period(),
            restart_delay_ms: default_restart_delay(),
            log_capacity: default_log_capacity(),
            shell: None,
            shell_args: default_shell_args(),
        }
    }
}

impl SupervisorConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Resolve the launch shell
    pub fn shell_program(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.port_range_start == 0 || self.port_range_end <= self.port_range_start {
            return Err(format!(
                "supervisor: invalid port range {}..{}",
                self.port_range_start, self.port_range_end
            ));
        }
        Ok(())
    }
}

/// App type as written in configuration
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    /// Something already listening on a fixed local port
    Port,
    /// A command started on demand
    Command,
    /// Files served from disk
    Static,
    /// Several named services sharing one root directory
    Multi,
}

/// App table as it appears in TOML, before validation
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawApp {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub app_type: Option<AppType>,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    pub port: Option<u16>,
    pub command: Option<String>,
    pub dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub path: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, RawService>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawService {
    pub command: Option<String>,
    pub dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub default: bool,
}

/// Everything needed to launch one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            dir: None,
            env: HashMap::new(),
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// One service of a multi-service app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    pub launch: LaunchSpec,
    pub depends_on: Vec<String>,
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppKind {
    Port { port: u16 },
    Command(LaunchSpec),
    Static { path: PathBuf },
    Multi {
        dir: Option<PathBuf>,
        services: BTreeMap<String, ServiceConfig>,
    },
}

/// A validated app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub hidden: bool,
    pub kind: AppKind,
}

impl AppConfig {
    pub fn new(name: impl Into<String>, kind: AppKind) -> Self {
        Self {
            name: name.into().to_lowercase(),
            aliases: Vec::new(),
            description: None,
            hidden: false,
            kind,
        }
    }

    pub fn port(name: &str, port: u16) -> Self {
        Self::new(name, AppKind::Port { port })
    }

    pub fn command(name: &str, launch: LaunchSpec) -> Self {
        Self::new(name, AppKind::Command(launch))
    }

    pub fn static_files(name: &str, path: impl Into<PathBuf>) -> Self {
        Self::new(name, AppKind::Static { path: path.into() })
    }

    pub fn multi(name: &str, services: Vec<ServiceConfig>) -> Self {
        let services = services
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        Self::new(name, AppKind::Multi { dir: None, services })
    }

    /// Set aliases (builder pattern)
    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_lowercase()).collect();
        self
    }

    pub fn app_type(&self) -> AppType {
        match self.kind {
            AppKind::Port { .. } => AppType::Port,
            AppKind::Command(_) => AppType::Command,
            AppKind::Static { .. } => AppType::Static,
            AppKind::Multi { .. } => AppType::Multi,
        }
    }

    pub fn services(&self) -> Option<&BTreeMap<String, ServiceConfig>> {
        match &self.kind {
            AppKind::Multi { services, .. } => Some(services),
            _ => None,
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services().and_then(|s| s.get(name))
    }

    /// Service picked when a multi-service app is opened at its bare hostname:
    /// the only service, otherwise the one flagged `default`
    pub fn default_service(&self) -> Option<&ServiceConfig> {
        let services = self.services()?;
        if services.len() == 1 {
            return services.values().next();
        }
        services.values().find(|s| s.default)
    }
}

impl ServiceConfig {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            launch: LaunchSpec::new(command),
            depends_on: Vec::new(),
            default: false,
        }
    }

    /// Set dependencies (builder pattern)
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_lowercase()).collect();
        self
    }

    /// Mark as the default service (builder pattern)
    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

fn is_valid_label(name: &str, allow_dots: bool) -> bool {
    !name.is_empty()
        && !name.starts_with(|c| c == '-' || c == '.')
        && !name.ends_with(|c| c == '-' || c == '.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || (allow_dots && c == '.'))
}

impl RawApp {
    /// Validate and convert into an [`AppConfig`].
    ///
    /// `key` is the table key or file stem and names the app unless `name` is set.
    pub fn into_app(self, key: &str) -> Result<AppConfig, String> {
        let name = self.name.clone().unwrap_or_else(|| key.to_string()).to_lowercase();
        if !is_valid_label(&name, true) {
            return Err(format!("App '{}': name must be a valid hostname label", name));
        }

        let app_type = match self.app_type {
            Some(t) => t,
            None if !self.services.is_empty() => AppType::Multi,
            None if self.port.is_some() => AppType::Port,
            None if self.path.is_some() => AppType::Static,
            None if self.command.is_some() => AppType::Command,
            None => {
                return Err(format!(
                    "App '{}': cannot infer type, set one of 'port', 'command', 'path' or 'services'",
                    name
                ))
            }
        };

        let dir = self.dir.as_deref().map(expand_tilde);

        let kind = match app_type {
            AppType::Port => match self.port {
                Some(port) if port > 0 => AppKind::Port { port },
                _ => return Err(format!("App '{}': port app requires a non-zero 'port'", name)),
            },
            AppType::Command => {
                let command = self
                    .command
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| format!("App '{}': command app requires 'command'", name))?;
                AppKind::Command(LaunchSpec {
                    command,
                    dir,
                    env: self.env,
                })
            }
            AppType::Static => {
                let path = self
                    .path
                    .ok_or_else(|| format!("App '{}': static app requires 'path'", name))?;
                AppKind::Static {
                    path: expand_tilde(&path),
                }
            }
            AppType::Multi => {
                if self.services.is_empty() {
                    return Err(format!("App '{}': multi app requires at least one service", name));
                }
                let mut services = BTreeMap::new();
                for (service_name, raw) in self.services {
                    let service_name = service_name.to_lowercase();
                    if !is_valid_label(&service_name, false) {
                        return Err(format!(
                            "App '{}': service '{}' must be a valid hostname label without dots",
                            name, service_name
                        ));
                    }
                    let command = raw.command.filter(|c| !c.trim().is_empty()).ok_or_else(|| {
                        format!("App '{}': service '{}' requires 'command'", name, service_name)
                    })?;
                    let service_dir = match (&dir, raw.dir.as_deref()) {
                        (_, Some(d)) if d.starts_with('/') || d.starts_with('~') => {
                            Some(expand_tilde(d))
                        }
                        (Some(root), Some(d)) => Some(root.join(d)),
                        (None, Some(d)) => Some(PathBuf::from(d)),
                        (root, None) => root.clone(),
                    };
                    let mut env = self.env.clone();
                    env.extend(raw.env);
                    services.insert(
                        service_name.clone(),
                        ServiceConfig {
                            name: service_name,
                            launch: LaunchSpec {
                                command,
                                dir: service_dir,
                                env,
                            },
                            depends_on: raw.depends_on.iter().map(|d| d.to_lowercase()).collect(),
                            default: raw.default,
                        },
                    );
                }
                AppKind::Multi { dir, services }
            }
        };

        let mut aliases = Vec::new();
        for alias in &self.aliases {
            let alias = alias.to_lowercase();
            if !is_valid_label(&alias, true) {
                return Err(format!("App '{}': alias '{}' is not a valid hostname", name, alias));
            }
            aliases.push(alias);
        }

        Ok(AppConfig {
            name,
            aliases,
            description: self.description,
            hidden: self.hidden,
            kind,
        })
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs_next::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default config location: `~/.config/devhost/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(".config/devhost/config.toml"))
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_tld() -> String {
    "test".to_string()
}

fn default_dashboard_host() -> String {
    "devhost".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    120 // dev servers can be slow to compile on first hit
}

fn default_port_range_start() -> u16 {
    41000
}

fn default_port_range_end() -> u16 {
    42000
}

fn default_readiness_timeout() -> u64 {
    30
}

fn default_probe_interval() -> u64 {
    100
}

fn default_shutdown_grace_period() -> u64 {
    2000
}

fn default_restart_delay() -> u64 {
    500
}

fn default_log_capacity() -> usize {
    crate::logbuf::DEFAULT_LOG_CAPACITY
}

fn default_shell_args() -> Vec<String> {
    // Login + interactive so version managers and PATH tweaks apply
    vec!["-l".to_string(), "-i".to_string(), "-c".to_string()]
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from the default location if it exists, or use defaults
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.supervisor.validate() {
            errors.push(e);
        }

        if self.server.normalized_tld().is_empty() {
            errors.push("server: 'tld' must not be empty".to_string());
        }

        for (key, app) in &self.apps {
            if let Err(e) = app.clone().into_app(key) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
